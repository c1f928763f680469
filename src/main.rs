use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;

use tikiti_server::config::Config;
use tikiti_server::mpesa::MpesaClient;
use tikiti_server::notify::{
    HttpNotifier, LogNotifier, NotificationDispatcher, RetryingDispatcher,
};
use tikiti_server::purchase::PurchaseOrchestrator;
use tikiti_server::reconcile::expiry;
use tikiti_server::reconcile::lock::LockManager;
use tikiti_server::reconcile::poller::PollScheduler;
use tikiti_server::reconcile::store::PgStore;
use tikiti_server::reconcile::ReconciliationEngine;
use tikiti_server::routes::create_routes;
use tikiti_server::AppState;

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Successfully connected to database");

    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    tracing::info!("Migrations run successfully");

    let gateway = Arc::new(MpesaClient::new(config.mpesa.clone()));
    let locks = Arc::new(LockManager::new());

    let notifier: Arc<dyn NotificationDispatcher> = match &config.notifier_url {
        Some(url) => Arc::new(RetryingDispatcher::new(HttpNotifier::new(url.clone()))),
        None => Arc::new(LogNotifier),
    };

    let engine = Arc::new(ReconciliationEngine::new(
        Arc::new(PgStore::new(pool.clone())),
        locks.clone(),
        notifier,
    ));
    let poller = PollScheduler::new(engine.clone(), gateway.clone());
    let orchestrator = Arc::new(PurchaseOrchestrator::new(pool.clone(), gateway, poller));

    expiry::spawn_sweeper(pool.clone(), locks);

    let state = AppState {
        pool,
        orchestrator,
        engine,
    };
    let app: Router = create_routes(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.bind_port));
    tracing::info!("🚀 Server running at http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app).await.expect("Server failed");
}
