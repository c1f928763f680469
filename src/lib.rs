pub mod config;
pub mod handlers;
pub mod inventory;
pub mod models;
pub mod mpesa;
pub mod notify;
pub mod purchase;
pub mod reconcile;
pub mod routes;
pub mod utils;

use std::sync::Arc;

use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub orchestrator: Arc<purchase::PurchaseOrchestrator>,
    pub engine: Arc<reconcile::ReconciliationEngine>,
}
