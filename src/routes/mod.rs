use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::{create_cors_layer, security_headers};
use crate::handlers::{health_check, payments, tickets};
use crate::AppState;

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/events/:event_id/purchase", post(payments::purchase))
        .route("/payments/callback", post(payments::mpesa_callback))
        .route("/payments/:reference/status", get(payments::payment_status))
        .route("/tickets/checkin", post(tickets::check_in))
        .route("/tickets/:ticket_id", get(tickets::get_ticket))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(security_headers))
                .layer(create_cors_layer()),
        )
        .with_state(state)
}
