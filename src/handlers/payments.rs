use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::models::payment::Payment;
use crate::mpesa::CallbackEnvelope;
use crate::purchase::PurchaseRequest;
use crate::reconcile::{Outcome, ReconcileError, Trigger};
use crate::utils::error::AppError;
use crate::utils::response::success;
use crate::AppState;

pub async fn purchase(
    State(state): State<AppState>,
    Path(event_id): Path<uuid::Uuid>,
    Json(request): Json<PurchaseRequest>,
) -> Result<Response, AppError> {
    let receipt = state.orchestrator.reserve(event_id, request).await?;
    Ok(success(
        receipt,
        "Payment initiated successfully. Please complete on your phone.",
    )
    .into_response())
}

/// The provider's webhook contract: any non-200 response means "retry
/// delivery", so every business outcome is acknowledged with 200, even ones
/// that will never resolve. Only a lock timeout or a storage failure earns
/// a 5xx, where redelivery actually helps.
#[derive(Serialize)]
struct CallbackAck {
    #[serde(rename = "ResultCode")]
    result_code: i32,
    #[serde(rename = "ResultDesc")]
    result_desc: String,
}

fn ack(status: StatusCode, result_code: i32, desc: impl Into<String>) -> Response {
    (
        status,
        Json(CallbackAck {
            result_code,
            result_desc: desc.into(),
        }),
    )
        .into_response()
}

pub async fn mpesa_callback(
    State(state): State<AppState>,
    Json(envelope): Json<CallbackEnvelope>,
) -> Response {
    let callback = envelope.body.stk_callback;
    let reference = callback.checkout_request_id.clone();

    if reference.is_empty() {
        return ack(StatusCode::BAD_REQUEST, 1, "Missing CheckoutRequestID");
    }

    info!(reference, "Received M-Pesa callback");
    let result = callback.to_provider_result();

    match state
        .engine
        .reconcile(&reference, result, Trigger::Webhook)
        .await
    {
        Ok(Outcome::Settled(status)) => {
            ack(StatusCode::OK, 0, format!("Recorded as {}", status.as_str()))
        }
        Ok(Outcome::AlreadySettled) => ack(StatusCode::OK, 0, "Already processed"),
        Ok(Outcome::Ignored | Outcome::RetryLater { .. }) => ack(StatusCode::OK, 0, "Accepted"),
        // Won't resolve on redelivery; 200 avoids a retry storm. Already
        // logged as an operational alert by the engine.
        Err(ReconcileError::UnknownTransaction(_)) => ack(StatusCode::OK, 0, "Accepted"),
        Err(ReconcileError::LockTimeout(_)) => ack(
            StatusCode::SERVICE_UNAVAILABLE,
            1,
            "Transaction processing timeout",
        ),
        Err(e) => {
            error!(reference, error = %e, "Callback reconciliation failed");
            ack(StatusCode::SERVICE_UNAVAILABLE, 1, "Processing failed")
        }
    }
}

#[derive(Serialize)]
struct PaymentStatusView {
    status: String,
    receipt_number: Option<String>,
    failure_reason: Option<String>,
    paid_at: Option<DateTime<Utc>>,
}

/// Client-facing poll while the STK prompt settles out of band.
pub async fn payment_status(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Response, AppError> {
    let payment =
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE provider_reference = $1")
            .bind(&reference)
            .fetch_optional(&state.pool)
            .await?;

    let Some(payment) = payment else {
        return Err(AppError::NotFound(format!(
            "Payment not found for reference {reference}"
        )));
    };

    let view = PaymentStatusView {
        status: payment.status,
        receipt_number: payment.receipt_number,
        failure_reason: payment.failure_reason,
        paid_at: payment.paid_at,
    };
    Ok(success(view, "Payment status retrieved").into_response())
}
