use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::models::ticket::{Ticket, TicketStatus};
use crate::utils::error::AppError;
use crate::utils::response::success;
use crate::AppState;

pub async fn get_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let ticket = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE id = $1")
        .bind(ticket_id)
        .fetch_optional(&state.pool)
        .await?;

    let Some(ticket) = ticket else {
        return Err(AppError::NotFound(format!("Ticket {ticket_id} not found")));
    };
    Ok(success(ticket, "Ticket retrieved").into_response())
}

#[derive(Deserialize)]
pub struct CheckInRequest {
    pub qr_token: Uuid,
}

#[derive(Serialize)]
struct CheckInReceipt {
    ticket_id: Uuid,
}

/// Check-in is the one transition outside the payment state machine:
/// `purchased` becomes `used`, once. A second scan of the same QR token
/// fails with the ticket's current state.
pub async fn check_in(
    State(state): State<AppState>,
    Json(request): Json<CheckInRequest>,
) -> Result<Response, AppError> {
    let updated = sqlx::query(
        "UPDATE tickets SET status = $1, updated_at = now() \
         WHERE qr_token = $2 AND status = $3 RETURNING id",
    )
    .bind(TicketStatus::Used.as_str())
    .bind(request.qr_token)
    .bind(TicketStatus::Purchased.as_str())
    .fetch_optional(&state.pool)
    .await?;

    if let Some(row) = updated {
        let receipt = CheckInReceipt {
            ticket_id: row.get("id"),
        };
        return Ok(success(receipt, "Ticket checked in").into_response());
    }

    let existing = sqlx::query("SELECT status FROM tickets WHERE qr_token = $1")
        .bind(request.qr_token)
        .fetch_optional(&state.pool)
        .await?;

    match existing {
        None => Err(AppError::NotFound("Ticket not found".to_string())),
        Some(row) => {
            let status: String = row.get("status");
            Err(AppError::ValidationError(format!(
                "Ticket is {status}, cannot check in"
            )))
        }
    }
}
