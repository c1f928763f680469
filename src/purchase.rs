use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{error, info};
use uuid::Uuid;

use crate::inventory;
use crate::models::event::Event;
use crate::models::payment::PaymentStatus;
use crate::models::ticket::{TicketStatus, TicketType};
use crate::models::user::{Attendee, User};
use crate::mpesa::{format_phone_number, MpesaClient};
use crate::reconcile::poller::PollScheduler;
use crate::utils::error::AppError;

pub const PAYMENT_METHOD_MPESA: &str = "mpesa";

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub user_id: Uuid,
    /// Falls back to the phone number on the user record when omitted.
    #[serde(default)]
    pub phone: Option<String>,
    pub total_amount: Decimal,
    pub items: Vec<PurchaseItem>,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseItem {
    pub ticket_type_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct PurchaseReceipt {
    pub provider_reference: String,
    pub ticket_ids: Vec<Uuid>,
}

/// Validate one order line against its ticket type. Pure; the same checks
/// re-run under the row lock at reservation time.
pub fn validate_line(
    ticket_type: &TicketType,
    event_id: Uuid,
    quantity: i32,
    now: DateTime<Utc>,
) -> Result<(), String> {
    if ticket_type.event_id != event_id {
        return Err(format!("{} does not belong to this event", ticket_type.name));
    }
    if quantity <= 0 {
        return Err("Quantity must be positive".to_string());
    }
    if !ticket_type.active {
        return Err(format!("{} is not on sale", ticket_type.name));
    }
    if let Some(from) = ticket_type.valid_from {
        if now < from {
            return Err(format!("{} is not on sale yet", ticket_type.name));
        }
    }
    if let Some(to) = ticket_type.valid_to {
        if now > to {
            return Err(format!("Sales for {} have closed", ticket_type.name));
        }
    }
    if let Some(limit) = ticket_type.per_person_limit {
        if quantity > limit {
            return Err(format!("{} is limited to {limit} per person", ticket_type.name));
        }
    }
    let available = ticket_type.available();
    if quantity > available {
        return Err(format!("Only {available} available"));
    }
    Ok(())
}

/// Entry point for ticket purchases: validates the order, reserves
/// inventory and pending rows, fires the STK push, and hands the provider
/// reference to the poll scheduler. Returns as soon as the charge is
/// initiated; settlement is asynchronous.
pub struct PurchaseOrchestrator {
    pool: PgPool,
    gateway: Arc<MpesaClient>,
    poller: Arc<PollScheduler>,
}

impl PurchaseOrchestrator {
    pub fn new(pool: PgPool, gateway: Arc<MpesaClient>, poller: Arc<PollScheduler>) -> Self {
        Self {
            pool,
            gateway,
            poller,
        }
    }

    pub async fn reserve(
        &self,
        event_id: Uuid,
        request: PurchaseRequest,
    ) -> Result<PurchaseReceipt, AppError> {
        if request.items.is_empty() {
            return Err(AppError::ValidationError(
                "No ticket details provided".to_string(),
            ));
        }

        let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(event) = event else {
            return Err(AppError::NotFound(format!("Event {event_id} not found")));
        };
        let currency = event.currency.clone();

        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(request.user_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(user) = user else {
            return Err(AppError::NotFound(format!(
                "User {} not found",
                request.user_id
            )));
        };
        let phone = request
            .phone
            .clone()
            .or_else(|| user.phone.clone())
            .ok_or_else(|| {
                AppError::ValidationError("No phone number on the order or user".to_string())
            })?;

        // Advisory validation pass: fail fast before any write. The
        // authoritative availability check happens again under FOR UPDATE.
        let now = Utc::now();
        let mut order_total = Decimal::ZERO;
        for item in &request.items {
            let ticket_type = sqlx::query_as::<_, TicketType>(
                "SELECT * FROM ticket_types WHERE id = $1",
            )
            .bind(item.ticket_type_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                AppError::ValidationError(format!(
                    "Invalid ticket type {}",
                    item.ticket_type_id
                ))
            })?;

            validate_line(&ticket_type, event_id, item.quantity, now)
                .map_err(AppError::ValidationError)?;
            order_total += ticket_type.price * Decimal::from(item.quantity);
        }

        if order_total != request.total_amount {
            return Err(AppError::ValidationError(format!(
                "Total amount mismatch: order is {order_total} {currency}"
            )));
        }

        // Reservation transaction: inventory, tickets and the pending
        // payment commit together, before any gateway traffic.
        let mut tx = self.pool.begin().await?;
        let attendee = get_or_create_attendee(&mut tx, user.id).await?;

        let placeholder = format!("local-{}", Uuid::new_v4());
        let payment_id: Uuid = sqlx::query(
            "INSERT INTO payments (method, status, provider_reference, amount, currency) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(PAYMENT_METHOD_MPESA)
        .bind(PaymentStatus::Pending.as_str())
        .bind(&placeholder)
        .bind(request.total_amount)
        .bind(&currency)
        .fetch_one(&mut *tx)
        .await?
        .get("id");

        let mut ticket_ids = Vec::with_capacity(request.items.len());
        for item in &request.items {
            inventory::reserve(&mut *tx, item.ticket_type_id, item.quantity).await?;

            let unit_price: Decimal =
                sqlx::query("SELECT price FROM ticket_types WHERE id = $1")
                    .bind(item.ticket_type_id)
                    .fetch_one(&mut *tx)
                    .await?
                    .get("price");

            let ticket_id: Uuid = sqlx::query(
                "INSERT INTO tickets \
                 (event_id, attendee_id, ticket_type_id, payment_id, quantity, price, currency, status) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
            )
            .bind(event_id)
            .bind(attendee.id)
            .bind(item.ticket_type_id)
            .bind(payment_id)
            .bind(item.quantity)
            .bind(unit_price * Decimal::from(item.quantity))
            .bind(&currency)
            .bind(TicketStatus::Pending.as_str())
            .fetch_one(&mut *tx)
            .await?
            .get("id");
            ticket_ids.push(ticket_id);
        }
        tx.commit().await?;

        // Gateway call with no database transaction or lock held.
        let phone = format_phone_number(&phone);
        let reference = match self.gateway.initiate(request.total_amount, &phone).await {
            Ok(reference) => reference,
            Err(e) => {
                error!(%payment_id, error = %e, "STK push failed, rolling back reservation");
                self.compensate(payment_id).await;
                return Err(AppError::GatewayError(format!(
                    "Payment initiation failed: {e}"
                )));
            }
        };

        if let Err(e) = sqlx::query("UPDATE payments SET provider_reference = $1, updated_at = now() WHERE id = $2")
            .bind(&reference)
            .bind(payment_id)
            .execute(&self.pool)
            .await
        {
            error!(%payment_id, error = %e, "Failed to record provider reference, rolling back");
            self.compensate(payment_id).await;
            return Err(AppError::DatabaseError(e));
        }

        info!(%payment_id, reference, "Charge initiated, awaiting confirmation");
        self.poller.schedule(reference.clone(), 1);

        Ok(PurchaseReceipt {
            provider_reference: reference,
            ticket_ids,
        })
    }

    /// Undo a committed reservation after the gateway refused the charge:
    /// release inventory, delete the tickets and the payment. If this fails
    /// the expiry sweeper reclaims the rows later.
    async fn compensate(&self, payment_id: Uuid) {
        if let Err(e) = self.compensate_inner(payment_id).await {
            error!(%payment_id, error = %e, "Reservation rollback failed, sweeper will reclaim");
        }
    }

    async fn compensate_inner(&self, payment_id: Uuid) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let tickets = sqlx::query(
            "DELETE FROM tickets WHERE payment_id = $1 RETURNING ticket_type_id, quantity",
        )
        .bind(payment_id)
        .fetch_all(&mut *tx)
        .await?;
        for ticket in tickets {
            let ticket_type_id: Uuid = ticket.get("ticket_type_id");
            let quantity: i32 = ticket.get("quantity");
            inventory::release(&mut *tx, ticket_type_id, quantity).await?;
        }

        sqlx::query("DELETE FROM payments WHERE id = $1")
            .bind(payment_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn get_or_create_attendee(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> Result<Attendee, AppError> {
    let attendee = sqlx::query_as::<_, Attendee>(
        "INSERT INTO attendees (user_id) VALUES ($1) \
         ON CONFLICT (user_id) DO UPDATE SET updated_at = now() \
         RETURNING *",
    )
    .bind(user_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(attendee)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ticket_type(event_id: Uuid) -> TicketType {
        let now = Utc::now();
        TicketType {
            id: Uuid::new_v4(),
            event_id,
            name: "Early Bird".to_string(),
            description: None,
            price: Decimal::new(50000, 2),
            currency: "KES".to_string(),
            quantity: 10,
            sold: 0,
            valid_from: None,
            valid_to: None,
            per_person_limit: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_validate_line_accepts_valid_order() {
        let event_id = Uuid::new_v4();
        let tt = ticket_type(event_id);
        assert!(validate_line(&tt, event_id, 2, Utc::now()).is_ok());
    }

    #[test]
    fn test_validate_line_rejects_wrong_event() {
        let tt = ticket_type(Uuid::new_v4());
        let err = validate_line(&tt, Uuid::new_v4(), 1, Utc::now()).unwrap_err();
        assert!(err.contains("does not belong"));
    }

    #[test]
    fn test_validate_line_rejects_inactive_type() {
        let event_id = Uuid::new_v4();
        let mut tt = ticket_type(event_id);
        tt.active = false;
        let err = validate_line(&tt, event_id, 1, Utc::now()).unwrap_err();
        assert!(err.contains("not on sale"));
    }

    #[test]
    fn test_validate_line_enforces_validity_window() {
        let event_id = Uuid::new_v4();
        let now = Utc::now();

        let mut tt = ticket_type(event_id);
        tt.valid_from = Some(now + Duration::hours(1));
        assert!(validate_line(&tt, event_id, 1, now).is_err());

        let mut tt = ticket_type(event_id);
        tt.valid_to = Some(now - Duration::hours(1));
        assert!(validate_line(&tt, event_id, 1, now).is_err());
    }

    #[test]
    fn test_validate_line_enforces_per_person_limit() {
        let event_id = Uuid::new_v4();
        let mut tt = ticket_type(event_id);
        tt.per_person_limit = Some(4);
        assert!(validate_line(&tt, event_id, 4, Utc::now()).is_ok());
        let err = validate_line(&tt, event_id, 5, Utc::now()).unwrap_err();
        assert!(err.contains("limited to 4"));
    }

    #[test]
    fn test_validate_line_reports_remaining_availability() {
        let event_id = Uuid::new_v4();
        let mut tt = ticket_type(event_id);
        tt.quantity = 2;
        tt.sold = 2;
        let err = validate_line(&tt, event_id, 1, Utc::now()).unwrap_err();
        assert_eq!(err, "Only 0 available");
    }

    #[test]
    fn test_validate_line_rejects_non_positive_quantity() {
        let event_id = Uuid::new_v4();
        let tt = ticket_type(event_id);
        assert!(validate_line(&tt, event_id, 0, Utc::now()).is_err());
        assert!(validate_line(&tt, event_id, -1, Utc::now()).is_err());
    }
}
