use std::sync::Arc;
use std::time::Duration;

use sqlx::{PgPool, Row};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::inventory;
use crate::models::payment::PaymentStatus;
use crate::models::ticket::TicketStatus;
use crate::utils::error::AppError;

use super::lock::LockManager;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// A reservation whose payment has not settled within this window is
/// abandoned; its inventory goes back on sale.
pub const PENDING_TTL_MINUTES: i64 = 30;

/// An active reconciliation owns the checkout; the sweeper skips rather
/// than queue behind it.
const SWEEP_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

pub const EXPIRED_REASON: &str = "reservation expired";

/// Spawn the background task that expires stale pending reservations.
pub fn spawn_sweeper(pool: PgPool, locks: Arc<LockManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match sweep(&pool, &locks).await {
                Ok(0) => {}
                Ok(expired) => info!(expired, "Expired stale pending reservations"),
                Err(e) => error!(error = %e, "Expiry sweep failed"),
            }
        }
    })
}

pub async fn sweep(pool: &PgPool, locks: &LockManager) -> Result<u64, AppError> {
    let rows = sqlx::query(
        "SELECT provider_reference FROM payments \
         WHERE status = $1 AND created_at < now() - make_interval(mins => $2)",
    )
    .bind(PaymentStatus::Pending.as_str())
    .bind(PENDING_TTL_MINUTES as i32)
    .fetch_all(pool)
    .await?;

    let mut expired = 0;
    for row in rows {
        let reference: String = row.get("provider_reference");
        let outcome = locks
            .with_lock(&reference, SWEEP_LOCK_TIMEOUT, || {
                expire_checkout(pool, &reference)
            })
            .await;
        match outcome {
            Ok(Ok(true)) => expired += 1,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => error!(reference, error = %e, "Failed to expire checkout"),
            Err(_) => warn!(reference, "Checkout busy, skipping this sweep"),
        }
    }

    Ok(expired)
}

/// Expire one checkout in a single transaction: the payment fails with the
/// expiry reason, its pending tickets expire, and the reservation is
/// released, provided the payment is still pending under the row lock.
async fn expire_checkout(pool: &PgPool, reference: &str) -> Result<bool, AppError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query("SELECT id, status FROM payments WHERE provider_reference = $1 FOR UPDATE")
        .bind(reference)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(row) = row else {
        return Ok(false);
    };
    let status: String = row.get("status");
    if PaymentStatus::parse(&status) != Some(PaymentStatus::Pending) {
        // settled between the scan and the lock
        return Ok(false);
    }
    let payment_id: Uuid = row.get("id");

    sqlx::query(
        "UPDATE payments SET status = $1, failure_reason = $2, updated_at = now() WHERE id = $3",
    )
    .bind(PaymentStatus::Failed.as_str())
    .bind(EXPIRED_REASON)
    .bind(payment_id)
    .execute(&mut *tx)
    .await?;

    let tickets = sqlx::query(
        "UPDATE tickets SET status = $1, updated_at = now() \
         WHERE payment_id = $2 AND status = $3 \
         RETURNING ticket_type_id, quantity",
    )
    .bind(TicketStatus::Expired.as_str())
    .bind(payment_id)
    .bind(TicketStatus::Pending.as_str())
    .fetch_all(&mut *tx)
    .await?;

    for ticket in tickets {
        let ticket_type_id: Uuid = ticket.get("ticket_type_id");
        let quantity: i32 = ticket.get("quantity");
        inventory::release(&mut *tx, ticket_type_id, quantity).await?;
    }

    tx.commit().await?;
    Ok(true)
}
