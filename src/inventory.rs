use sqlx::postgres::PgConnection;
use sqlx::Row;
use uuid::Uuid;

use crate::utils::error::AppError;

/// Remaining sellable units for a ticket type.
pub fn remaining(quantity: i32, sold: i32) -> i32 {
    (quantity - sold).max(0)
}

/// Reserve `quantity` units of a ticket type, incrementing its sold counter.
///
/// Runs inside the caller's transaction and takes the row lock before the
/// read-modify-write, so concurrent reservations of the same type cannot
/// lose updates or oversell. The availability check here is the
/// authoritative one; any earlier read-only check is advisory.
pub async fn reserve(
    conn: &mut PgConnection,
    ticket_type_id: Uuid,
    quantity: i32,
) -> Result<(), AppError> {
    let row = sqlx::query("SELECT quantity, sold FROM ticket_types WHERE id = $1 FOR UPDATE")
        .bind(ticket_type_id)
        .fetch_optional(&mut *conn)
        .await?;

    let Some(row) = row else {
        return Err(AppError::NotFound(format!(
            "Ticket type {ticket_type_id} not found"
        )));
    };

    let total: i32 = row.get("quantity");
    let sold: i32 = row.get("sold");
    let available = remaining(total, sold);

    if quantity > available {
        return Err(AppError::ValidationError(format!(
            "Only {available} available"
        )));
    }

    sqlx::query("UPDATE ticket_types SET sold = sold + $1, updated_at = now() WHERE id = $2")
        .bind(quantity)
        .bind(ticket_type_id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// Return `quantity` reserved units to the pool after a terminal
/// non-success (cancel, failure, expiry, gateway compensation).
///
/// Single-statement decrement; the UPDATE itself takes the row lock.
/// Floored at zero so a stray double release cannot underflow the counter.
pub async fn release(
    conn: &mut PgConnection,
    ticket_type_id: Uuid,
    quantity: i32,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE ticket_types SET sold = GREATEST(sold - $1, 0), updated_at = now() WHERE id = $2",
    )
    .bind(quantity)
    .bind(ticket_type_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_never_negative() {
        assert_eq!(remaining(10, 3), 7);
        assert_eq!(remaining(10, 10), 0);
        // A sold count above quantity is a data bug, not sellable stock
        assert_eq!(remaining(10, 12), 0);
    }
}
