use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Ticket lifecycle. `pending` tickets become `purchased`, `payment_failed`,
/// `canceled` or `expired` depending on how their payment settles; a
/// `purchased` ticket becomes `used` at check-in. All transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    Purchased,
    PaymentFailed,
    Canceled,
    Expired,
    Used,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Pending => "pending",
            TicketStatus::Purchased => "purchased",
            TicketStatus::PaymentFailed => "payment_failed",
            TicketStatus::Canceled => "canceled",
            TicketStatus::Expired => "expired",
            TicketStatus::Used => "used",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TicketStatus::Pending),
            "purchased" => Some(TicketStatus::Purchased),
            "payment_failed" => Some(TicketStatus::PaymentFailed),
            "canceled" => Some(TicketStatus::Canceled),
            "expired" => Some(TicketStatus::Expired),
            "used" => Some(TicketStatus::Used),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TicketType {
    pub id: Uuid,
    pub event_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub currency: String,
    pub quantity: i32,
    pub sold: i32,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub per_person_limit: Option<i32>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TicketType {
    pub fn available(&self) -> i32 {
        self.quantity - self.sold
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Ticket {
    pub id: Uuid,
    pub event_id: Uuid,
    pub attendee_id: Uuid,
    pub ticket_type_id: Uuid,
    pub payment_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
    pub currency: String,
    pub status: String,
    pub qr_token: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            TicketStatus::Pending,
            TicketStatus::Purchased,
            TicketStatus::PaymentFailed,
            TicketStatus::Canceled,
            TicketStatus::Expired,
            TicketStatus::Used,
        ] {
            assert_eq!(TicketStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TicketStatus::parse("valid"), None);
    }
}
