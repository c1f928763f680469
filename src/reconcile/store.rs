use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use uuid::Uuid;

use crate::inventory;
use crate::models::payment::PaymentStatus;
use crate::models::ticket::TicketStatus;

/// The slice of a payment the engine needs to decide a transition.
#[derive(Debug, Clone)]
pub struct PaymentSnapshot {
    pub id: Uuid,
    pub status: PaymentStatus,
}

/// An atomic terminal transition of one checkout: payment, its tickets and
/// the inventory reservation move together in a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Complete {
        receipt: Option<String>,
        paid_at: Option<DateTime<Utc>>,
    },
    Cancel {
        reason: String,
    },
    Fail {
        reason: String,
    },
}

impl Settlement {
    pub fn payment_status(&self) -> PaymentStatus {
        match self {
            Settlement::Complete { .. } => PaymentStatus::Completed,
            Settlement::Cancel { .. } => PaymentStatus::Canceled,
            Settlement::Fail { .. } => PaymentStatus::Failed,
        }
    }

    fn ticket_status(&self) -> TicketStatus {
        match self {
            Settlement::Complete { .. } => TicketStatus::Purchased,
            Settlement::Cancel { .. } => TicketStatus::Canceled,
            Settlement::Fail { .. } => TicketStatus::PaymentFailed,
        }
    }

    /// Terminal non-success returns the reservation to the pool.
    fn releases_inventory(&self) -> bool {
        !matches!(self, Settlement::Complete { .. })
    }
}

/// A ticket that settled, with what the notifier needs.
#[derive(Debug, Clone)]
pub struct SettledTicket {
    pub ticket_id: Uuid,
    pub qr_token: Uuid,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("payment for {0} is already in a terminal state")]
    AlreadySettled(String),

    #[error("no payment recorded for reference {0}")]
    UnknownReference(String),

    #[error("payment for {0} has corrupt status text")]
    CorruptStatus(String),
}

/// Storage seam for the reconciliation engine. The Postgres implementation
/// re-checks terminal status under the payment row lock, so a settlement can
/// never be applied twice even if two engine instances raced past the
/// advisory lock.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    async fn load(&self, reference: &str) -> Result<Option<PaymentSnapshot>, StoreError>;

    async fn apply(
        &self,
        reference: &str,
        settlement: Settlement,
    ) -> Result<Vec<SettledTicket>, StoreError>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReconciliationStore for PgStore {
    async fn load(&self, reference: &str) -> Result<Option<PaymentSnapshot>, StoreError> {
        let row = sqlx::query("SELECT id, status FROM payments WHERE provider_reference = $1")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let status: String = row.get("status");
            let status = PaymentStatus::parse(&status)
                .ok_or_else(|| StoreError::CorruptStatus(reference.to_string()))?;
            Ok(PaymentSnapshot {
                id: row.get("id"),
                status,
            })
        })
        .transpose()
    }

    async fn apply(
        &self,
        reference: &str,
        settlement: Settlement,
    ) -> Result<Vec<SettledTicket>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, status FROM payments WHERE provider_reference = $1 FOR UPDATE",
        )
        .bind(reference)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::UnknownReference(reference.to_string()))?;

        let payment_id: Uuid = row.get("id");
        let status: String = row.get("status");
        let status = PaymentStatus::parse(&status)
            .ok_or_else(|| StoreError::CorruptStatus(reference.to_string()))?;
        if status.is_terminal() {
            return Err(StoreError::AlreadySettled(reference.to_string()));
        }

        match &settlement {
            Settlement::Complete { receipt, paid_at } => {
                sqlx::query(
                    "UPDATE payments \
                     SET status = $1, receipt_number = $2, paid_at = COALESCE($3, now()), \
                         updated_at = now() \
                     WHERE id = $4",
                )
                .bind(PaymentStatus::Completed.as_str())
                .bind(receipt)
                .bind(paid_at)
                .bind(payment_id)
                .execute(&mut *tx)
                .await?;
            }
            Settlement::Cancel { reason } | Settlement::Fail { reason } => {
                sqlx::query(
                    "UPDATE payments \
                     SET status = $1, failure_reason = $2, updated_at = now() \
                     WHERE id = $3",
                )
                .bind(settlement.payment_status().as_str())
                .bind(reason)
                .bind(payment_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        let tickets = settle_tickets(&mut tx, payment_id, &settlement).await?;

        tx.commit().await?;
        Ok(tickets)
    }
}

async fn settle_tickets(
    tx: &mut Transaction<'_, Postgres>,
    payment_id: Uuid,
    settlement: &Settlement,
) -> Result<Vec<SettledTicket>, StoreError> {
    let rows = sqlx::query(
        "UPDATE tickets SET status = $1, updated_at = now() \
         WHERE payment_id = $2 AND status = $3 \
         RETURNING id, qr_token, ticket_type_id, quantity",
    )
    .bind(settlement.ticket_status().as_str())
    .bind(payment_id)
    .bind(TicketStatus::Pending.as_str())
    .fetch_all(&mut **tx)
    .await?;

    let mut settled = Vec::with_capacity(rows.len());
    for row in rows {
        if settlement.releases_inventory() {
            let ticket_type_id: Uuid = row.get("ticket_type_id");
            let quantity: i32 = row.get("quantity");
            inventory::release(&mut **tx, ticket_type_id, quantity)
                .await
                .map_err(|e| match e {
                    crate::utils::error::AppError::DatabaseError(e) => StoreError::Database(e),
                    other => StoreError::Database(sqlx::Error::Protocol(other.to_string())),
                })?;
        }
        settled.push(SettledTicket {
            ticket_id: row.get("id"),
            qr_token: row.get("qr_token"),
        });
    }

    Ok(settled)
}

/// In-memory store mirroring the Postgres semantics, for engine tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct MemTicket {
        pub id: Uuid,
        pub qr_token: Uuid,
        pub ticket_type_id: Uuid,
        pub quantity: i32,
        pub status: TicketStatus,
    }

    #[derive(Debug, Clone)]
    pub struct MemPayment {
        pub id: Uuid,
        pub status: PaymentStatus,
        pub receipt: Option<String>,
        pub failure_reason: Option<String>,
        pub tickets: Vec<MemTicket>,
    }

    #[derive(Default)]
    pub struct MemoryStore {
        pub payments: Mutex<HashMap<String, MemPayment>>,
        /// ticket_type_id -> (quantity, sold)
        pub stock: Mutex<HashMap<Uuid, (i32, i32)>>,
    }

    impl MemoryStore {
        pub fn with_checkout(
            reference: &str,
            ticket_type_id: Uuid,
            quantity: i32,
            stock_quantity: i32,
        ) -> Self {
            let store = Self::default();
            store.stock.lock().unwrap().insert(
                ticket_type_id,
                // reservation already counted, matching reserve-at-initiate
                (stock_quantity, quantity),
            );
            store.payments.lock().unwrap().insert(
                reference.to_string(),
                MemPayment {
                    id: Uuid::new_v4(),
                    status: PaymentStatus::Pending,
                    receipt: None,
                    failure_reason: None,
                    tickets: vec![MemTicket {
                        id: Uuid::new_v4(),
                        qr_token: Uuid::new_v4(),
                        ticket_type_id,
                        quantity,
                        status: TicketStatus::Pending,
                    }],
                },
            );
            store
        }

        pub fn payment(&self, reference: &str) -> MemPayment {
            self.payments
                .lock()
                .unwrap()
                .get(reference)
                .expect("payment exists")
                .clone()
        }

        pub fn sold(&self, ticket_type_id: Uuid) -> i32 {
            self.stock
                .lock()
                .unwrap()
                .get(&ticket_type_id)
                .map(|(_, sold)| *sold)
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl ReconciliationStore for MemoryStore {
        async fn load(&self, reference: &str) -> Result<Option<PaymentSnapshot>, StoreError> {
            Ok(self
                .payments
                .lock()
                .unwrap()
                .get(reference)
                .map(|p| PaymentSnapshot {
                    id: p.id,
                    status: p.status,
                }))
        }

        async fn apply(
            &self,
            reference: &str,
            settlement: Settlement,
        ) -> Result<Vec<SettledTicket>, StoreError> {
            let mut payments = self.payments.lock().unwrap();
            let payment = payments
                .get_mut(reference)
                .ok_or_else(|| StoreError::UnknownReference(reference.to_string()))?;
            if payment.status.is_terminal() {
                return Err(StoreError::AlreadySettled(reference.to_string()));
            }

            payment.status = settlement.payment_status();
            match &settlement {
                Settlement::Complete { receipt, .. } => {
                    payment.receipt = receipt.clone();
                }
                Settlement::Cancel { reason } | Settlement::Fail { reason } => {
                    payment.failure_reason = Some(reason.clone());
                }
            }

            let mut settled = Vec::new();
            let ticket_status = settlement.ticket_status();
            for ticket in &mut payment.tickets {
                if ticket.status != TicketStatus::Pending {
                    continue;
                }
                ticket.status = ticket_status;
                if settlement.releases_inventory() {
                    let mut stock = self.stock.lock().unwrap();
                    if let Some((_, sold)) = stock.get_mut(&ticket.ticket_type_id) {
                        *sold = (*sold - ticket.quantity).max(0);
                    }
                }
                settled.push(SettledTicket {
                    ticket_id: ticket.id,
                    qr_token: ticket.qr_token,
                });
            }

            Ok(settled)
        }
    }
}
