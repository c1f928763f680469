pub mod expiry;
pub mod lock;
pub mod poller;
pub mod store;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::models::payment::PaymentStatus;
use crate::mpesa::ProviderResult;
use crate::notify::{NotificationDispatcher, TicketNotification};

use lock::{LockManager, LockTimeoutError, LOCK_TIMEOUT};
use store::{ReconciliationStore, SettledTicket, Settlement, StoreError};

/// A pending charge is polled at most this many times before it is written
/// off.
pub const MAX_POLL_ATTEMPTS: u32 = 3;

pub const CANCELED_REASON: &str = "Payment canceled by user";
pub const MAX_RETRIES_REASON: &str = "max retries reached";

/// Where a reconciliation attempt came from. The webhook carries the final
/// result and never queries; polls carry their attempt number as explicit
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Webhook,
    Poll { attempt: u32 },
}

/// What `decide` concluded, before any storage is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Terminal status already recorded; duplicate deliveries land here.
    AlreadySettled,
    Settle(Settlement),
    /// Non-terminal result on a poll with budget remaining.
    Retry { next_attempt: u32 },
    /// Non-terminal result delivered by webhook; the poll chain owns it.
    Ignore,
}

/// The whole state-machine table as a pure function. Every reconciliation
/// path goes through here, so webhook and poll handling cannot diverge.
pub fn decide(current: PaymentStatus, result: &ProviderResult, trigger: Trigger) -> Decision {
    // The load-bearing idempotency check: once terminal, nothing moves.
    if current.is_terminal() {
        return Decision::AlreadySettled;
    }

    match result {
        ProviderResult::Success {
            receipt, paid_at, ..
        } => Decision::Settle(Settlement::Complete {
            receipt: receipt.clone(),
            paid_at: *paid_at,
        }),
        ProviderResult::CanceledByUser => Decision::Settle(Settlement::Cancel {
            reason: CANCELED_REASON.to_string(),
        }),
        ProviderResult::Failed { reason } => Decision::Settle(Settlement::Fail {
            reason: reason.clone(),
        }),
        ProviderResult::Pending | ProviderResult::TransientError { .. } => match trigger {
            Trigger::Poll { attempt } if attempt < MAX_POLL_ATTEMPTS => Decision::Retry {
                next_attempt: attempt + 1,
            },
            Trigger::Poll { .. } => Decision::Settle(Settlement::Fail {
                reason: MAX_RETRIES_REASON.to_string(),
            }),
            Trigger::Webhook => Decision::Ignore,
        },
    }
}

/// What a reconciliation attempt did, for the caller to act on (the poller
/// schedules `RetryLater`; handlers translate the rest into acks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Settled(PaymentStatus),
    AlreadySettled,
    RetryLater { next_attempt: u32 },
    Ignored,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("unknown transaction reference {0}")]
    UnknownTransaction(String),

    #[error(transparent)]
    LockTimeout(#[from] LockTimeoutError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownReference(reference) => {
                ReconcileError::UnknownTransaction(reference)
            }
            other => ReconcileError::Store(other),
        }
    }
}

/// Decides and applies payment/ticket transitions from provider results.
/// Both delivery paths (webhook, poll) funnel through `reconcile`, which
/// serializes attempts per provider reference and applies each transition
/// at most once.
pub struct ReconciliationEngine {
    store: Arc<dyn ReconciliationStore>,
    locks: Arc<LockManager>,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn ReconciliationStore>,
        locks: Arc<LockManager>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            store,
            locks,
            notifier,
        }
    }

    pub async fn reconcile(
        &self,
        reference: &str,
        result: ProviderResult,
        trigger: Trigger,
    ) -> Result<Outcome, ReconcileError> {
        self.locks
            .with_lock(reference, LOCK_TIMEOUT, || {
                self.reconcile_locked(reference, result, trigger)
            })
            .await?
    }

    async fn reconcile_locked(
        &self,
        reference: &str,
        result: ProviderResult,
        trigger: Trigger,
    ) -> Result<Outcome, ReconcileError> {
        let Some(snapshot) = self.store.load(reference).await.map_err(ReconcileError::from)? else {
            // A reference we never issued: a bug or a tampered callback.
            // Retrying cannot fix it.
            error!(reference, "Reconciliation requested for unknown transaction");
            return Err(ReconcileError::UnknownTransaction(reference.to_string()));
        };

        match decide(snapshot.status, &result, trigger) {
            Decision::AlreadySettled => {
                debug!(reference, status = snapshot.status.as_str(), "Already settled, no-op");
                Ok(Outcome::AlreadySettled)
            }
            Decision::Retry { next_attempt } => {
                debug!(reference, next_attempt, "Charge still pending, will poll again");
                Ok(Outcome::RetryLater { next_attempt })
            }
            Decision::Ignore => {
                warn!(reference, "Webhook delivered a non-terminal result, ignoring");
                Ok(Outcome::Ignored)
            }
            Decision::Settle(settlement) => {
                let status = settlement.payment_status();
                let notify = matches!(settlement, Settlement::Complete { .. });
                match self.store.apply(reference, settlement).await {
                    Ok(tickets) => {
                        info!(reference, status = status.as_str(), "Payment settled");
                        if notify {
                            self.dispatch_confirmations(tickets);
                        }
                        Ok(Outcome::Settled(status))
                    }
                    // Lost a race with another instance past the advisory
                    // lock; the row lock made it a no-op.
                    Err(StoreError::AlreadySettled(_)) => Ok(Outcome::AlreadySettled),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Confirmations go out after the settlement committed, so a notifier
    /// failure can never unwind a completed payment. Fire-and-forget; the
    /// dispatcher's own retry policy applies.
    fn dispatch_confirmations(&self, tickets: Vec<SettledTicket>) {
        for ticket in tickets {
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                let notification = TicketNotification {
                    ticket_id: ticket.ticket_id,
                    qr_token: ticket.qr_token,
                };
                if let Err(e) = notifier.send(&notification).await {
                    error!(ticket_id = %ticket.ticket_id, error = %e, "Confirmation send failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::store::testing::MemoryStore;
    use super::*;
    use crate::notify::NotifyError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    struct CountingDispatcher {
        sent: AtomicU32,
    }

    #[async_trait]
    impl NotificationDispatcher for CountingDispatcher {
        async fn send(&self, _notification: &TicketNotification) -> Result<(), NotifyError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn success() -> ProviderResult {
        ProviderResult::Success {
            receipt: Some("NLJ7RT61SV".to_string()),
            amount: None,
            paid_at: None,
        }
    }

    struct Harness {
        engine: ReconciliationEngine,
        store: Arc<MemoryStore>,
        dispatcher: Arc<CountingDispatcher>,
        ticket_type_id: Uuid,
    }

    fn harness(reference: &str) -> Harness {
        let ticket_type_id = Uuid::new_v4();
        let store = Arc::new(MemoryStore::with_checkout(reference, ticket_type_id, 2, 10));
        let dispatcher = Arc::new(CountingDispatcher {
            sent: AtomicU32::new(0),
        });
        let engine = ReconciliationEngine::new(
            store.clone(),
            Arc::new(LockManager::new()),
            dispatcher.clone(),
        );
        Harness {
            engine,
            store,
            dispatcher,
            ticket_type_id,
        }
    }

    async fn settle_notifications() {
        // dispatch_confirmations is fire-and-forget; let spawned sends land
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_decide_terminal_states_are_immutable() {
        for current in [
            PaymentStatus::Completed,
            PaymentStatus::Failed,
            PaymentStatus::Canceled,
        ] {
            for result in [
                success(),
                ProviderResult::CanceledByUser,
                ProviderResult::Pending,
                ProviderResult::Failed {
                    reason: "x".to_string(),
                },
            ] {
                assert_eq!(
                    decide(current, &result, Trigger::Webhook),
                    Decision::AlreadySettled
                );
                assert_eq!(
                    decide(current, &result, Trigger::Poll { attempt: 1 }),
                    Decision::AlreadySettled
                );
            }
        }
    }

    #[test]
    fn test_decide_retry_budget() {
        assert_eq!(
            decide(PaymentStatus::Pending, &ProviderResult::Pending, Trigger::Poll { attempt: 1 }),
            Decision::Retry { next_attempt: 2 }
        );
        assert_eq!(
            decide(PaymentStatus::Pending, &ProviderResult::Pending, Trigger::Poll { attempt: 2 }),
            Decision::Retry { next_attempt: 3 }
        );
        assert_eq!(
            decide(PaymentStatus::Pending, &ProviderResult::Pending, Trigger::Poll { attempt: 3 }),
            Decision::Settle(Settlement::Fail {
                reason: MAX_RETRIES_REASON.to_string()
            })
        );
    }

    #[test]
    fn test_decide_transient_error_follows_retry_policy() {
        let transient = ProviderResult::TransientError {
            reason: "API communication failed".to_string(),
        };
        assert_eq!(
            decide(PaymentStatus::Pending, &transient, Trigger::Poll { attempt: 2 }),
            Decision::Retry { next_attempt: 3 }
        );
        assert_eq!(
            decide(PaymentStatus::Pending, &transient, Trigger::Webhook),
            Decision::Ignore
        );
    }

    #[tokio::test]
    async fn test_success_settles_payment_and_tickets_once() {
        let h = harness("ws_CO_1");

        let outcome = h
            .engine
            .reconcile("ws_CO_1", success(), Trigger::Poll { attempt: 1 })
            .await
            .expect("reconciles");
        assert_eq!(outcome, Outcome::Settled(PaymentStatus::Completed));

        let payment = h.store.payment("ws_CO_1");
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.receipt.as_deref(), Some("NLJ7RT61SV"));
        assert!(payment
            .tickets
            .iter()
            .all(|t| t.status == crate::models::TicketStatus::Purchased));
        // reservation stands: sold stays at the reserved count
        assert_eq!(h.store.sold(h.ticket_type_id), 2);

        settle_notifications().await;
        assert_eq!(h.dispatcher.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_success_delivery_is_a_noop() {
        let h = harness("ws_CO_2");

        h.engine
            .reconcile("ws_CO_2", success(), Trigger::Webhook)
            .await
            .expect("first delivery settles");
        let outcome = h
            .engine
            .reconcile("ws_CO_2", success(), Trigger::Webhook)
            .await
            .expect("second delivery is absorbed");
        assert_eq!(outcome, Outcome::AlreadySettled);

        // inventory counted once, confirmation sent once
        assert_eq!(h.store.sold(h.ticket_type_id), 2);
        settle_notifications().await;
        assert_eq!(h.dispatcher.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_inventory_without_notification() {
        let h = harness("ws_CO_3");

        let outcome = h
            .engine
            .reconcile("ws_CO_3", ProviderResult::CanceledByUser, Trigger::Webhook)
            .await
            .expect("reconciles");
        assert_eq!(outcome, Outcome::Settled(PaymentStatus::Canceled));

        let payment = h.store.payment("ws_CO_3");
        assert_eq!(payment.status, PaymentStatus::Canceled);
        assert_eq!(payment.failure_reason.as_deref(), Some(CANCELED_REASON));
        assert!(payment
            .tickets
            .iter()
            .all(|t| t.status == crate::models::TicketStatus::Canceled));
        assert_eq!(h.store.sold(h.ticket_type_id), 0);

        settle_notifications().await;
        assert_eq!(h.dispatcher.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_records_reason() {
        let h = harness("ws_CO_4");

        h.engine
            .reconcile(
                "ws_CO_4",
                ProviderResult::Failed {
                    reason: "DS timeout".to_string(),
                },
                Trigger::Webhook,
            )
            .await
            .expect("reconciles");

        let payment = h.store.payment("ws_CO_4");
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.failure_reason.as_deref(), Some("DS timeout"));
        assert_eq!(h.store.sold(h.ticket_type_id), 0);
    }

    #[tokio::test]
    async fn test_pending_poll_leaves_state_untouched() {
        let h = harness("ws_CO_5");

        let outcome = h
            .engine
            .reconcile("ws_CO_5", ProviderResult::Pending, Trigger::Poll { attempt: 1 })
            .await
            .expect("reconciles");
        assert_eq!(outcome, Outcome::RetryLater { next_attempt: 2 });
        assert_eq!(h.store.payment("ws_CO_5").status, PaymentStatus::Pending);
        assert_eq!(h.store.sold(h.ticket_type_id), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_payment() {
        let h = harness("ws_CO_6");

        let outcome = h
            .engine
            .reconcile("ws_CO_6", ProviderResult::Pending, Trigger::Poll { attempt: 3 })
            .await
            .expect("reconciles");
        assert_eq!(outcome, Outcome::Settled(PaymentStatus::Failed));

        let payment = h.store.payment("ws_CO_6");
        assert_eq!(payment.failure_reason.as_deref(), Some(MAX_RETRIES_REASON));
        assert_eq!(h.store.sold(h.ticket_type_id), 0);
    }

    #[tokio::test]
    async fn test_late_cancel_after_completion_changes_nothing() {
        let h = harness("ws_CO_7");

        h.engine
            .reconcile("ws_CO_7", success(), Trigger::Poll { attempt: 1 })
            .await
            .expect("settles");
        let outcome = h
            .engine
            .reconcile("ws_CO_7", ProviderResult::CanceledByUser, Trigger::Webhook)
            .await
            .expect("late webhook absorbed");

        assert_eq!(outcome, Outcome::AlreadySettled);
        assert_eq!(h.store.payment("ws_CO_7").status, PaymentStatus::Completed);
        assert_eq!(h.store.sold(h.ticket_type_id), 2);
    }

    #[tokio::test]
    async fn test_unknown_reference_is_terminal_error() {
        let h = harness("ws_CO_8");

        let err = h
            .engine
            .reconcile("ws_CO_missing", success(), Trigger::Webhook)
            .await
            .expect_err("unknown reference");
        assert!(matches!(err, ReconcileError::UnknownTransaction(_)));
    }
}
