use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::mpesa::MpesaClient;

use super::{Outcome, ReconcileError, ReconciliationEngine, Trigger};

/// Delay before the first status poll; the payer needs a moment to act on
/// the phone prompt.
pub const INITIAL_POLL_DELAY: Duration = Duration::from_secs(5);

/// Poll attempt `n` waits 5s × 2^(n−1): 5s, 10s, 20s.
pub fn backoff_delay(attempt: u32) -> Duration {
    INITIAL_POLL_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Schedules status polls as delayed tokio tasks. The attempt number rides
/// along as explicit job state; a poll that comes back non-terminal
/// reschedules itself with the next attempt until the engine declares the
/// budget spent.
pub struct PollScheduler {
    engine: Arc<ReconciliationEngine>,
    gateway: Arc<MpesaClient>,
}

impl PollScheduler {
    pub fn new(engine: Arc<ReconciliationEngine>, gateway: Arc<MpesaClient>) -> Arc<Self> {
        Arc::new(Self { engine, gateway })
    }

    /// Queue poll `attempt` for `reference` after its backoff delay.
    pub fn schedule(self: &Arc<Self>, reference: String, attempt: u32) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(backoff_delay(attempt)).await;
            scheduler.run_poll(reference, attempt).await;
        });
    }

    async fn run_poll(self: Arc<Self>, reference: String, attempt: u32) {
        debug!(reference, attempt, "Polling charge status");
        let result = self.gateway.query_status(&reference).await;

        match self
            .engine
            .reconcile(&reference, result, Trigger::Poll { attempt })
            .await
        {
            Ok(Outcome::RetryLater { next_attempt }) => {
                self.schedule(reference, next_attempt);
            }
            Ok(outcome) => {
                debug!(reference, ?outcome, "Poll finished");
            }
            Err(ReconcileError::LockTimeout(_)) => {
                // Another attempt (likely the webhook) holds the reference;
                // check back without burning the retry budget. If it
                // settled, the next poll short-circuits.
                warn!(reference, attempt, "Reconciliation busy, retrying poll later");
                self.schedule(reference, attempt);
            }
            Err(e) => {
                error!(reference, error = %e, "Poll reconciliation failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_is_5_10_20() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(3), Duration::from_secs(20));
    }

    #[test]
    fn test_backoff_tolerates_zero_attempt() {
        assert_eq!(backoff_delay(0), Duration::from_secs(5));
    }
}
