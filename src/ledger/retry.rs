//! Retry Policies
//!
//! One retry policy per error kind (see `error.rs`), replacing ad-hoc retry
//! loops. Delays are exponential with jitter; a server-supplied back-off
//! hint, when present, wins over the computed delay.

use dashmap::DashMap;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::LedgerError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Allocation execution is the most contended ledger operation
    pub fn allocation() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Generic write commands (create, exercise)
    pub fn generic_write() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }

    /// Exponential back-off with uniform jitter, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis().max(1) as u64 / 2);
        (exp / 2 + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Run `op` under `policy`, retrying every retryable ledger error kind
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    op_name: &str,
    op: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    with_retry_if(policy, op_name, LedgerError::is_retryable, op).await
}

/// Run `op` under `policy`, retrying only the error kinds `retry_if` admits.
/// Conflicts, for example, are retried by Settlement on fills but surfaced
/// everywhere else.
pub async fn with_retry_if<T, F, Fut>(
    policy: RetryPolicy,
    op_name: &str,
    retry_if: impl Fn(&LedgerError) -> bool,
    mut op: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if retry_if(&err) && attempt + 1 < policy.max_attempts => {
                let delay = err.retry_after().unwrap_or_else(|| policy.delay_for(attempt));
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    op_name,
                    attempt + 1,
                    policy.max_attempts,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Per-key in-flight deduplication
///
/// Keeps concurrent duplicates of the same logical operation (keyed by
/// party + operation) from being sent to the ledger at all.
#[derive(Default)]
pub struct InFlightGuard {
    keys: Arc<DashMap<String, ()>>,
}

impl InFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the key, or fail with `AlreadyInFlight` when a concurrent
    /// holder exists. The returned permit releases the key on drop.
    pub fn try_acquire(&self, key: &str) -> Result<InFlightPermit, LedgerError> {
        match self.keys.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(LedgerError::AlreadyInFlight { retry_after: None })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlightPermit {
                    keys: Arc::clone(&self.keys),
                    key: key.to_string(),
                })
            }
        }
    }
}

pub struct InFlightPermit {
    keys: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}
