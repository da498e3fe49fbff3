//! Retry scheduling
//!
//! At most one pending retry per key. A scheduled retry fires after an
//! exponential-backoff delay; scheduling again for the same key replaces the
//! pending one, and cancelling removes it without running its action.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::backoff::BackoffConfig;

/// Error returned when the retry budget is spent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Retry budget exhausted after {attempts} attempts")]
pub struct RetryExhausted {
    /// Attempts already made
    pub attempts: u32,
}

/// A scheduled retry, as seen by the caller
#[derive(Debug, Clone)]
pub struct RetryTicket {
    /// Retry attempt this ticket represents (0-indexed)
    pub attempt: u32,
    /// Delay before the action runs
    pub delay: Duration,
    /// When the ticket was created
    pub scheduled_at: Instant,
}

struct PendingRetry {
    generation: u64,
    task: JoinHandle<()>,
}

/// Keyed one-shot retry timer.
///
/// Owns the pending timers; a ticket lives until it fires, is cancelled, or
/// is replaced by a newer schedule for the same key. The action runs on a
/// spawned task; an action error is logged and swallowed, never propagated
/// into the scheduler's own bookkeeping.
pub struct RetryScheduler<K> {
    backoff: BackoffConfig,
    pending: Arc<Mutex<HashMap<K, PendingRetry>>>,
    generation: AtomicU64,
}

impl<K> RetryScheduler<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    /// Create a scheduler using the given backoff schedule
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            backoff,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Create a scheduler with the default backoff schedule
    pub fn default_backoff() -> Self {
        Self::new(BackoffConfig::default())
    }

    /// Schedule `action` to run after the backoff delay for `attempt`.
    ///
    /// Returns the ticket that is now pending, or [`RetryExhausted`] without
    /// scheduling anything when `attempt >= max_attempts`. Any ticket already
    /// pending for `key` is cancelled first; only one may be live per key.
    pub async fn schedule<F, Fut, E>(
        &self,
        key: K,
        attempt: u32,
        max_attempts: u32,
        action: F,
    ) -> Result<RetryTicket, RetryExhausted>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display,
    {
        if attempt >= max_attempts {
            tracing::warn!(key = %key, attempt, max_attempts, "No retry scheduled, budget spent");
            return Err(RetryExhausted { attempts: attempt });
        }

        let delay = self
            .backoff
            .apply_jitter(self.backoff.delay_for_attempt(attempt))
            .min(self.backoff.max_delay);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut pending = self.pending.lock().await;
        if let Some(previous) = pending.remove(&key) {
            previous.task.abort();
            tracing::debug!(key = %key, "Replaced pending retry");
        }

        let pending_map = Arc::clone(&self.pending);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            sleep(delay).await;

            // Claim the ticket. A ticket that was cancelled or replaced
            // while we slept must not run its action.
            {
                let mut pending = pending_map.lock().await;
                match pending.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        pending.remove(&task_key);
                    }
                    _ => return,
                }
            }

            if let Err(e) = action().await {
                tracing::error!(key = %task_key, error = %e, "Retry action failed");
            }
        });

        pending.insert(key.clone(), PendingRetry { generation, task });
        tracing::debug!(key = %key, attempt, delay_ms = delay.as_millis() as u64, "Retry scheduled");

        Ok(RetryTicket {
            attempt,
            delay,
            scheduled_at: Instant::now(),
        })
    }

    /// Cancel the pending retry for `key` without running its action.
    ///
    /// Returns true if a timer was pending. A false return means there was
    /// nothing to cancel - either nothing was scheduled or the ticket
    /// already fired.
    pub async fn cancel(&self, key: &K) -> bool {
        let mut pending = self.pending.lock().await;
        match pending.remove(key) {
            Some(entry) => {
                entry.task.abort();
                tracing::debug!(key = %key, "Cancelled pending retry");
                true
            }
            None => false,
        }
    }

    /// True while a retry is pending for `key`
    pub async fn has_active(&self, key: &K) -> bool {
        self.pending.lock().await.contains_key(key)
    }

    /// Number of keys with a pending retry
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::time::advance;

    // Let woken tasks run to completion after a clock advance.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn set_flag(
        flag: &Arc<AtomicBool>,
    ) -> impl std::future::Future<Output = Result<(), &'static str>> + Send + 'static {
        let flag = Arc::clone(flag);
        async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_backoff_delay() {
        let scheduler: RetryScheduler<String> = RetryScheduler::default_backoff();
        let fired = Arc::new(AtomicBool::new(false));

        let action = set_flag(&fired);
        let ticket = scheduler
            .schedule("slot".to_string(), 0, 3, move || action)
            .await
            .unwrap();
        assert_eq!(ticket.delay, Duration::from_millis(1000));
        assert!(scheduler.has_active(&"slot".to_string()).await);

        // Let the spawned task register its sleep before moving the clock.
        settle().await;
        advance(Duration::from_millis(999)).await;
        settle().await;
        assert!(!fired.load(Ordering::SeqCst));

        advance(Duration::from_millis(2)).await;
        settle().await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(!scheduler.has_active(&"slot".to_string()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_action() {
        let scheduler: RetryScheduler<String> = RetryScheduler::default_backoff();
        let fired = Arc::new(AtomicBool::new(false));

        let action = set_flag(&fired);
        scheduler
            .schedule("slot".to_string(), 0, 3, move || action)
            .await
            .unwrap();

        assert!(scheduler.cancel(&"slot".to_string()).await);
        assert!(!scheduler.has_active(&"slot".to_string()).await);

        advance(Duration::from_secs(5)).await;
        settle().await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_replaces_pending_ticket() {
        let scheduler: RetryScheduler<String> = RetryScheduler::default_backoff();
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));

        let first_action = set_flag(&first);
        scheduler
            .schedule("slot".to_string(), 0, 5, move || first_action)
            .await
            .unwrap();
        let second_action = set_flag(&second);
        let ticket = scheduler
            .schedule("slot".to_string(), 1, 5, move || second_action)
            .await
            .unwrap();

        assert_eq!(ticket.delay, Duration::from_millis(2000));
        assert_eq!(scheduler.pending_count().await, 1);

        settle().await;
        advance(Duration::from_millis(2001)).await;
        settle().await;

        assert!(!first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
        assert_eq!(scheduler.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_exhausted_budget_schedules_nothing() {
        let scheduler: RetryScheduler<String> = RetryScheduler::default_backoff();
        let fired = Arc::new(AtomicBool::new(false));

        let action = set_flag(&fired);
        let err = scheduler
            .schedule("slot".to_string(), 3, 3, move || action)
            .await
            .unwrap_err();
        assert_eq!(err, RetryExhausted { attempts: 3 });
        assert!(!scheduler.has_active(&"slot".to_string()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_error_still_clears_ticket() {
        let scheduler: RetryScheduler<String> = RetryScheduler::default_backoff();

        scheduler
            .schedule("slot".to_string(), 0, 3, || async {
                Err::<(), _>("provider blew up")
            })
            .await
            .unwrap();

        settle().await;
        advance(Duration::from_millis(1001)).await;
        settle().await;
        assert!(!scheduler.has_active(&"slot".to_string()).await);
    }

    #[tokio::test]
    async fn test_cancel_without_pending_returns_false() {
        let scheduler: RetryScheduler<String> = RetryScheduler::default_backoff();
        assert!(!scheduler.cancel(&"slot".to_string()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_do_not_interfere() {
        let scheduler: RetryScheduler<String> = RetryScheduler::default_backoff();
        let a = Arc::new(AtomicBool::new(false));
        let b = Arc::new(AtomicBool::new(false));

        let a_action = set_flag(&a);
        scheduler
            .schedule("a".to_string(), 0, 3, move || a_action)
            .await
            .unwrap();
        let b_action = set_flag(&b);
        scheduler
            .schedule("b".to_string(), 1, 3, move || b_action)
            .await
            .unwrap();
        assert_eq!(scheduler.pending_count().await, 2);

        settle().await;
        advance(Duration::from_millis(1001)).await;
        settle().await;
        assert!(a.load(Ordering::SeqCst));
        assert!(!b.load(Ordering::SeqCst));

        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert!(b.load(Ordering::SeqCst));
    }
}
