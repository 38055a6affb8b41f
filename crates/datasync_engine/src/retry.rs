//! Cancellable exponential-backoff retry.

use crate::config::RetryPolicy;
use crate::error::{SyncError, SyncResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Phase of a retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    /// Running the operation for the first time.
    FirstAttempt,
    /// Sleeping before the next attempt.
    Waiting,
    /// Running the operation again after a wait.
    Retrying,
    /// Cancellation was observed; the loop stopped.
    Cancelled,
    /// The operation succeeded.
    Succeeded,
    /// The operation failed with a non-retryable error.
    PermanentFailure,
}

impl RetryPhase {
    /// Returns true if the loop has stopped in this phase.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RetryPhase::Cancelled | RetryPhase::Succeeded | RetryPhase::PermanentFailure
        )
    }
}

/// Per-run retry bookkeeping. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Current phase.
    pub phase: RetryPhase,
    /// Number of attempts started so far.
    pub attempts: u32,
    /// Most recent wait, zero until the first failure.
    pub wait: Duration,
}

impl RetryState {
    fn new() -> Self {
        Self {
            phase: RetryPhase::FirstAttempt,
            attempts: 0,
            wait: Duration::ZERO,
        }
    }
}

/// Drives a fallible async operation until it succeeds, fails permanently,
/// or the cancellation token fires.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Creates an executor using the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Returns the backoff policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `op` with retries.
    ///
    /// Errors are classified with [`SyncError::is_retryable`]: anything
    /// retryable puts the loop to sleep for the next backoff interval, anything
    /// else is returned as is. Returns [`SyncError::Cancelled`] as soon as the
    /// token fires, whether the loop is sleeping or about to start an attempt.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let (result, _) = self.run_with_state(cancel, op).await;
        result
    }

    /// Like [`run`](Self::run), also returning the final retry state.
    pub async fn run_with_state<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> (SyncResult<T>, RetryState)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut state = RetryState::new();

        loop {
            if cancel.is_cancelled() {
                state.phase = RetryPhase::Cancelled;
                return (Err(SyncError::Cancelled), state);
            }

            state.attempts += 1;
            let err = match op().await {
                Ok(value) => {
                    state.phase = RetryPhase::Succeeded;
                    return (Ok(value), state);
                }
                Err(e) => e,
            };

            if err.is_cancelled() {
                state.phase = RetryPhase::Cancelled;
                return (Err(err), state);
            }
            if !err.is_retryable() {
                state.phase = RetryPhase::PermanentFailure;
                return (Err(err), state);
            }

            state.phase = RetryPhase::Waiting;
            state.wait = if state.attempts == 1 {
                self.policy.first_wait()
            } else {
                self.policy.next_wait(state.wait)
            };
            warn!(
                attempt = state.attempts,
                wait_ms = state.wait.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(attempt = state.attempts, "retry wait cancelled");
                    state.phase = RetryPhase::Cancelled;
                    return (Err(SyncError::Cancelled), state);
                }
                _ = tokio::time::sleep(state.wait) => {}
            }

            state.phase = RetryPhase::Retrying;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_RETRY_WAIT;
    use datasync_protocol::Status;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn executor() -> RetryExecutor {
        RetryExecutor::new(RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_first_try_without_waiting() {
        let start = Instant::now();
        let token = CancellationToken::new();
        let (result, state) = executor()
            .run_with_state(&token, || async { Ok::<_, SyncError>(42) })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(state.attempts, 1);
        assert_eq!(state.phase, RetryPhase::Succeeded);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let start = Instant::now();

        let c = Arc::clone(&calls);
        let result = executor()
            .run(&token, || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SyncError::transport_retryable("connection reset"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3100), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_follow_the_policy_schedule() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();

        let s = Arc::clone(&stamps);
        let (result, state) = executor()
            .run_with_state(&token, || {
                let s = Arc::clone(&s);
                async move {
                    let mut stamps = s.lock();
                    stamps.push(Instant::now());
                    if stamps.len() <= 6 {
                        Err(SyncError::Status(Status::unavailable("down")))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(state.attempts, 7);
        assert_eq!(state.wait, Duration::from_secs(32));

        let stamps = stamps.lock();
        let gaps: Vec<u64> = stamps
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect();
        let expected = [1000u64, 2000, 4000, 8000, 16000, 32000];
        for (gap, want) in gaps.iter().zip(expected) {
            assert!(*gap >= want && *gap < want + 50, "gap {} want {}", gap, want);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let start = Instant::now();

        let c = Arc::clone(&calls);
        let (result, state) = executor()
            .run_with_state(&token, || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SyncError::Status(Status::invalid_argument("malformed")))
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Status(_))));
        assert_eq!(state.phase, RetryPhase::PermanentFailure);
        assert_eq!(state.wait, Duration::ZERO);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_on_a_retry_stops_the_loop() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let start = Instant::now();

        let c = Arc::clone(&calls);
        let (result, state) = executor()
            .run_with_state(&token, || {
                let c = Arc::clone(&c);
                async move {
                    let status = if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Status::unavailable("down")
                    } else {
                        Status::invalid_argument("malformed")
                    };
                    Err::<(), _>(SyncError::Status(status))
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Status(_))));
        assert_eq!(state.attempts, 2);
        assert_eq!(state.phase, RetryPhase::PermanentFailure);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Exactly one backoff wait, the initial one.
        assert_eq!(state.wait, Duration::from_secs(1));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn degenerate_policy_still_waits() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        let exec = RetryExecutor::new(RetryPolicy {
            initial_wait: Duration::ZERO,
            factor: 0,
            max_wait: Duration::from_secs(1),
        });

        let s = Arc::clone(&stamps);
        let (result, state) = exec
            .run_with_state(&token, || {
                let s = Arc::clone(&s);
                async move {
                    let mut stamps = s.lock();
                    stamps.push(Instant::now());
                    if stamps.len() <= 3 {
                        Err(SyncError::transport_retryable("refused"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(state.attempts, 4);
        let stamps = stamps.lock();
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= MIN_RETRY_WAIT);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_long_wait() {
        let token = CancellationToken::new();
        let exec = RetryExecutor::new(RetryPolicy::new(Duration::from_secs(3600)));
        let start = Instant::now();

        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            exec.run(&run_token, || async {
                Err::<(), _>(SyncError::transport_retryable("unreachable"))
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        token.cancel();

        let c = Arc::clone(&calls);
        let (result, state) = executor()
            .run_with_state(&token, || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(state.phase, RetryPhase::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_from_the_operation_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let c = Arc::clone(&calls);
        let result = executor()
            .run(&token, || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SyncError::Cancelled)
                }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn terminal_phases() {
        assert!(RetryPhase::Succeeded.is_terminal());
        assert!(RetryPhase::Cancelled.is_terminal());
        assert!(RetryPhase::PermanentFailure.is_terminal());
        assert!(!RetryPhase::Waiting.is_terminal());
        assert!(!RetryPhase::FirstAttempt.is_terminal());
    }
}
