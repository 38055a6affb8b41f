//! Configuration for the sync engine.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the sync manager.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity of the part uploaded data is attributed to.
    pub part_id: String,
    /// Directory holding one durable marker per in-flight upload.
    pub progress_dir: PathBuf,
    /// Backoff policy for failed uploads.
    pub retry: RetryPolicy,
    /// What to do with markers found at startup.
    pub stale_marks: StaleMarkPolicy,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(part_id: impl Into<String>, progress_dir: impl Into<PathBuf>) -> Self {
        Self {
            part_id: part_id.into(),
            progress_dir: progress_dir.into(),
            retry: RetryPolicy::default(),
            stale_marks: StaleMarkPolicy::default(),
        }
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the stale-mark policy.
    pub fn with_stale_marks(mut self, policy: StaleMarkPolicy) -> Self {
        self.stale_marks = policy;
        self
    }
}

/// Handling of progress markers left behind by a previous process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaleMarkPolicy {
    /// Remove every marker found at startup; the paths can be synced again.
    #[default]
    Reclaim,
    /// Keep every marker found at startup; the paths are skipped until
    /// explicitly cleared.
    Block,
}

/// Smallest wait the backoff ever produces.
pub const MIN_RETRY_WAIT: Duration = Duration::from_millis(1);

/// Exponential backoff policy.
///
/// Waits `initial_wait` before the first retry, then multiplies the wait by
/// `factor` after each failure, never exceeding `max_wait`. There is no
/// attempt limit.
///
/// Waits never drop below [`MIN_RETRY_WAIT`] and the factor is treated as at
/// least 1, so a policy can slow retries down but never turn them into a
/// busy loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait before the first retry.
    pub initial_wait: Duration,
    /// Multiplier applied to the previous wait.
    pub factor: u32,
    /// Upper bound on any single wait.
    pub max_wait: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given initial wait and default factor and cap.
    pub fn new(initial_wait: Duration) -> Self {
        Self::default().with_initial_wait(initial_wait)
    }

    /// Sets the initial wait, raised to [`MIN_RETRY_WAIT`] if smaller.
    pub fn with_initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = wait.max(MIN_RETRY_WAIT);
        self
    }

    /// Sets the backoff factor, raised to 1 if zero.
    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor.max(1);
        self
    }

    /// Sets the maximum wait, raised to [`MIN_RETRY_WAIT`] if smaller.
    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait.max(MIN_RETRY_WAIT);
        self
    }

    /// Wait before the first retry.
    pub fn first_wait(&self) -> Duration {
        self.initial_wait.max(MIN_RETRY_WAIT).min(self.cap())
    }

    /// Computes the wait that follows a wait of `last`.
    pub fn next_wait(&self, last: Duration) -> Duration {
        last.max(MIN_RETRY_WAIT)
            .checked_mul(self.factor.max(1))
            .unwrap_or(Duration::MAX)
            .min(self.cap())
    }

    /// Returns the endless sequence of waits this policy produces.
    pub fn waits(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.first_wait()), move |last| {
            Some(self.next_wait(*last))
        })
    }

    fn cap(&self) -> Duration {
        self.max_wait.max(MIN_RETRY_WAIT)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_millis(1000),
            factor: 2,
            max_wait: Duration::from_secs(60 * 60),
        }
    }
}
