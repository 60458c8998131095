//! Retry policy and call context for remote store calls
//!
//! Every store call runs under a `RetryPolicy` and a `CallContext`. The
//! context carries a cancel token and an optional deadline; both are
//! checked before each attempt and while sleeping between attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lambda_venv_store::{StoreError, StoreOp, StoreResult};
use tracing::warn;

/// Longest uninterrupted sleep while backing off
const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Shared cancellation flag
///
/// Clones observe the same flag. Tripping it never interrupts a store call
/// in flight; the next check fails instead.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cancellation and deadline for one pipeline invocation
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancelToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` without one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail if cancelled or past the deadline
    pub fn check(&self, op: StoreOp) -> StoreResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled { op });
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StoreError::DeadlineExceeded { op });
            }
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early on cancellation or deadline
    pub fn sleep(&self, op: StoreOp, duration: Duration) -> StoreResult<()> {
        let until = Instant::now() + duration;
        loop {
            self.check(op)?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            std::thread::sleep((until - now).min(SLEEP_SLICE));
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor between delays
    pub multiplier: u32,
    /// Which errors are worth another attempt
    pub retryable: fn(&StoreError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2,
            retryable: StoreError::is_retryable,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` and no delay between them
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out
    ///
    /// `call` receives the 1-based attempt number.
    pub fn run<T, F>(&self, ctx: &CallContext, op: StoreOp, mut call: F) -> StoreResult<T>
    where
        F: FnMut(u32) -> StoreResult<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            ctx.check(op)?;
            match call(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && (self.retryable)(&err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        op = %op,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "store call failed, retrying"
                    );
                    ctx.sleep(op, delay)?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn transient() -> StoreError {
        StoreError::transient(StoreOp::ListVersions, "throttled")
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(5), Duration::from_secs(8));
        assert_eq!(policy.delay_for(40), Duration::from_secs(8));
    }

    #[test]
    fn test_retries_then_succeeds() {
        let calls = Cell::new(0);
        let result = RetryPolicy::immediate(4).run(&CallContext::new(), StoreOp::ListVersions, |attempt| {
            calls.set(attempt);
            if attempt < 3 {
                Err(transient())
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let err = RetryPolicy::immediate(3)
            .run::<(), _>(&CallContext::new(), StoreOp::ListVersions, |_| {
                calls.set(calls.get() + 1);
                Err(transient())
            })
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let calls = Cell::new(0);
        let err = RetryPolicy::immediate(4)
            .run::<(), _>(&CallContext::new(), StoreOp::UploadArtifact, |_| {
                calls.set(calls.get() + 1);
                Err(StoreError::Quota {
                    resource: "deps".to_string(),
                    message: "full".to_string(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Quota { .. }));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_cancelled_before_first_attempt() {
        let ctx = CallContext::new();
        ctx.cancel_token().cancel();

        let calls = Cell::new(0);
        let err = RetryPolicy::immediate(4)
            .run::<(), _>(&ctx, StoreOp::RegisterVersion, |_| {
                calls.set(calls.get() + 1);
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled { op: StoreOp::RegisterVersion }));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_cancel_interrupts_backoff() {
        let token = CancelToken::new();
        let ctx = CallContext::new().with_cancel_token(token.clone());
        let policy = RetryPolicy::default().with_delays(Duration::from_secs(30), Duration::from_secs(30));

        let started = Instant::now();
        let err = policy
            .run::<(), _>(&ctx, StoreOp::ListVersions, |_| {
                token.cancel();
                Err(transient())
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_deadline_interrupts_backoff() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
        let policy = RetryPolicy::default().with_delays(Duration::from_secs(30), Duration::from_secs(30));

        let err = policy
            .run::<(), _>(&ctx, StoreOp::ListVersions, |_| Err(transient()))
            .unwrap_err();
        assert!(matches!(err, StoreError::DeadlineExceeded { .. }));
    }

    #[test]
    fn test_context_remaining() {
        assert!(CallContext::new().remaining().is_none());
        let ctx = CallContext::new().with_timeout(Duration::from_secs(60));
        assert!(ctx.remaining().unwrap() > Duration::from_secs(50));
    }
}
