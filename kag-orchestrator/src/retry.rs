//! Bounded polling / retry with backoff.
//!
//! Every wait in the tool (droplet boot, droplet removal, SSH readiness) goes
//! through [`poll`] so the bounds live in one [`RetryPolicy`] value instead of
//! ad hoc sleep loops at call sites.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Overall budget. The first attempt always runs.
    pub timeout: Duration,
    /// Delay before the second attempt.
    pub interval: Duration,
    /// Multiplier applied to the delay after each attempt (1.0 = fixed interval).
    pub backoff: f64,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub const fn fixed(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            backoff: 1.0,
            max_interval: interval,
        }
    }

    pub const fn with_backoff(timeout: Duration, interval: Duration, backoff: f64, max_interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            backoff,
            max_interval,
        }
    }

    /// Droplet create/destroy polling: every 5s for up to 2 minutes.
    pub const fn cloud_default() -> Self {
        Self::fixed(Duration::from_secs(120), Duration::from_secs(5))
    }

    /// A freshly booted droplet can take a while before sshd answers.
    pub const fn ssh_default() -> Self {
        Self::with_backoff(
            Duration::from_secs(180),
            Duration::from_secs(5),
            1.5,
            Duration::from_secs(20),
        )
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let scaled = current.mul_f64(self.backoff.max(1.0));
        scaled.min(self.max_interval.max(self.interval))
    }
}

/// Result of a single attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Ready(T),
    /// Not there yet; the string describes what was observed.
    Pending(String),
}

#[derive(Debug)]
pub enum PollError<E> {
    /// An attempt failed hard; polling stopped immediately.
    Failed(E),
    TimedOut {
        attempts: u32,
        waited: Duration,
        last: String,
    },
}

/// Run `attempt` until it returns [`Attempt::Ready`], a hard error, or the
/// policy's budget is spent.
pub async fn poll<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut attempt: F) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
{
    let started = Instant::now();
    let mut delay = policy.interval;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let last = match attempt().await {
            Ok(Attempt::Ready(v)) => return Ok(v),
            Ok(Attempt::Pending(observed)) => observed,
            Err(e) => return Err(PollError::Failed(e)),
        };

        let waited = started.elapsed();
        if waited + delay > policy.timeout {
            return Err(PollError::TimedOut {
                attempts,
                waited,
                last,
            });
        }
        debug!("[retry] {} not ready (attempt {}): {}; next try in {:?}", label, attempts, last, delay);
        sleep(delay).await;
        delay = policy.next_delay(delay);
    }
}
