//! Fixed-interval polling shared by every upstream wait loop.
//!
//! All provider queues (Cebia base info, Cebia coupons, PDF.co jobs, the
//! checkcar.vin status check) resolve on their own schedule, so the loops are
//! simple: try, sleep a fixed interval, give up after a fixed number of tries.
//! The sleep is raced against a [`CancellationToken`] so a caller can abort a
//! stuck run.

use std::future::Future;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    /// Sleep before the first attempt too (slow job queues).
    pub delay_first: bool,
}

impl PollPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            delay_first: false,
        }
    }

    pub const fn delayed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            delay_first: true,
        }
    }
}

/// Result of a single attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Ready(T),
    Pending,
    Abort(String),
}

#[derive(Debug, PartialEq)]
pub enum PollOutcome<T> {
    Ready(T),
    Exhausted,
    Aborted(String),
    Cancelled,
}

pub async fn poll_until<T, F, Fut>(
    policy: PollPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> PollOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    for n in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        if (policy.delay_first || n > 1) && !policy.interval.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return PollOutcome::Cancelled,
                _ = sleep(policy.interval) => {}
            }
        }
        match attempt(n).await {
            Attempt::Ready(value) => return PollOutcome::Ready(value),
            Attempt::Abort(reason) => return PollOutcome::Aborted(reason),
            Attempt::Pending => {}
        }
    }
    PollOutcome::Exhausted
}
