//! Timer/dispatch surface (component G).
//!
//! A [`TimerHandle`] owns a scheduled callback running on the same
//! single-threaded local task set as the egress engine. Dropping the handle
//! cancels the callback synchronously -- it is guaranteed not to fire after
//! the handle is dropped, matching the cancel-on-drop contract the entry
//! lifecycle (component D) relies on.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct TimerHandle {
    join: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Schedules `callback` to run after `delay` on the current `LocalSet`.
    /// Must be called from within a `LocalSet` context (`spawn_local`).
    pub fn schedule<F>(delay: Duration, callback: F) -> Self
    where
        F: Future<Output = ()> + 'static,
    {
        let join = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            callback.await;
        });
        Self { join: Some(join) }
    }

    /// Cancels the timer. Equivalent to dropping the handle, spelled out for
    /// call sites where the intent should read explicitly.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

/// Exponential backoff with a cap, used for Map-Request retry scheduling.
/// `attempt` is 1-based (the first retry uses `base`).
pub fn backoff_delay(base: Duration, factor: u32, cap: Duration, attempt: u32) -> Duration {
    let multiplier = factor.saturating_pow(attempt.saturating_sub(1));
    base.checked_mul(multiplier).map(|d| d.min(cap)).unwrap_or(cap)
}
