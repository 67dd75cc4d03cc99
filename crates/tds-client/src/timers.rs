//! Single-shot connection timers.
//!
//! A [`Timer`] is either disarmed or holds one pending deadline. Arming an
//! armed timer replaces the old deadline. Waiting on a disarmed timer never
//! completes, so timers can sit in every `select!` regardless of state.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Sleep, sleep};

/// One single-shot timer.
#[derive(Debug)]
pub(crate) struct Timer {
    name: &'static str,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Timer {
    pub(crate) fn new(name: &'static str) -> Self {
        Self { name, sleep: None }
    }

    /// Arm the timer, replacing any earlier deadline.
    pub(crate) fn arm(&mut self, duration: Duration) {
        self.clear();
        tracing::trace!(timer = self.name, ?duration, "timer armed");
        self.sleep = Some(Box::pin(sleep(duration)));
    }

    pub(crate) fn clear(&mut self) {
        if self.sleep.take().is_some() {
            tracing::trace!(timer = self.name, "timer cleared");
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Completes when the deadline passes; the timer is disarmed afterwards.
    ///
    /// Cancel safe: dropping the future leaves the timer armed.
    pub(crate) async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
                tracing::trace!(timer = self.name, "timer fired");
            }
            None => pending::<()>().await,
        }
    }
}

/// The four connection timers.
#[derive(Debug)]
pub(crate) struct Timers {
    /// Bounds one connection attempt up to the end of the initial SQL.
    pub(crate) connect: Timer,
    /// Bounds the wait for an attention acknowledgement.
    pub(crate) cancel: Timer,
    /// Bounds one request.
    pub(crate) request: Timer,
    /// Delay before a transient retry.
    pub(crate) retry: Timer,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self {
            connect: Timer::new("connect"),
            cancel: Timer::new("cancel"),
            request: Timer::new("request"),
            retry: Timer::new("retry"),
        }
    }

    pub(crate) fn clear_all(&mut self) {
        self.connect.clear();
        self.cancel.clear();
        self.request.clear();
        self.retry.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once() {
        let mut timer = Timer::new("test");
        timer.arm(Duration::from_millis(50));
        assert!(timer.is_armed());

        timer.fired().await;
        assert!(!timer.is_armed());

        let waited = tokio::time::timeout(Duration::from_secs(1), timer.fired()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_deadline() {
        let mut timer = Timer::new("test");
        timer.arm(Duration::from_millis(10));
        timer.arm(Duration::from_secs(10));
        let early = tokio::time::timeout(Duration::from_millis(100), timer.fired()).await;
        assert!(early.is_err());
        assert!(timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_disarms() {
        let mut timers = Timers::new();
        timers.request.arm(Duration::from_millis(5));
        timers.connect.arm(Duration::from_secs(15));
        timers.clear_all();
        assert!(!timers.request.is_armed());
        assert!(!timers.connect.is_armed());

        tokio::time::advance(Duration::from_millis(10)).await;
        let fired = tokio::time::timeout(Duration::from_millis(50), timers.request.fired()).await;
        assert!(fired.is_err());
    }
}
