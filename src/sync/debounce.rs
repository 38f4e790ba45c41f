//! Trailing-edge coalescing timer.

use std::time::Duration;
use tokio::time::Instant;

/// Fires once `delay` after the last trigger.
///
/// Owned by exactly one task; waiting is done inside that task's `select!`.
#[derive(Debug)]
pub struct Debounce {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    /// Arm the timer, pushing back any pending deadline.
    pub fn trigger(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    /// Takes effect on the next trigger.
    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolve when the pending deadline passes. Never resolves while idle.
    ///
    /// Cancel-safe: dropping the future leaves the deadline armed.
    pub async fn wait(&mut self) {
        match self.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_last_trigger() {
        let mut debounce = Debounce::new(Duration::from_millis(100));
        let start = Instant::now();

        debounce.trigger();
        tokio::time::advance(Duration::from_millis(60)).await;
        debounce.trigger();
        debounce.wait().await;

        assert_eq!(start.elapsed(), Duration::from_millis(160));
        assert!(!debounce.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_never_fires() {
        let mut debounce = Debounce::new(Duration::from_millis(10));
        let fired = tokio::time::timeout(Duration::from_secs(5), debounce.wait()).await;
        assert!(fired.is_err());

        debounce.trigger();
        debounce.cancel();
        let fired = tokio::time::timeout(Duration::from_secs(5), debounce.wait()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_delay() {
        let mut debounce = Debounce::new(Duration::from_millis(200));
        debounce.set_delay(Duration::from_secs(5));
        assert_eq!(debounce.delay(), Duration::from_secs(5));

        let start = Instant::now();
        debounce.trigger();
        debounce.wait().await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }
}
