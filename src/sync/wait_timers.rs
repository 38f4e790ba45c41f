//! Wait timers armed by clock-only notifications.
//!
//! The pull side arms one timer per announced clock it does not hold yet.
//! A clock already covered by a pending timer arms nothing. Data covering a
//! timer's clock clears it; a timer that expires means the data never came.

use meshsync_proto::VectorClock;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct WaitTimers {
    timeout: Duration,
    pending: Vec<(VectorClock, Instant)>,
}

impl WaitTimers {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: Vec::new(),
        }
    }

    /// Arm a timer for `clock` unless `local` already has it or a pending
    /// timer covers it. Returns whether a timer was armed.
    pub fn on_clock(&mut self, clock: &VectorClock, local: &VectorClock) -> bool {
        if VectorClock::does_second_have_first(clock, local) {
            return false;
        }
        if self
            .pending
            .iter()
            .any(|(waiting, _)| VectorClock::does_second_have_first(clock, waiting))
        {
            return false;
        }
        self.pending.push((clock.clone(), Instant::now() + self.timeout));
        true
    }

    /// Clear every timer whose clock is covered by `clock`.
    pub fn on_data(&mut self, clock: &VectorClock) {
        self.pending
            .retain(|(waiting, _)| !VectorClock::does_second_have_first(waiting, clock));
    }

    /// Resolve with the clock of the earliest timer once it expires.
    ///
    /// Cancel-safe: the timer is only removed when this resolves.
    pub async fn next_expired(&mut self) -> VectorClock {
        let Some(deadline) = self.pending.iter().map(|(_, at)| *at).min() else {
            return std::future::pending().await;
        };
        tokio::time::sleep_until(deadline).await;

        let idx = self
            .pending
            .iter()
            .position(|(_, at)| *at == deadline)
            .unwrap_or(0);
        self.pending.remove(idx).0
    }

    pub fn stop(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
