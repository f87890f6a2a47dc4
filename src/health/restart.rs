// Restart budget and backoff.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RestartSettings;

/// Exponential backoff capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Backoff {
    /// Delay before the given attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs).min(self.max)
    }
}

/// Counts restarts inside a rolling window.
///
/// Owned by a single lifeline, so no locking.
#[derive(Debug, Clone)]
pub struct RestartBudget {
    max: u32,
    window: Duration,
    attempts: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            attempts: VecDeque::with_capacity(max as usize),
        }
    }

    pub fn from_settings(cfg: &RestartSettings) -> Self {
        Self::new(cfg.max_restarts, cfg.window)
    }

    /// Takes one attempt if the window still has room. Returns the attempt
    /// number inside the window, or `None` when the budget is spent.
    pub fn try_acquire(&mut self, now: Instant) -> Option<u32> {
        self.prune(now);
        if self.attempts.len() >= self.max as usize {
            return None;
        }
        self.attempts.push_back(now);
        Some(self.attempts.len() as u32)
    }

    /// Attempts still counted against the window.
    pub fn used(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.attempts.len() as u32
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&first) = self.attempts.front() {
            if now.duration_since(first) >= self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let b = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        assert_eq!(b.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(b.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(b.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(b.delay_for_attempt(5), Duration::from_secs(1));
        assert_eq!(b.delay_for_attempt(500), Duration::from_secs(1));
    }

    #[test]
    fn test_budget_exhausts_at_max() {
        let mut budget = RestartBudget::new(3, Duration::from_secs(60));
        let now = Instant::now();
        assert_eq!(budget.try_acquire(now), Some(1));
        assert_eq!(budget.try_acquire(now), Some(2));
        assert_eq!(budget.try_acquire(now), Some(3));
        assert_eq!(budget.try_acquire(now), None);
        assert_eq!(budget.used(now), 3);
    }

    #[test]
    fn test_budget_window_rolls() {
        let mut budget = RestartBudget::new(2, Duration::from_secs(10));
        let start = Instant::now();
        budget.try_acquire(start);
        budget.try_acquire(start + Duration::from_secs(5));
        assert_eq!(budget.try_acquire(start + Duration::from_secs(6)), None);

        // The first attempt leaves the window.
        assert_eq!(budget.try_acquire(start + Duration::from_secs(10)), Some(2));
    }
}
