//! Backoff waits between retry attempts.
//!
//! The retry driver never calls `tokio::time::sleep` directly: every
//! delay goes through a [`Sleeper`] keyed by the upcoming attempt number,
//! so tests can assert the exact backoff schedule a call would have
//! waited out without spending real time.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    /// Wait out the delay scheduled before `attempt` runs. `attempt` is
    /// the 1-based number of the attempt that follows the wait.
    async fn backoff(&self, attempt: u32, delay: Duration);
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn backoff(&self, _attempt: u32, delay: Duration) {
        tokio::time::sleep(delay).await
    }
}

/// Test double that returns immediately and remembers the backoff
/// schedule it was asked to wait out.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    schedule: Arc<Mutex<Vec<(u32, Duration)>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(attempt, delay)` pairs in the order they were scheduled.
    pub fn schedule(&self) -> Vec<(u32, Duration)> {
        self.schedule.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Just the delays, in schedule order.
    pub fn delays(&self) -> Vec<Duration> {
        self.schedule
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, delay)| *delay)
            .collect()
    }

    /// Total time a real caller would have spent backing off.
    pub fn total_delay(&self) -> Duration {
        self.schedule
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, delay)| *delay)
            .sum()
    }

    pub fn clear(&self) {
        self.schedule.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn backoff(&self, attempt: u32, delay: Duration) {
        self.schedule
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((attempt, delay));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn tokio_sleeper_waits_at_least_the_requested_delay() {
        let start = Instant::now();
        TokioSleeper.backoff(2, Duration::from_millis(50)).await;
        // Small tolerance for timer slop.
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn recording_sleeper_returns_immediately_and_keeps_the_schedule() {
        let sleeper = RecordingSleeper::new();
        let start = Instant::now();
        sleeper.backoff(2, Duration::from_millis(10)).await;
        sleeper.backoff(3, Duration::from_millis(20)).await;
        assert!(start.elapsed() < Duration::from_millis(10));

        assert_eq!(
            sleeper.schedule(),
            vec![(2, Duration::from_millis(10)), (3, Duration::from_millis(20))]
        );
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[tokio::test]
    async fn total_delay_sums_the_schedule() {
        let sleeper = RecordingSleeper::new();
        sleeper.backoff(2, Duration::from_millis(10)).await;
        sleeper.backoff(3, Duration::from_millis(20)).await;
        assert_eq!(sleeper.total_delay(), Duration::from_millis(30));

        sleeper.clear();
        assert!(sleeper.schedule().is_empty());
        assert_eq!(sleeper.total_delay(), Duration::ZERO);
    }
}
