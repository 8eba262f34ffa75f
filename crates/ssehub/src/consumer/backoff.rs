//! Reconnect backoff state.

use std::time::Duration;

/// Exponential backoff with a ceiling and an attempt cap.
///
/// `record_failure` is called once per failed connection. It returns the delay
/// before the next connection, or `None` once `max_attempts` connections have
/// failed in a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max_interval: Duration,
    attempts: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max_interval: Duration, max_attempts: u32) -> Self {
        let initial = initial.min(max_interval);
        Self {
            initial,
            current: initial,
            max_interval,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn record_failure(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.is_exhausted() {
            return None;
        }

        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max_interval);
        Some(delay)
    }

    /// Back to the initial interval after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Consecutive failed connections so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_exhausted() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30), 5);
        let delays: Vec<_> = std::iter::from_fn(|| backoff.record_failure()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
        assert_eq!(backoff.attempts(), 5);
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.record_failure(), None);
    }

    #[test]
    fn test_delay_is_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(30), 10);
        let delays: Vec<_> = std::iter::from_fn(|| backoff.record_failure()).collect();
        assert_eq!(delays.len(), 9);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[2..], [Duration::from_secs(30); 7]);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(1), 3);
        backoff.record_failure();
        backoff.record_failure();
        backoff.reset();

        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.record_failure(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_initial_above_ceiling_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(30), 2);
        assert_eq!(backoff.record_failure(), Some(Duration::from_secs(30)));
        assert_eq!(backoff.record_failure(), None);
    }
}
