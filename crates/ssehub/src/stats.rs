//! Push statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic push counters owned by one hub.
#[derive(Debug, Default)]
pub struct PushStats {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    timeout: AtomicU64,
}

/// Point-in-time copy of [`PushStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushStatsSnapshot {
    /// Per-target push attempts.
    pub total: u64,
    /// Records written to a live connection.
    pub success: u64,
    /// Attempts that exhausted their retries or hit a dead connection.
    pub failed: u64,
    /// Single retry attempts that ran past their deadline.
    pub timeout: u64,
}

impl PushStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PushStatsSnapshot {
        PushStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for PushStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={} success={} failed={} timeout={}",
            self.total, self.success, self.failed, self.timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_is_a_copy() {
        let stats = PushStats::new();
        stats.record_total();
        let before = stats.snapshot();
        stats.record_total();
        stats.record_success();

        assert_eq!(before.total, 1);
        assert_eq!(stats.snapshot().total, 2);
        assert_eq!(stats.snapshot().success, 1);
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = Arc::new(PushStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_total();
                        stats.record_timeout();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.total, 8000);
        assert_eq!(snap.timeout, 8000);
        assert_eq!(snap.failed, 0);
    }

    #[test]
    fn test_display() {
        let snap = PushStatsSnapshot {
            total: 3,
            success: 2,
            failed: 1,
            timeout: 0,
        };
        assert_eq!(snap.to_string(), "total=3 success=2 failed=1 timeout=0");
    }
}
