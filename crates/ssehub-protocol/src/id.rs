//! Event id minting.
//!
//! Ids are the current time in microseconds scaled by 1000 plus up to 999 of
//! random jitter, forced strictly above the previously minted value. They stay
//! 19 digits wide, so lexicographic and numeric order agree.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Mint a new process-unique, monotonically increasing event id.
pub fn next_id() -> String {
    let micros = chrono::Utc::now().timestamp_micros().max(0) as u64;
    let candidate = micros
        .saturating_mul(1000)
        .saturating_add(rand::rng().random_range(0..1000));

    let mut prev = LAST_ID.load(Ordering::Relaxed);
    loop {
        let next = candidate.max(prev + 1);
        match LAST_ID.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next.to_string(),
            Err(actual) => prev = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_strictly_increase() {
        let ids: Vec<u64> = (0..1000).map(|_| next_id().parse().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..500).map(|_| next_id()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id minted");
            }
        }
        assert_eq!(seen.len(), 2000);
    }

    #[test]
    fn test_id_width_is_stable() {
        assert_eq!(next_id().len(), 19);
    }
}
