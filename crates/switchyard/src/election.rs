use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use switch_transport::ElectionId;

/// Hands out strictly increasing election ids, seeded from wall-clock time so
/// a restarted process outbids its previous incarnation.
#[derive(Debug)]
pub struct ElectionIdGenerator {
    next: AtomicU64,
}

impl Default for ElectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ElectionIdGenerator {
    pub fn new() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        Self::starting_at(seconds.max(1))
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    pub fn next_id(&self) -> ElectionId {
        ElectionId::from(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase_and_skip_zero() {
        let generator = ElectionIdGenerator::starting_at(0);
        let first = generator.next_id();
        assert_eq!(first, 1);
        assert!(generator.next_id() > first);
        assert!(ElectionIdGenerator::new().next_id() > 1_000_000);
    }
}
