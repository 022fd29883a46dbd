use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::types::Partition;

#[derive(Debug, Clone, Copy)]
struct Usage {
    last_activity: Instant,
    revoked: bool,
}

/// Tracks the last activity time per partition so periodic jobs only fire
/// for partitions that have been idle long enough. Revoked partitions are
/// excluded until they see traffic again.
#[derive(Debug, Default)]
pub struct UsageTracker {
    entries: DashMap<Partition, Usage>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity for a partition, clearing any revoked marker.
    pub fn track(&self, partition: &Partition) {
        self.entries.insert(
            partition.clone(),
            Usage {
                last_activity: Instant::now(),
                revoked: false,
            },
        );
    }

    pub fn revoke(&self, partition: &Partition) {
        if let Some(mut usage) = self.entries.get_mut(partition) {
            usage.revoked = true;
        }
    }

    pub fn revoked(&self, partition: &Partition) -> bool {
        self.entries.get(partition).is_some_and(|u| u.revoked)
    }

    /// True when the partition saw activity within `interval`. Revoked
    /// partitions are never active.
    pub fn active_within(&self, partition: &Partition, interval: Duration) -> bool {
        self.entries
            .get(partition)
            .is_some_and(|u| !u.revoked && u.last_activity.elapsed() < interval)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_partition(num: i32) -> Partition {
        Partition::new("test-topic".to_string(), num)
    }

    #[test]
    fn test_tracked_partition_is_active() {
        let tracker = UsageTracker::new();
        let partition = test_partition(0);

        assert!(!tracker.active_within(&partition, Duration::from_secs(1)));

        tracker.track(&partition);
        assert!(tracker.active_within(&partition, Duration::from_secs(1)));
    }

    #[test]
    fn test_revoked_partition_is_not_active() {
        let tracker = UsageTracker::new();
        let partition = test_partition(0);

        tracker.track(&partition);
        tracker.revoke(&partition);

        assert!(tracker.revoked(&partition));
        assert!(!tracker.active_within(&partition, Duration::from_secs(60)));
    }

    #[test]
    fn test_tracking_clears_revocation() {
        let tracker = UsageTracker::new();
        let partition = test_partition(0);

        tracker.track(&partition);
        tracker.revoke(&partition);
        tracker.track(&partition);

        assert!(!tracker.revoked(&partition));
        assert!(tracker.active_within(&partition, Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_interval_means_inactive() {
        let tracker = UsageTracker::new();
        let partition = test_partition(0);
        tracker.track(&partition);
        assert!(!tracker.active_within(&partition, Duration::ZERO));
    }
}
