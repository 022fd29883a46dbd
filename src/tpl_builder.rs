use std::collections::HashMap;
use std::time::Duration;

use crate::client::{Client, TimeOffsetQuery};
use crate::error::RuntimeError;
use crate::types::PartitionOffset;

const OFFSETS_FOR_TIMES_TIMEOUT: Duration = Duration::from_secs(2);

/// Where consumption of one partition should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    /// Use the offset as-is.
    Exact(i64),
    /// The last `n` messages: resolves to `max(low, high - n)` from the
    /// partition watermarks.
    Relative(i64),
    /// First message at or after the timestamp (unix millis).
    Timestamp(i64),
}

/// How one topic's partitions are requested.
#[derive(Debug, Clone)]
pub enum PartitionsSpec {
    /// Explicit partition numbers, all starting from offset 0.
    Partitions(Vec<i32>),
    /// Per-partition start offsets.
    Offsets(HashMap<i32, OffsetSpec>),
}

/// Normalizes an ad-hoc consumption request into a flat
/// topic-partition-offset list ready to subscribe with.
///
/// Timestamp lookups across all topics are batched into a single
/// `offsets_for_times` round trip.
pub struct TplBuilder<'a> {
    client: &'a dyn Client,
}

impl<'a> TplBuilder<'a> {
    pub fn new(client: &'a dyn Client) -> Self {
        Self { client }
    }

    pub fn call(
        &self,
        requests: HashMap<String, PartitionsSpec>,
    ) -> Result<Vec<PartitionOffset>, RuntimeError> {
        let mut resolved = Vec::new();
        let mut time_queries = Vec::new();

        for (topic, partitions) in requests {
            match partitions {
                PartitionsSpec::Partitions(partitions) => {
                    for partition in partitions {
                        resolved.push(PartitionOffset::new(
                            crate::types::Partition::new(topic.clone(), partition),
                            0,
                        ));
                    }
                }
                PartitionsSpec::Offsets(offsets) => {
                    for (partition, offset_spec) in offsets {
                        match offset_spec {
                            OffsetSpec::Exact(offset) => {
                                resolved.push(PartitionOffset::new(
                                    crate::types::Partition::new(topic.clone(), partition),
                                    offset.max(0),
                                ));
                            }
                            OffsetSpec::Relative(count) => {
                                let (low, high) = self
                                    .client
                                    .query_watermark_offsets(&topic, partition)
                                    .map_err(|e| {
                                        RuntimeError::InvalidConfiguration(format!(
                                            "watermark lookup failed for {topic}-{partition}: {e}"
                                        ))
                                    })?;
                                // count is negative: high + count, clamped to
                                // the earliest available offset.
                                let offset = (high + count).max(low);
                                resolved.push(PartitionOffset::new(
                                    crate::types::Partition::new(topic.clone(), partition),
                                    offset,
                                ));
                            }
                            OffsetSpec::Timestamp(timestamp_ms) => {
                                time_queries.push(TimeOffsetQuery {
                                    topic: topic.clone(),
                                    partition,
                                    timestamp_ms,
                                });
                            }
                        }
                    }
                }
            }
        }

        if !time_queries.is_empty() {
            let results = self
                .client
                .offsets_for_times(time_queries, OFFSETS_FOR_TIMES_TIMEOUT)
                .map_err(|e| {
                    RuntimeError::InvalidConfiguration(format!(
                        "time-based offset lookup failed: {e}"
                    ))
                })?;

            for result in results {
                let offset = result.offset.ok_or(RuntimeError::InvalidTimeBasedOffset {
                    topic: result.topic.clone(),
                    partition: result.partition,
                })?;
                resolved.push(PartitionOffset::new(
                    crate::types::Partition::new(result.topic, result.partition),
                    offset,
                ));
            }
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockClient;

    fn find(resolved: &[PartitionOffset], topic: &str, partition: i32) -> i64 {
        resolved
            .iter()
            .find(|po| po.topic() == topic && po.partition_number() == partition)
            .map(|po| po.offset())
            .unwrap()
    }

    #[test]
    fn test_partition_list_starts_from_zero() {
        let client = MockClient::new();
        let builder = TplBuilder::new(&client);

        let resolved = builder
            .call(HashMap::from([(
                "events".to_string(),
                PartitionsSpec::Partitions(vec![0, 2]),
            )]))
            .unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(find(&resolved, "events", 0), 0);
        assert_eq!(find(&resolved, "events", 2), 0);
    }

    #[test]
    fn test_exact_offsets_pass_through() {
        let client = MockClient::new();
        let builder = TplBuilder::new(&client);

        let resolved = builder
            .call(HashMap::from([(
                "events".to_string(),
                PartitionsSpec::Offsets(HashMap::from([(1, OffsetSpec::Exact(42))])),
            )]))
            .unwrap();

        assert_eq!(find(&resolved, "events", 1), 42);
    }

    #[test]
    fn test_negative_offset_counts_back_from_high_watermark() {
        let client = MockClient::new();
        client.set_watermarks("events", 0, 0, 100);
        let builder = TplBuilder::new(&client);

        let resolved = builder
            .call(HashMap::from([(
                "events".to_string(),
                PartitionsSpec::Offsets(HashMap::from([(0, OffsetSpec::Relative(-5))])),
            )]))
            .unwrap();

        assert_eq!(find(&resolved, "events", 0), 95);
    }

    #[test]
    fn test_negative_offset_clamps_to_low_watermark() {
        let client = MockClient::new();
        client.set_watermarks("events", 0, 98, 100);
        let builder = TplBuilder::new(&client);

        let resolved = builder
            .call(HashMap::from([(
                "events".to_string(),
                PartitionsSpec::Offsets(HashMap::from([(0, OffsetSpec::Relative(-5))])),
            )]))
            .unwrap();

        assert_eq!(find(&resolved, "events", 0), 98);
    }

    #[test]
    fn test_timestamps_resolve_through_one_lookup() {
        let client = MockClient::new();
        client.set_time_offset("events", 0, Some(17));
        client.set_time_offset("audit", 3, Some(4));
        let builder = TplBuilder::new(&client);

        let resolved = builder
            .call(HashMap::from([
                (
                    "events".to_string(),
                    PartitionsSpec::Offsets(HashMap::from([(
                        0,
                        OffsetSpec::Timestamp(1_700_000_000_000),
                    )])),
                ),
                (
                    "audit".to_string(),
                    PartitionsSpec::Offsets(HashMap::from([(
                        3,
                        OffsetSpec::Timestamp(1_700_000_000_000),
                    )])),
                ),
            ]))
            .unwrap();

        assert_eq!(find(&resolved, "events", 0), 17);
        assert_eq!(find(&resolved, "audit", 3), 4);
    }

    #[test]
    fn test_missing_time_offset_is_an_error() {
        let client = MockClient::new();
        client.set_time_offset("events", 0, None);
        let builder = TplBuilder::new(&client);

        let err = builder
            .call(HashMap::from([(
                "events".to_string(),
                PartitionsSpec::Offsets(HashMap::from([(
                    0,
                    OffsetSpec::Timestamp(1_700_000_000_000),
                )])),
            )]))
            .unwrap_err();

        assert!(matches!(
            err,
            RuntimeError::InvalidTimeBasedOffset { partition: 0, .. }
        ));
    }

    #[test]
    fn test_mixed_specs_resolve_together() {
        let client = MockClient::new();
        client.set_watermarks("events", 1, 10, 50);
        client.set_time_offset("events", 2, Some(33));
        let builder = TplBuilder::new(&client);

        let resolved = builder
            .call(HashMap::from([(
                "events".to_string(),
                PartitionsSpec::Offsets(HashMap::from([
                    (0, OffsetSpec::Exact(5)),
                    (1, OffsetSpec::Relative(-100)),
                    (2, OffsetSpec::Timestamp(1_700_000_000_000)),
                ])),
            )]))
            .unwrap();

        assert_eq!(find(&resolved, "events", 0), 5);
        assert_eq!(find(&resolved, "events", 1), 10);
        assert_eq!(find(&resolved, "events", 2), 33);
    }
}
