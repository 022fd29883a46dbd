use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rdkafka::message::OwnedMessage;

use crate::dlq::DlqRecord;
use crate::types::Partition;

/// Entry of a time-based offset lookup request.
#[derive(Debug, Clone)]
pub struct TimeOffsetQuery {
    pub topic: String,
    pub partition: i32,
    pub timestamp_ms: i64,
}

/// Result entry of a time-based offset lookup. `offset` is `None` when the
/// broker found no message at or after the requested timestamp.
#[derive(Debug, Clone)]
pub struct TimeOffsetResult {
    pub topic: String,
    pub partition: i32,
    pub offset: Option<i64>,
}

/// The boundary to the Kafka wire client.
///
/// One instance is owned by exactly one listener. Polling happens only on the
/// listener task; `pause`, `resume`, `seek`, `mark_as_consumed` and `produce`
/// may additionally be called from worker tasks inside the post-consume path,
/// so implementations must be thread-safe for those operations.
#[async_trait]
pub trait Client: Send + Sync {
    /// Fetch the next batch of messages. An empty vec means no traffic within
    /// the poll window. Polling also services rebalance callbacks, so revoked
    /// partitions reported by `revoked_partitions` are current after a poll.
    async fn batch_poll(&self) -> Result<Vec<OwnedMessage>>;

    /// Service client-internal events (delivery callbacks, statistics)
    /// without fetching messages.
    async fn events_poll(&self, timeout: Duration);

    /// Keep the broker session alive without consuming.
    async fn ping(&self);

    fn pause(&self, partition: &Partition) -> Result<()>;

    fn resume(&self, partition: &Partition) -> Result<()>;

    fn seek(&self, partition: &Partition, offset: i64) -> Result<()>;

    /// Record `offset` as the next offset to consume for `partition`. The
    /// commit itself may be deferred to `commit_offsets` or the client's
    /// auto-commit cycle.
    fn mark_as_consumed(&self, partition: &Partition, offset: i64) -> Result<()>;

    fn commit_offsets(&self) -> Result<()>;

    /// Produce a record to a dead-letter topic, awaiting delivery.
    async fn produce(&self, record: DlqRecord) -> Result<()>;

    /// Partitions revoked since the last call. Draining: each revocation is
    /// reported exactly once.
    fn revoked_partitions(&self) -> Vec<Partition>;

    /// Current assignment snapshot.
    fn assignment(&self) -> Vec<Partition>;

    /// Low and high watermark offsets of a partition.
    fn query_watermark_offsets(&self, topic: &str, partition: i32) -> Result<(i64, i64)>;

    /// Resolve timestamps to offsets for all queries in one broker round
    /// trip.
    fn offsets_for_times(
        &self,
        queries: Vec<TimeOffsetQuery>,
        timeout: Duration,
    ) -> Result<Vec<TimeOffsetResult>>;

    /// Close the client. Idempotent.
    async fn stop(&self);

    /// Drop connection state so the next poll starts from a fresh session.
    /// Used by the listener's restart path.
    fn reset(&self);
}
