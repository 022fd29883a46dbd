use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use serde::de::DeserializeOwned;

use crate::client::Client;
use crate::coordinator::Coordinator;
use crate::types::Partition;

/// Hydrate a message payload into a typed value. Consumers that work with
/// JSON payloads call this instead of touching the raw bytes.
pub fn parse_payload<T: DeserializeOwned>(message: &OwnedMessage) -> Result<T> {
    let payload = message
        .payload()
        .ok_or_else(|| anyhow!("message at offset {} has no payload", message.offset()))?;
    serde_json::from_slice(payload)
        .map_err(|e| anyhow!("failed to deserialize message at offset {}: {e}", message.offset()))
}

/// User-provided message processing code.
///
/// One instance is bound to one `(partition, virtual group)` executor and
/// never runs more than one callback at a time. Errors returned from
/// `consume` flip the batch into the retry/DLQ path; errors from the other
/// callbacks are logged and dropped.
#[async_trait]
pub trait Consumer: Send {
    async fn on_before_consume(&mut self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }

    async fn consume(&mut self, messages: &[OwnedMessage], ctx: &JobContext) -> Result<()>;

    async fn on_after_consume(&mut self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }

    /// Called when a poll cycle produced no messages for this partition.
    async fn on_idle(&mut self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }

    /// Called on the periodic tick for partitions without recent activity.
    async fn on_periodic(&mut self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }

    /// Called when the partition was revoked in a rebalance.
    async fn on_revoked(&mut self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }

    async fn on_shutdown(&mut self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }
}

/// Factory invoked lazily when the first message for a `(partition, virtual
/// group)` pair arrives.
pub type ConsumerFactory = Arc<dyn Fn() -> Box<dyn Consumer> + Send + Sync>;

/// Handle passed into every consumer callback. Exposes the offset-control
/// surface scoped to the job's partition.
#[derive(Clone)]
pub struct JobContext {
    client: Arc<dyn Client>,
    coordinator: Arc<Coordinator>,
    partition: Partition,
}

impl JobContext {
    pub fn new(client: Arc<dyn Client>, coordinator: Arc<Coordinator>, partition: Partition) -> Self {
        Self {
            client,
            coordinator,
            partition,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// True once the partition was revoked from this process. Long-running
    /// consumers should check this between units of work.
    pub fn revoked(&self) -> bool {
        self.coordinator.revoked()
    }

    /// Record `message` as consumed. The offset is committed from the
    /// post-consume path once the whole batch has finished, so virtual
    /// partition jobs finishing out of broker order cannot commit past an
    /// unfinished sibling.
    pub fn mark_as_consumed(&self, message: &OwnedMessage) {
        self.coordinator.mark(message.offset() + 1);
    }

    /// Pause the partition and position the next fetch at `offset`. The
    /// pause is manual: it stays until user code seeks/resumes or the
    /// partition is revoked.
    pub fn pause(&self, offset: i64) -> Result<()> {
        self.coordinator.pause_manual();
        self.client.pause(&self.partition)?;
        self.client.seek(&self.partition, offset)
    }

    /// Move the fetch position without pausing.
    pub fn seek(&self, offset: i64) -> Result<()> {
        self.client.seek(&self.partition, offset)
    }

    /// Back off and retry the current batch: opens the next backoff window,
    /// pauses the partition and rewinds to the first uncommitted offset.
    pub fn retry_after_pause(&self) -> Result<()> {
        self.coordinator.backoff();
        self.client.pause(&self.partition)?;
        self.client.seek(&self.partition, self.coordinator.seek_offset())
    }

    pub(crate) fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_message;
    use rdkafka::message::Timestamp;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Event {
        name: String,
        count: u32,
    }

    #[test]
    fn test_parse_payload_hydrates_json() {
        let message = test_message("events", 0, 1, r#"{"name":"signup","count":3}"#);
        let event: Event = parse_payload(&message).unwrap();
        assert_eq!(
            event,
            Event {
                name: "signup".to_string(),
                count: 3
            }
        );
    }

    #[test]
    fn test_parse_payload_rejects_invalid_json() {
        let message = test_message("events", 0, 1, "not-json");
        let result: Result<Event> = parse_payload(&message);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_payload_requires_a_payload() {
        let message = OwnedMessage::new(
            None,
            None,
            "events".to_string(),
            Timestamp::NotAvailable,
            0,
            7,
            None,
        );
        let result: Result<Event> = parse_payload(&message);
        assert!(result.unwrap_err().to_string().contains("no payload"));
    }
}
