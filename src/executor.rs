use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use rdkafka::message::OwnedMessage;
use tokio::sync::Mutex;

use crate::config::TopicConfig;
use crate::consumer::{Consumer, JobContext};
use crate::types::{Partition, VirtualGroupId};

/// Binds one user consumer instance to a `(partition, virtual group)` pair
/// and drives its lifecycle callbacks. The consumer sits behind an async
/// mutex, so at most one job runs per executor at a time.
pub struct Executor {
    partition: Partition,
    group_id: VirtualGroupId,
    consumer: Mutex<Box<dyn Consumer>>,
}

impl Executor {
    pub fn new(partition: Partition, group_id: VirtualGroupId, consumer: Box<dyn Consumer>) -> Self {
        Self {
            partition,
            group_id,
            consumer: Mutex::new(consumer),
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn group_id(&self) -> VirtualGroupId {
        self.group_id
    }

    /// Run the consume flow: before hook, user code, after hook. The first
    /// error wins; the after hook still runs when consume fails.
    pub async fn consume(&self, messages: &[OwnedMessage], ctx: &JobContext) -> Result<()> {
        let mut consumer = self.consumer.lock().await;
        consumer.on_before_consume(ctx).await?;
        let consumed = consumer.consume(messages, ctx).await;
        let after = consumer.on_after_consume(ctx).await;
        consumed.and(after)
    }

    pub async fn idle(&self, ctx: &JobContext) -> Result<()> {
        self.consumer.lock().await.on_idle(ctx).await
    }

    pub async fn periodic(&self, ctx: &JobContext) -> Result<()> {
        self.consumer.lock().await.on_periodic(ctx).await
    }

    pub async fn revoked(&self, ctx: &JobContext) -> Result<()> {
        self.consumer.lock().await.on_revoked(ctx).await
    }

    pub async fn shutdown(&self, ctx: &JobContext) -> Result<()> {
        self.consumer.lock().await.on_shutdown(ctx).await
    }
}

/// Indexed store of executors for one subscription group. Executors are
/// created lazily on first message arrival and dropped on revocation,
/// shutdown or listener restart.
#[derive(Default)]
pub struct ExecutorsBuffer {
    executors: DashMap<(Partition, VirtualGroupId), Arc<Executor>>,
}

impl ExecutorsBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_or_create(
        &self,
        partition: &Partition,
        group_id: VirtualGroupId,
        topic: &TopicConfig,
    ) -> Arc<Executor> {
        self.executors
            .entry((partition.clone(), group_id))
            .or_insert_with(|| {
                let consumer = (topic.consumer_factory)();
                Arc::new(Executor::new(partition.clone(), group_id, consumer))
            })
            .clone()
    }

    /// All executors currently bound to a partition, across virtual groups.
    pub fn for_partition(&self, partition: &Partition) -> Vec<Arc<Executor>> {
        let mut executors: Vec<_> = self
            .executors
            .iter()
            .filter(|entry| &entry.key().0 == partition)
            .map(|entry| entry.value().clone())
            .collect();
        executors.sort_by_key(|e| e.group_id());
        executors
    }

    /// Drop every executor of a revoked partition. Jobs already holding an
    /// `Arc` keep their executor alive until they finish.
    pub fn revoke(&self, partition: &Partition) {
        self.executors.retain(|(p, _), _| p != partition);
    }

    pub fn all(&self) -> Vec<Arc<Executor>> {
        self.executors
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn clear(&self) {
        self.executors.clear();
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{counting_consumer_factory, noop_consumer_factory, ConsumerCalls};

    fn test_partition(num: i32) -> Partition {
        Partition::new("test-topic".to_string(), num)
    }

    #[test]
    fn test_find_or_create_is_lazy_and_stable() {
        let buffer = ExecutorsBuffer::new();
        let calls = ConsumerCalls::default();
        let topic = TopicConfig::new("test-topic", "group-a", counting_consumer_factory(&calls));

        assert_eq!(calls.created(), 0);

        let first = buffer.find_or_create(&test_partition(0), 0, &topic);
        let again = buffer.find_or_create(&test_partition(0), 0, &topic);
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(calls.created(), 1);

        let other_group = buffer.find_or_create(&test_partition(0), 1, &topic);
        assert!(!Arc::ptr_eq(&first, &other_group));
        assert_eq!(calls.created(), 2);
    }

    #[test]
    fn test_for_partition_scopes_by_partition() {
        let buffer = ExecutorsBuffer::new();
        let topic = TopicConfig::new("test-topic", "group-a", noop_consumer_factory());

        buffer.find_or_create(&test_partition(0), 0, &topic);
        buffer.find_or_create(&test_partition(0), 1, &topic);
        buffer.find_or_create(&test_partition(1), 0, &topic);

        assert_eq!(buffer.for_partition(&test_partition(0)).len(), 2);
        assert_eq!(buffer.for_partition(&test_partition(1)).len(), 1);
    }

    #[test]
    fn test_revoke_drops_only_the_partition() {
        let buffer = ExecutorsBuffer::new();
        let topic = TopicConfig::new("test-topic", "group-a", noop_consumer_factory());

        buffer.find_or_create(&test_partition(0), 0, &topic);
        buffer.find_or_create(&test_partition(0), 3, &topic);
        buffer.find_or_create(&test_partition(1), 0, &topic);

        buffer.revoke(&test_partition(0));

        assert!(buffer.for_partition(&test_partition(0)).is_empty());
        assert_eq!(buffer.len(), 1);
    }
}
