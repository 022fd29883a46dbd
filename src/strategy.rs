use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tracing::{debug, error, warn};

use crate::client::Client;
use crate::config::{DispatchMethod, FeatureSet, TopicConfig};
use crate::coordinator::{Coordinator, FinishedCallback};
use crate::dlq::DlqRecord;
use crate::metrics_consts::{
    CONSUME_RETRIES, DLQ_DISPATCHES, ERRORS_OCCURRED, MESSAGES_SKIPPED, PARTITION_PAUSES,
};

/// Post-consume policy of one topic: the unique function of its declared
/// feature set. Installed on every coordinator of the topic's partitions and
/// run by the worker that drains a batch to zero.
///
/// The whole decision tree is one straight-line function over the feature
/// flags; features compose by branching, not by layering types.
pub struct Strategy {
    topic: Arc<TopicConfig>,
    features: FeatureSet,
    client: Arc<dyn Client>,
}

#[async_trait]
impl FinishedCallback for Strategy {
    async fn on_finished(
        &self,
        coordinator: &Arc<Coordinator>,
        last_message: Option<OwnedMessage>,
    ) {
        self.handle_after_consume(coordinator, last_message).await;
    }
}

impl Strategy {
    pub fn new(topic: Arc<TopicConfig>, client: Arc<dyn Client>) -> Self {
        let features = topic.feature_set();
        Self {
            topic,
            features,
            client,
        }
    }

    pub fn features(&self) -> FeatureSet {
        self.features
    }

    /// Decide what happens to the partition after a batch completed:
    /// mark-as-consumed, retry-after-pause or skip-and-DLQ.
    pub async fn handle_after_consume(
        &self,
        coordinator: &Arc<Coordinator>,
        last_message: Option<OwnedMessage>,
    ) {
        if coordinator.revoked() {
            return;
        }

        if coordinator.success() {
            self.handle_success(coordinator, last_message);
            return;
        }

        // This failure is attempt N+1; the tracker increments when the
        // backoff window opens.
        let attempt = coordinator.pause_attempt() + 1;
        if attempt <= self.topic.max_retries() {
            self.retry_after_pause(coordinator);
        } else {
            self.skip_or_dispatch(coordinator).await;
        }
    }

    fn handle_success(&self, coordinator: &Arc<Coordinator>, last_message: Option<OwnedMessage>) {
        coordinator.reset_pause();

        if coordinator.manual_pause() {
            return;
        }

        if self.features.long_running_job {
            // The listener paused the partition when it scheduled this
            // batch; polling may continue now that the job is done.
            if let Err(e) = self.client.resume(coordinator.partition()) {
                warn!(partition = %coordinator.partition(), error = %e, "Resume after long-running job failed");
            }
        }

        self.mark_consumed(coordinator, last_message.as_ref());
        self.handle_post_filtering(coordinator);
    }

    fn mark_consumed(&self, coordinator: &Arc<Coordinator>, last_message: Option<&OwnedMessage>) {
        let offset = if self.features.manual_offset_management {
            // Only commit what user code explicitly marked. Marks are
            // collected per batch, so out-of-order virtual partition jobs
            // cannot commit past an unfinished sibling.
            match coordinator.marked_offset() {
                Some(offset) => offset,
                None => return,
            }
        } else {
            match last_message {
                Some(message) => message.offset() + 1,
                None => return,
            }
        };

        if let Err(e) = self.client.mark_as_consumed(coordinator.partition(), offset) {
            error!(partition = %coordinator.partition(), offset, error = %e, "Marking offset failed");
            metrics::counter!(ERRORS_OCCURRED, "type" => "strategy.mark_as_consumed.error")
                .increment(1);
        }
    }

    fn handle_post_filtering(&self, coordinator: &Arc<Coordinator>) {
        if !self.features.filtering {
            return;
        }
        let Some(action) = coordinator.post_filtering_action() else {
            return;
        };

        debug!(
            partition = %coordinator.partition(),
            cursor_offset = action.cursor_offset,
            "Seeking back to the filter cursor"
        );

        if let Err(e) = self.client.seek(coordinator.partition(), action.cursor_offset) {
            warn!(partition = %coordinator.partition(), error = %e, "Post-filtering seek failed");
            return;
        }

        if let Some(timeout) = action.timeout {
            coordinator.pause_for(timeout);
            if let Err(e) = self.client.pause(coordinator.partition()) {
                warn!(partition = %coordinator.partition(), error = %e, "Post-filtering pause failed");
            }
        }
    }

    fn retry_after_pause(&self, coordinator: &Arc<Coordinator>) {
        let partition = coordinator.partition();
        let timeout = coordinator.backoff();

        if let Err(e) = self.client.pause(partition) {
            warn!(partition = %partition, error = %e, "Pause for retry failed");
        }
        if let Err(e) = self.client.seek(partition, coordinator.seek_offset()) {
            warn!(partition = %partition, error = %e, "Seek for retry failed");
        }

        warn!(
            partition = %partition,
            attempt = coordinator.pause_attempt(),
            backoff_ms = timeout.as_millis() as u64,
            "Batch failed, pausing before retry"
        );
        metrics::counter!(CONSUME_RETRIES, "topic" => self.topic.name.clone()).increment(1);
        metrics::counter!(PARTITION_PAUSES, "topic" => self.topic.name.clone()).increment(1);
    }

    /// Retries exhausted: dead-letter the first uncommitted message (when a
    /// DLQ topic is configured and the predicate passes), commit past it and
    /// force a re-fetch from the new position via a nominal pause that the
    /// next resume tick lifts.
    async fn skip_or_dispatch(&self, coordinator: &Arc<Coordinator>) {
        let partition = coordinator.partition();
        coordinator.reset_pause();

        let Some(skippable) = coordinator.skippable_message() else {
            return;
        };

        if let Some(dlq) = &self.topic.dead_letter_queue {
            if let Some(dlq_topic) = &dlq.topic {
                if dlq.dispatch_to_dlq(&skippable) {
                    let record = DlqRecord::from_original(dlq_topic, &skippable);
                    self.dispatch_to_dlq(record, dlq.dispatch_method).await;
                }
            }
        }

        let next_offset = skippable.offset() + 1;
        warn!(
            partition = %partition,
            offset = skippable.offset(),
            "Retries exhausted, skipping message"
        );
        metrics::counter!(MESSAGES_SKIPPED, "topic" => self.topic.name.clone()).increment(1);

        if let Err(e) = self.client.mark_as_consumed(partition, next_offset) {
            error!(partition = %partition, error = %e, "Marking skipped offset failed");
        }

        coordinator.pause_nominal();
        if let Err(e) = self.client.pause(partition) {
            warn!(partition = %partition, error = %e, "Nominal pause failed");
        }
        if let Err(e) = self.client.seek(partition, next_offset) {
            warn!(partition = %partition, error = %e, "Seek past skipped message failed");
        }
    }

    async fn dispatch_to_dlq(&self, record: DlqRecord, method: DispatchMethod) {
        metrics::counter!(DLQ_DISPATCHES, "topic" => self.topic.name.clone()).increment(1);

        match method {
            DispatchMethod::ProduceSync => {
                if let Err(e) = self.client.produce(record).await {
                    error!(error = %e, "Dead letter dispatch failed");
                    metrics::counter!(ERRORS_OCCURRED, "type" => "strategy.dlq_dispatch.error")
                        .increment(1);
                }
            }
            DispatchMethod::ProduceAsync => {
                let client = self.client.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.produce(record).await {
                        error!(error = %e, "Dead letter dispatch failed");
                        metrics::counter!(ERRORS_OCCURRED, "type" => "strategy.dlq_dispatch.error")
                            .increment(1);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DlqConfig;
    use crate::coordinator::Coordinator;
    use crate::dlq::ORIGINAL_OFFSET_HEADER;
    use crate::filter::Filter;
    use crate::pause_tracker::PauseConfig;
    use crate::test_support::{noop_consumer_factory, test_message, MockClient};
    use crate::types::Partition;
    use std::time::Duration;

    fn partition() -> Partition {
        Partition::new("events".to_string(), 0)
    }

    fn coordinator_for(topic: &TopicConfig) -> Arc<Coordinator> {
        let filter = topic.filtering.as_ref().map(|factory| factory());
        Arc::new(Coordinator::new(partition(), PauseConfig::default(), filter))
    }

    fn strategy(topic: TopicConfig, client: &Arc<MockClient>) -> Strategy {
        Strategy::new(Arc::new(topic), client.clone() as Arc<dyn Client>)
    }

    fn plain_topic() -> TopicConfig {
        TopicConfig::new("events", "group-a", noop_consumer_factory())
    }

    fn dlq_topic(max_retries: u32) -> TopicConfig {
        let dlq = DlqConfig::new(Some("events-dlq".to_string()), max_retries, "produce_sync")
            .unwrap();
        plain_topic().with_dead_letter_queue(dlq)
    }

    async fn run_batch(
        strategy: &Strategy,
        coordinator: &Arc<Coordinator>,
        batch: &[OwnedMessage],
        success: bool,
    ) {
        coordinator.start(batch);
        coordinator.increment();
        assert!(coordinator.decrement(success));
        strategy
            .handle_after_consume(coordinator, coordinator.last_message())
            .await;
    }

    #[tokio::test]
    async fn test_success_marks_past_the_last_message() {
        let client = Arc::new(MockClient::new());
        let strategy = strategy(plain_topic(), &client);
        let coordinator = coordinator_for(&plain_topic());

        let batch = vec![
            test_message("events", 0, 10, "a"),
            test_message("events", 0, 11, "b"),
            test_message("events", 0, 12, "c"),
        ];
        run_batch(&strategy, &coordinator, &batch, true).await;

        assert_eq!(client.last_marked(&partition()), Some(13));
        assert_eq!(coordinator.pause_attempt(), 0);
    }

    #[tokio::test]
    async fn test_revoked_partition_has_no_side_effects() {
        let client = Arc::new(MockClient::new());
        let strategy = strategy(plain_topic(), &client);
        let coordinator = coordinator_for(&plain_topic());

        coordinator.revoke();
        run_batch(&strategy, &coordinator, &[test_message("events", 0, 1, "a")], true).await;

        assert_eq!(client.last_marked(&partition()), None);
        assert!(client.paused_partitions().is_empty());
    }

    #[tokio::test]
    async fn test_mom_without_mark_commits_nothing() {
        let client = Arc::new(MockClient::new());
        let topic = plain_topic().with_manual_offset_management();
        let strategy = strategy(topic.clone(), &client);
        let coordinator = coordinator_for(&topic);

        run_batch(&strategy, &coordinator, &[test_message("events", 0, 5, "a")], true).await;

        assert_eq!(client.last_marked(&partition()), None);
    }

    #[tokio::test]
    async fn test_mom_commits_the_marked_offset() {
        let client = Arc::new(MockClient::new());
        let topic = plain_topic().with_manual_offset_management();
        let strategy = strategy(topic.clone(), &client);
        let coordinator = coordinator_for(&topic);

        let batch = vec![
            test_message("events", 0, 5, "a"),
            test_message("events", 0, 6, "b"),
        ];
        coordinator.start(&batch);
        coordinator.increment();
        coordinator.mark(6);
        assert!(coordinator.decrement(true));
        strategy
            .handle_after_consume(&coordinator, coordinator.last_message())
            .await;

        assert_eq!(client.last_marked(&partition()), Some(6));
    }

    #[tokio::test]
    async fn test_manual_pause_skips_marking() {
        let client = Arc::new(MockClient::new());
        let strategy = strategy(plain_topic(), &client);
        let coordinator = coordinator_for(&plain_topic());

        let batch = vec![test_message("events", 0, 5, "a")];
        coordinator.start(&batch);
        coordinator.increment();
        coordinator.pause_manual();
        assert!(coordinator.decrement(true));
        strategy
            .handle_after_consume(&coordinator, coordinator.last_message())
            .await;

        assert_eq!(client.last_marked(&partition()), None);
    }

    #[tokio::test]
    async fn test_failure_pauses_and_seeks_back() {
        let client = Arc::new(MockClient::new());
        let strategy = strategy(dlq_topic(2), &client);
        let coordinator = coordinator_for(&dlq_topic(2));

        let batch = vec![test_message("events", 0, 10, "a")];
        run_batch(&strategy, &coordinator, &batch, false).await;

        assert_eq!(coordinator.pause_attempt(), 1);
        assert_eq!(client.paused_partitions(), vec![partition()]);
        assert_eq!(client.last_seek(&partition()), Some(10));
        assert_eq!(client.last_marked(&partition()), None);
        assert!(client.produced().is_empty());
    }

    #[tokio::test]
    async fn test_retries_exhausted_dispatches_and_commits() {
        let client = Arc::new(MockClient::new());
        let strategy = strategy(dlq_topic(2), &client);
        let coordinator = coordinator_for(&dlq_topic(2));

        let batch = vec![test_message("events", 0, 10, "a")];
        // Attempts 1 and 2 pause, attempt 3 dead-letters.
        run_batch(&strategy, &coordinator, &batch, false).await;
        run_batch(&strategy, &coordinator, &batch, false).await;
        assert!(client.produced().is_empty());

        run_batch(&strategy, &coordinator, &batch, false).await;

        let produced = client.produced();
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].topic, "events-dlq");
        assert_eq!(produced[0].header(ORIGINAL_OFFSET_HEADER), Some(b"10".as_ref()));

        assert_eq!(client.last_marked(&partition()), Some(11));
        assert_eq!(client.last_seek(&partition()), Some(11));
        // The nominal pause expires immediately.
        assert!(coordinator.pause_expired(std::time::Instant::now()));
        assert_eq!(coordinator.pause_attempt(), 0);
    }

    #[tokio::test]
    async fn test_bounded_retries_without_dlq_topic_skip_silently() {
        let client = Arc::new(MockClient::new());
        let dlq = DlqConfig::new(None, 1, "produce_sync").unwrap();
        let topic = plain_topic().with_dead_letter_queue(dlq);
        let strategy = strategy(topic.clone(), &client);
        let coordinator = coordinator_for(&topic);

        let batch = vec![test_message("events", 0, 7, "a")];
        run_batch(&strategy, &coordinator, &batch, false).await;
        run_batch(&strategy, &coordinator, &batch, false).await;

        assert!(client.produced().is_empty());
        assert_eq!(client.last_marked(&partition()), Some(8));
    }

    #[tokio::test]
    async fn test_dispatch_predicate_can_veto() {
        let client = Arc::new(MockClient::new());
        let mut dlq = DlqConfig::new(Some("events-dlq".to_string()), 0, "produce_sync").unwrap();
        dlq.dispatch_predicate = Some(Arc::new(|_| false));
        let topic = plain_topic().with_dead_letter_queue(dlq);
        let strategy = strategy(topic.clone(), &client);
        let coordinator = coordinator_for(&topic);

        run_batch(&strategy, &coordinator, &[test_message("events", 0, 3, "a")], false).await;

        assert!(client.produced().is_empty());
        assert_eq!(client.last_marked(&partition()), Some(4));
    }

    struct TailFilter {
        keep: usize,
        removed: Option<OwnedMessage>,
    }

    impl Filter for TailFilter {
        fn apply(&mut self, messages: &mut Vec<OwnedMessage>) {
            if messages.len() > self.keep {
                self.removed = Some(messages[self.keep].clone());
                messages.truncate(self.keep);
            }
        }

        fn applied(&self) -> bool {
            self.removed.is_some()
        }

        fn cursor(&self) -> Option<&OwnedMessage> {
            self.removed.as_ref()
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(5))
        }
    }

    #[tokio::test]
    async fn test_post_filtering_seeks_back_and_pauses() {
        let client = Arc::new(MockClient::new());
        let topic = plain_topic().with_filtering(Arc::new(|| {
            Box::new(TailFilter {
                keep: 2,
                removed: None,
            }) as Box<dyn Filter>
        }));
        let strategy = strategy(topic.clone(), &client);
        let coordinator = coordinator_for(&topic);

        let mut batch = vec![
            test_message("events", 0, 10, "a"),
            test_message("events", 0, 11, "b"),
            test_message("events", 0, 12, "c"),
        ];
        coordinator.filter_apply(&mut batch);
        assert_eq!(batch.len(), 2);

        run_batch(&strategy, &coordinator, &batch, true).await;

        // Committed up to the consumed tail, then rewound to the cursor.
        assert_eq!(client.last_marked(&partition()), Some(12));
        assert_eq!(client.last_seek(&partition()), Some(12));
        assert_eq!(client.paused_partitions(), vec![partition()]);
        assert!(coordinator.paused());
    }
}
