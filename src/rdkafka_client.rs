//! Production `Client` glue over rdkafka: a `BaseConsumer` whose context
//! captures rebalance events behind a lock, plus a `FutureProducer` for
//! dead-letter dispatch.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::message::{Header, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::client::{Client, TimeOffsetQuery, TimeOffsetResult};
use crate::config::RuntimeConfig;
use crate::dlq::DlqRecord;
use crate::types::Partition;

const METADATA_TIMEOUT: Duration = Duration::from_secs(2);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RebalanceState {
    revoked: Vec<Partition>,
    assignment: Vec<Partition>,
}

/// Consumer context recording revocations and the current assignment. The
/// callbacks run on librdkafka's threads; the state sits behind a lock and
/// is drained from the listener thread.
struct RebalanceCaptureContext {
    state: Arc<Mutex<RebalanceState>>,
}

impl ClientContext for RebalanceCaptureContext {}

impl ConsumerContext for RebalanceCaptureContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!("Revoking {} partitions", partitions.count());
                let mut state = self.state.lock().unwrap();
                for elem in partitions.elements() {
                    let partition = Partition::from(elem);
                    state.assignment.retain(|p| p != &partition);
                    state.revoked.push(partition);
                }
            }
            Rebalance::Assign(partitions) => {
                debug!("Pre-rebalance assign for {} partitions", partitions.count());
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            info!("Assigned {} partitions", partitions.count());
            let mut state = self.state.lock().unwrap();
            for elem in partitions.elements() {
                let partition = Partition::from(elem);
                if !state.assignment.contains(&partition) {
                    state.assignment.push(partition);
                }
            }
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(_) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("Failed to commit offsets: {}", e),
        }
    }
}

pub struct RdKafkaClient {
    consumer: BaseConsumer<RebalanceCaptureContext>,
    producer: FutureProducer,
    state: Arc<Mutex<RebalanceState>>,
    topics: Vec<String>,
    max_messages: usize,
    max_wait_time: Duration,
}

impl RdKafkaClient {
    pub fn new(config: &RuntimeConfig, topics: Vec<String>) -> Result<Self> {
        let state = Arc::new(Mutex::new(RebalanceState::default()));
        let context = RebalanceCaptureContext {
            state: state.clone(),
        };

        let consumer: BaseConsumer<RebalanceCaptureContext> = Self::consumer_config(config)
            .create_with_context(context)
            .context("Failed to create Kafka consumer")?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .with_context(|| format!("Failed to subscribe to topics: {topics:?}"))?;

        let producer: FutureProducer = Self::producer_config(config)
            .create()
            .context("Failed to create Kafka producer")?;

        Ok(Self {
            consumer,
            producer,
            state,
            topics,
            max_messages: config.max_messages,
            max_wait_time: config.max_wait_time(),
        })
    }

    fn consumer_config(config: &RuntimeConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            // Offsets are stored explicitly from the post-consume path.
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true")
            .set("partition.assignment.strategy", "cooperative-sticky");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        client_config
    }

    fn producer_config(config: &RuntimeConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &config.kafka_hosts);

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        client_config
    }

    fn single_partition_list(partition: &Partition) -> TopicPartitionList {
        let mut list = TopicPartitionList::new();
        list.add_partition(partition.topic(), partition.partition_number());
        list
    }
}

#[async_trait]
impl Client for RdKafkaClient {
    async fn batch_poll(&self) -> Result<Vec<OwnedMessage>> {
        // BaseConsumer::poll blocks, so the whole collection loop runs under
        // block_in_place to keep the runtime workers free.
        tokio::task::block_in_place(|| {
            let deadline = Instant::now() + self.max_wait_time;
            let mut messages = Vec::new();

            while messages.len() < self.max_messages {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match self.consumer.poll(remaining) {
                    Some(Ok(message)) => messages.push(message.detach()),
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                }
            }

            Ok(messages)
        })
    }

    async fn events_poll(&self, timeout: Duration) {
        // librdkafka services its callback queues on background threads;
        // this only has to honor the caller's tick cadence.
        if timeout.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(timeout).await;
        }
    }

    async fn ping(&self) {
        let result = tokio::task::block_in_place(|| {
            self.consumer.fetch_metadata(None, METADATA_TIMEOUT)
        });
        if let Err(e) = result {
            warn!(error = %e, "Broker ping failed");
        }
    }

    fn pause(&self, partition: &Partition) -> Result<()> {
        self.consumer
            .pause(&Self::single_partition_list(partition))
            .with_context(|| format!("Failed to pause {partition}"))
    }

    fn resume(&self, partition: &Partition) -> Result<()> {
        self.consumer
            .resume(&Self::single_partition_list(partition))
            .with_context(|| format!("Failed to resume {partition}"))
    }

    fn seek(&self, partition: &Partition, offset: i64) -> Result<()> {
        self.consumer
            .seek(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(offset),
                SEEK_TIMEOUT,
            )
            .with_context(|| format!("Failed to seek {partition} to {offset}"))
    }

    fn mark_as_consumed(&self, partition: &Partition, offset: i64) -> Result<()> {
        // `offset` is the next offset to consume; the store expects the
        // offset of the last processed message.
        if offset <= 0 {
            return Ok(());
        }
        self.consumer
            .store_offset(partition.topic(), partition.partition_number(), offset - 1)
            .with_context(|| format!("Failed to store offset {offset} for {partition}"))
    }

    fn commit_offsets(&self) -> Result<()> {
        self.consumer
            .commit_consumer_state(CommitMode::Async)
            .context("Failed to commit consumer state")
    }

    async fn produce(&self, record: DlqRecord) -> Result<()> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key,
                value: value.as_ref(),
            });
        }

        let mut future_record = FutureRecord::<Vec<u8>, Vec<u8>>::to(&record.topic);
        if let Some(key) = &record.key {
            future_record = future_record.key(key);
        }
        if let Some(payload) = &record.payload {
            future_record = future_record.payload(payload);
        }
        future_record = future_record.headers(headers);

        match self.producer.send(future_record, SEND_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err((e, _)) => Err(e).with_context(|| format!("Failed to produce to {}", record.topic)),
        }
    }

    fn revoked_partitions(&self) -> Vec<Partition> {
        std::mem::take(&mut self.state.lock().unwrap().revoked)
    }

    fn assignment(&self) -> Vec<Partition> {
        self.state.lock().unwrap().assignment.clone()
    }

    fn query_watermark_offsets(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        tokio::task::block_in_place(|| {
            self.consumer
                .fetch_watermarks(topic, partition, METADATA_TIMEOUT)
                .with_context(|| format!("Failed to fetch watermarks for {topic}-{partition}"))
        })
    }

    fn offsets_for_times(
        &self,
        queries: Vec<TimeOffsetQuery>,
        timeout: Duration,
    ) -> Result<Vec<TimeOffsetResult>> {
        let mut request = TopicPartitionList::new();
        for query in &queries {
            request.add_partition_offset(
                &query.topic,
                query.partition,
                Offset::Offset(query.timestamp_ms),
            )?;
        }

        let response = tokio::task::block_in_place(|| {
            self.consumer
                .offsets_for_times(request, timeout)
                .context("Time-based offset lookup failed")
        })?;

        Ok(response
            .elements()
            .into_iter()
            .map(|elem| TimeOffsetResult {
                topic: elem.topic().to_string(),
                partition: elem.partition(),
                offset: match elem.offset() {
                    Offset::Offset(offset) => Some(offset),
                    _ => None,
                },
            })
            .collect())
    }

    async fn stop(&self) {
        self.consumer.unsubscribe();
        let result = tokio::task::block_in_place(|| self.producer.flush(FLUSH_TIMEOUT));
        if let Err(e) = result {
            warn!(error = %e, "Producer flush on stop failed");
        }
    }

    fn reset(&self) {
        self.consumer.unsubscribe();
        {
            let mut state = self.state.lock().unwrap();
            state.revoked.clear();
            state.assignment.clear();
        }
        let topic_refs: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        if let Err(e) = self.consumer.subscribe(&topic_refs) {
            error!(error = %e, "Re-subscribe after reset failed");
        }
    }
}
