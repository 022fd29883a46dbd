//! Shared fixtures for unit and scenario tests: message constructors, no-op
//! consumers and a fully in-process scripted `Client`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rdkafka::message::{OwnedMessage, Timestamp};

use crate::client::{Client, TimeOffsetQuery, TimeOffsetResult};
use crate::consumer::{Consumer, ConsumerFactory, JobContext};
use crate::coordinator::Coordinator;
use crate::dlq::DlqRecord;
use crate::executor::Executor;
use crate::jobs::{Job, JobKind, JobsBuilder};
use crate::pause_tracker::PauseConfig;
use crate::types::Partition;

pub fn test_message(topic: &str, partition: i32, offset: i64, payload: &str) -> OwnedMessage {
    test_message_with_key(topic, partition, offset, payload, Some("test-key"))
}

pub fn test_message_with_key(
    topic: &str,
    partition: i32,
    offset: i64,
    payload: &str,
    key: Option<&str>,
) -> OwnedMessage {
    OwnedMessage::new(
        Some(payload.as_bytes().to_vec()),
        key.map(|k| k.as_bytes().to_vec()),
        topic.to_string(),
        Timestamp::now(),
        partition,
        offset,
        None,
    )
}

struct NoopConsumer;

#[async_trait]
impl Consumer for NoopConsumer {
    async fn consume(&mut self, _messages: &[OwnedMessage], _ctx: &JobContext) -> Result<()> {
        Ok(())
    }
}

pub fn noop_consumer_factory() -> ConsumerFactory {
    Arc::new(|| Box::new(NoopConsumer) as Box<dyn Consumer>)
}

/// Shared counters observing consumer creation across an executors buffer.
#[derive(Clone, Default)]
pub struct ConsumerCalls {
    created: Arc<AtomicUsize>,
}

impl ConsumerCalls {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

pub fn counting_consumer_factory(calls: &ConsumerCalls) -> ConsumerFactory {
    let created = calls.created.clone();
    Arc::new(move || {
        created.fetch_add(1, Ordering::SeqCst);
        Box::new(NoopConsumer) as Box<dyn Consumer>
    })
}

/// Build a throwaway job of the given kind for queue and scheduler tests.
pub fn test_job(group: &str, kind: JobKind) -> Job {
    let client: Arc<dyn Client> = Arc::new(MockClient::new());
    let builder = JobsBuilder::new(group.to_string(), client);
    let partition = Partition::new("test-topic".to_string(), 0);
    let factory = noop_consumer_factory();
    let executor = Arc::new(Executor::new(partition.clone(), 0, factory()));
    let coordinator = Arc::new(Coordinator::new(partition, PauseConfig::default(), None));

    match kind {
        JobKind::Consume => builder.consume(executor, coordinator, Arc::new(Vec::new())),
        JobKind::Idle => builder.idle(executor, coordinator),
        JobKind::Revoked => builder.revoked(executor, coordinator),
        JobKind::Shutdown => builder.shutdown(executor, coordinator),
        JobKind::Periodic => builder.periodic(executor, coordinator),
    }
}

/// Operations recorded by the mock client, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    Pause(Partition),
    Resume(Partition),
    Seek(Partition, i64),
    Mark(Partition, i64),
    Commit,
}

/// Fully in-process `Client`: batches are scripted, every control operation
/// is recorded for assertions. `batch_poll` sleeps briefly when the script
/// is exhausted so listener loops do not spin hot in tests.
pub struct MockClient {
    batches: Mutex<VecDeque<Vec<OwnedMessage>>>,
    revoked: Mutex<Vec<Partition>>,
    assignment: Mutex<Vec<Partition>>,
    watermarks: Mutex<HashMap<(String, i32), (i64, i64)>>,
    time_offsets: Mutex<HashMap<(String, i32), Option<i64>>>,
    ops: Mutex<Vec<ClientOp>>,
    produced: Mutex<Vec<DlqRecord>>,
    stopped: AtomicBool,
    resets: AtomicUsize,
    pings: AtomicUsize,
    polls: AtomicUsize,
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClient {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
            revoked: Mutex::new(Vec::new()),
            assignment: Mutex::new(Vec::new()),
            watermarks: Mutex::new(HashMap::new()),
            time_offsets: Mutex::new(HashMap::new()),
            ops: Mutex::new(Vec::new()),
            produced: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            resets: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }

    // Scripting surface.

    pub fn push_batch(&self, messages: Vec<OwnedMessage>) {
        self.batches.lock().unwrap().push_back(messages);
    }

    pub fn push_revoked(&self, partition: Partition) {
        self.revoked.lock().unwrap().push(partition);
    }

    pub fn set_assignment(&self, partitions: Vec<Partition>) {
        *self.assignment.lock().unwrap() = partitions;
    }

    pub fn set_watermarks(&self, topic: &str, partition: i32, low: i64, high: i64) {
        self.watermarks
            .lock()
            .unwrap()
            .insert((topic.to_string(), partition), (low, high));
    }

    pub fn set_time_offset(&self, topic: &str, partition: i32, offset: Option<i64>) {
        self.time_offsets
            .lock()
            .unwrap()
            .insert((topic.to_string(), partition), offset);
    }

    // Assertion surface.

    pub fn ops(&self) -> Vec<ClientOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn last_marked(&self, partition: &Partition) -> Option<i64> {
        self.ops()
            .iter()
            .rev()
            .find_map(|op| match op {
                ClientOp::Mark(p, offset) if p == partition => Some(*offset),
                _ => None,
            })
    }

    pub fn marked(&self, partition: &Partition) -> Vec<i64> {
        self.ops()
            .iter()
            .filter_map(|op| match op {
                ClientOp::Mark(p, offset) if p == partition => Some(*offset),
                _ => None,
            })
            .collect()
    }

    pub fn last_seek(&self, partition: &Partition) -> Option<i64> {
        self.ops()
            .iter()
            .rev()
            .find_map(|op| match op {
                ClientOp::Seek(p, offset) if p == partition => Some(*offset),
                _ => None,
            })
    }

    pub fn paused_partitions(&self) -> Vec<Partition> {
        self.ops()
            .iter()
            .filter_map(|op| match op {
                ClientOp::Pause(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn resumed_partitions(&self) -> Vec<Partition> {
        self.ops()
            .iter()
            .filter_map(|op| match op {
                ClientOp::Resume(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn produced(&self) -> Vec<DlqRecord> {
        self.produced.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    fn record(&self, op: ClientOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl Client for MockClient {
    async fn batch_poll(&self) -> Result<Vec<OwnedMessage>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = self.batches.lock().unwrap().pop_front();
        match next {
            Some(messages) => Ok(messages),
            None => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn events_poll(&self, _timeout: Duration) {}

    async fn ping(&self) {
        self.pings.fetch_add(1, Ordering::SeqCst);
    }

    fn pause(&self, partition: &Partition) -> Result<()> {
        self.record(ClientOp::Pause(partition.clone()));
        Ok(())
    }

    fn resume(&self, partition: &Partition) -> Result<()> {
        self.record(ClientOp::Resume(partition.clone()));
        Ok(())
    }

    fn seek(&self, partition: &Partition, offset: i64) -> Result<()> {
        self.record(ClientOp::Seek(partition.clone(), offset));
        Ok(())
    }

    fn mark_as_consumed(&self, partition: &Partition, offset: i64) -> Result<()> {
        self.record(ClientOp::Mark(partition.clone(), offset));
        Ok(())
    }

    fn commit_offsets(&self) -> Result<()> {
        self.record(ClientOp::Commit);
        Ok(())
    }

    async fn produce(&self, record: DlqRecord) -> Result<()> {
        self.produced.lock().unwrap().push(record);
        Ok(())
    }

    fn revoked_partitions(&self) -> Vec<Partition> {
        std::mem::take(&mut *self.revoked.lock().unwrap())
    }

    fn assignment(&self) -> Vec<Partition> {
        self.assignment.lock().unwrap().clone()
    }

    fn query_watermark_offsets(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        self.watermarks
            .lock()
            .unwrap()
            .get(&(topic.to_string(), partition))
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no watermarks scripted for {topic}-{partition}"))
    }

    fn offsets_for_times(
        &self,
        queries: Vec<TimeOffsetQuery>,
        _timeout: Duration,
    ) -> Result<Vec<TimeOffsetResult>> {
        let time_offsets = self.time_offsets.lock().unwrap();
        Ok(queries
            .into_iter()
            .map(|query| {
                let offset = time_offsets
                    .get(&(query.topic.clone(), query.partition))
                    .copied()
                    .flatten();
                TimeOffsetResult {
                    topic: query.topic,
                    partition: query.partition,
                    offset,
                }
            })
            .collect())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}
