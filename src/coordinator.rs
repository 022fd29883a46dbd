use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tracing::warn;

use crate::config::TopicConfig;
use crate::filter::Filter;
use crate::pause_tracker::{PauseConfig, PauseTracker};
use crate::types::Partition;

/// Continuation invoked by the worker that drains the coordinator to zero.
/// Installed once, before the first increment of the first batch.
#[async_trait]
pub trait FinishedCallback: Send + Sync {
    async fn on_finished(&self, coordinator: &Arc<Coordinator>, last_message: Option<OwnedMessage>);
}

/// Per-partition batch completion state.
///
/// `start` opens a cycle, one `increment` per scheduled consume job, one
/// `decrement` per finished job. The decrement that reaches zero wins the
/// one-shot finished gate and runs the installed callbacks with the
/// aggregate success value; the counter's Acquire/Release ordering makes
/// every worker's writes visible to the callback.
pub struct Coordinator {
    partition: Partition,
    outstanding: AtomicUsize,
    success: AtomicBool,
    finished_fired: AtomicBool,
    revoked: AtomicBool,
    /// Next offset to fetch after a seek-back; starts at the batch's first
    /// offset and follows the user's marks.
    seek_offset: AtomicI64,
    /// Offset recorded by `mark_as_consumed`; negative while unmarked.
    marked_offset: AtomicI64,
    pause: Mutex<PauseTracker>,
    filter: Option<Mutex<Box<dyn Filter>>>,
    batch: Mutex<Arc<Vec<OwnedMessage>>>,
    last_message: Mutex<Option<OwnedMessage>>,
    callbacks: Mutex<Vec<Arc<dyn FinishedCallback>>>,
}

impl Coordinator {
    pub fn new(
        partition: Partition,
        pause_config: PauseConfig,
        filter: Option<Box<dyn Filter>>,
    ) -> Self {
        Self {
            partition,
            outstanding: AtomicUsize::new(0),
            success: AtomicBool::new(true),
            finished_fired: AtomicBool::new(true),
            revoked: AtomicBool::new(false),
            seek_offset: AtomicI64::new(-1),
            marked_offset: AtomicI64::new(-1),
            pause: Mutex::new(PauseTracker::new(pause_config)),
            filter: filter.map(Mutex::new),
            batch: Mutex::new(Arc::new(Vec::new())),
            last_message: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Install a finished continuation. Must happen before the first
    /// increment; the list persists across cycles.
    pub fn install(&self, callback: Arc<dyn FinishedCallback>) {
        self.callbacks.lock().unwrap().push(callback);
    }

    pub fn callbacks(&self) -> Vec<Arc<dyn FinishedCallback>> {
        self.callbacks.lock().unwrap().clone()
    }

    /// Open a new cycle for `messages`. Resets the aggregate, arms the
    /// finished gate and records the batch for seek-back and skip lookups.
    pub fn start(&self, messages: &[OwnedMessage]) {
        self.success.store(true, Ordering::Release);
        self.outstanding.store(0, Ordering::Release);
        self.finished_fired.store(false, Ordering::Release);
        self.marked_offset.store(-1, Ordering::Release);

        if let Some(first) = messages.first() {
            self.seek_offset.store(first.offset(), Ordering::Release);
        }

        let last = messages
            .iter()
            .max_by_key(|m| m.offset())
            .cloned();
        *self.last_message.lock().unwrap() = last;
        *self.batch.lock().unwrap() = Arc::new(messages.to_vec());
    }

    /// Count one scheduled job. Called from the listener before the job is
    /// pushed to the queue.
    pub fn increment(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Count one finished job. Returns true exactly once per cycle, for the
    /// caller that drained the counter to zero.
    pub fn decrement(&self, success: bool) -> bool {
        if !success {
            self.success.store(false, Ordering::Release);
        }

        let previous = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));

        match previous {
            Ok(1) => self
                .finished_fired
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            Ok(_) => false,
            Err(_) => {
                warn!(
                    partition = %self.partition,
                    "Coordinator decremented below zero"
                );
                false
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Aggregate result of the cycle: AND of all job results.
    pub fn success(&self) -> bool {
        self.success.load(Ordering::Acquire)
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    pub fn revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Record a user mark: `offset` is the next offset to consume. Marks
    /// only move forward; virtual partition jobs mark out of broker order
    /// and the batch-end commit takes the highest mark.
    pub fn mark(&self, offset: i64) {
        self.marked_offset.fetch_max(offset, Ordering::AcqRel);
        self.seek_offset.fetch_max(offset, Ordering::AcqRel);
    }

    pub fn marked_offset(&self) -> Option<i64> {
        let offset = self.marked_offset.load(Ordering::Acquire);
        (offset >= 0).then_some(offset)
    }

    pub fn seek_offset(&self) -> i64 {
        self.seek_offset.load(Ordering::Acquire)
    }

    pub fn last_message(&self) -> Option<OwnedMessage> {
        self.last_message.lock().unwrap().clone()
    }

    /// The message the current cycle would re-fetch first: the one at the
    /// seek offset, falling back to the batch head.
    pub fn skippable_message(&self) -> Option<OwnedMessage> {
        let seek_offset = self.seek_offset();
        let batch = self.batch.lock().unwrap();
        batch
            .iter()
            .find(|m| m.offset() == seek_offset)
            .or_else(|| batch.first())
            .cloned()
    }

    // Pause surface, delegated to the tracker.

    pub fn pause_attempt(&self) -> u32 {
        self.pause.lock().unwrap().attempt()
    }

    pub fn backoff(&self) -> std::time::Duration {
        self.pause.lock().unwrap().backoff()
    }

    pub fn pause_for(&self, timeout: std::time::Duration) {
        self.pause.lock().unwrap().pause_for(timeout);
    }

    pub fn pause_nominal(&self) {
        self.pause.lock().unwrap().pause_nominal();
    }

    pub fn pause_manual(&self) {
        self.pause.lock().unwrap().pause_manual();
    }

    pub fn manual_pause(&self) -> bool {
        self.pause.lock().unwrap().manual()
    }

    pub fn paused(&self) -> bool {
        self.pause.lock().unwrap().paused()
    }

    pub fn pause_expired(&self, now: Instant) -> bool {
        self.pause.lock().unwrap().expired(now)
    }

    pub fn resume_pause(&self) {
        self.pause.lock().unwrap().resume();
    }

    pub fn reset_pause(&self) {
        self.pause.lock().unwrap().reset();
    }

    /// Run the partition's filter over the batch, if one is configured.
    pub fn filter_apply(&self, messages: &mut Vec<OwnedMessage>) {
        if let Some(filter) = &self.filter {
            filter.lock().unwrap().apply(messages);
        }
    }

    /// Seek-back instruction from the filter after a successful cycle.
    pub fn post_filtering_action(&self) -> Option<FilterAction> {
        let filter = self.filter.as_ref()?;
        let filter = filter.lock().unwrap();
        if !filter.applied() {
            return None;
        }
        let cursor = filter.cursor()?;
        Some(FilterAction {
            cursor_offset: cursor.offset(),
            timeout: filter.timeout(),
        })
    }
}

/// What the strategy should do about messages the filter removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterAction {
    pub cursor_offset: i64,
    pub timeout: Option<std::time::Duration>,
}

/// Lookup of per-partition coordinators for one subscription group. Reset
/// wholesale on rebalance or listener restart.
pub struct CoordinatorsBuffer {
    coordinators: DashMap<Partition, Arc<Coordinator>>,
    pause_config: PauseConfig,
}

impl CoordinatorsBuffer {
    pub fn new(pause_config: PauseConfig) -> Self {
        Self {
            coordinators: DashMap::new(),
            pause_config,
        }
    }

    /// Find the partition's coordinator or create one configured for the
    /// topic: its own filter instance and the installed finished callback.
    pub fn find_or_create(
        &self,
        partition: &Partition,
        topic: &TopicConfig,
        callback: Arc<dyn FinishedCallback>,
    ) -> Arc<Coordinator> {
        self.coordinators
            .entry(partition.clone())
            .or_insert_with(|| {
                let filter = topic.filtering.as_ref().map(|factory| factory());
                let coordinator = Arc::new(Coordinator::new(
                    partition.clone(),
                    self.pause_config.clone(),
                    filter,
                ));
                coordinator.install(callback);
                coordinator
            })
            .clone()
    }

    /// Mark the partition's coordinator revoked and drop it from the buffer
    /// so a re-assignment starts fresh. Returns the revoked coordinator,
    /// which stays alive while outstanding jobs reference it.
    pub fn revoke(&self, partition: &Partition) -> Option<Arc<Coordinator>> {
        self.coordinators.remove(partition).map(|(_, coordinator)| {
            coordinator.revoke();
            coordinator
        })
    }

    pub fn each<F: FnMut(&Arc<Coordinator>)>(&self, mut f: F) {
        for entry in self.coordinators.iter() {
            f(entry.value());
        }
    }

    /// Drop every coordinator. Orphaned callbacks die with their cycles.
    pub fn reset(&self) {
        self.coordinators.clear();
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }
}
