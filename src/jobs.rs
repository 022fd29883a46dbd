use std::sync::Arc;
use std::time::Instant;

use rdkafka::message::OwnedMessage;

use crate::client::Client;
use crate::consumer::JobContext;
use crate::coordinator::Coordinator;
use crate::executor::Executor;
use crate::metrics_consts::JOBS_SCHEDULED;
use crate::types::SubscriptionGroupId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Consume,
    Idle,
    Revoked,
    Shutdown,
    Periodic,
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::Consume => "consume",
            JobKind::Idle => "idle",
            JobKind::Revoked => "revoked",
            JobKind::Shutdown => "shutdown",
            JobKind::Periodic => "periodic",
        }
    }
}

/// One schedulable unit of work: an executor, the job kind and (for consume
/// jobs) the virtual-group slice of the batch.
pub struct Job {
    kind: JobKind,
    group: SubscriptionGroupId,
    executor: Arc<Executor>,
    ctx: JobContext,
    messages: Arc<Vec<OwnedMessage>>,
    scheduled_at: Option<Instant>,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn group(&self) -> &SubscriptionGroupId {
        &self.group
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn ctx(&self) -> &JobContext {
        &self.ctx
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        self.ctx.coordinator()
    }

    pub fn messages(&self) -> &[OwnedMessage] {
        &self.messages
    }

    /// Revocation and shutdown jobs go through the urgent lane so they are
    /// never starved behind consumption of the same partition.
    pub fn urgent(&self) -> bool {
        matches!(self.kind, JobKind::Revoked | JobKind::Shutdown)
    }

    /// Hook invoked by the scheduler right before the job is enqueued.
    pub fn before_schedule(&mut self) {
        self.scheduled_at = Some(Instant::now());
        metrics::counter!(JOBS_SCHEDULED, "kind" => self.kind.label()).increment(1);
    }

    pub fn scheduled_at(&self) -> Option<Instant> {
        self.scheduled_at
    }
}

/// Constructs typed jobs for one subscription group, wiring each with a
/// callback context bound to the job's partition.
pub struct JobsBuilder {
    group: SubscriptionGroupId,
    client: Arc<dyn Client>,
}

impl JobsBuilder {
    pub fn new(group: SubscriptionGroupId, client: Arc<dyn Client>) -> Self {
        Self { group, client }
    }

    fn build(
        &self,
        kind: JobKind,
        executor: Arc<Executor>,
        coordinator: Arc<Coordinator>,
        messages: Arc<Vec<OwnedMessage>>,
    ) -> Job {
        let ctx = JobContext::new(
            self.client.clone(),
            coordinator,
            executor.partition().clone(),
        );
        Job {
            kind,
            group: self.group.clone(),
            executor,
            ctx,
            messages,
            scheduled_at: None,
        }
    }

    pub fn consume(
        &self,
        executor: Arc<Executor>,
        coordinator: Arc<Coordinator>,
        messages: Arc<Vec<OwnedMessage>>,
    ) -> Job {
        self.build(JobKind::Consume, executor, coordinator, messages)
    }

    pub fn idle(&self, executor: Arc<Executor>, coordinator: Arc<Coordinator>) -> Job {
        self.build(JobKind::Idle, executor, coordinator, Arc::new(Vec::new()))
    }

    pub fn revoked(&self, executor: Arc<Executor>, coordinator: Arc<Coordinator>) -> Job {
        self.build(JobKind::Revoked, executor, coordinator, Arc::new(Vec::new()))
    }

    pub fn shutdown(&self, executor: Arc<Executor>, coordinator: Arc<Coordinator>) -> Job {
        self.build(JobKind::Shutdown, executor, coordinator, Arc::new(Vec::new()))
    }

    pub fn periodic(&self, executor: Arc<Executor>, coordinator: Arc<Coordinator>) -> Job {
        self.build(JobKind::Periodic, executor, coordinator, Arc::new(Vec::new()))
    }
}
