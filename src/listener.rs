use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::config::{RuntimeConfig, TopicConfig};
use crate::coordinator::CoordinatorsBuffer;
use crate::error::RuntimeError;
use crate::executor::ExecutorsBuffer;
use crate::jobs::{Job, JobsBuilder};
use crate::jobs_queue::JobsQueue;
use crate::messages_buffer::MessagesBuffer;
use crate::metrics_consts::{BATCHES_POLLED, ERRORS_OCCURRED, LISTENER_RESTARTS};
use crate::partitioner::Partitioner;
use crate::scheduler::Scheduler;
use crate::status::{RunState, Status};
use crate::strategy::Strategy;
use crate::types::SubscriptionGroupId;
use crate::usage_tracker::UsageTracker;

const RESTART_BACKOFF: Duration = Duration::from_secs(1);
const BOOT_EVENTS_POLL: Duration = Duration::from_millis(100);

struct TopicRuntime {
    config: Arc<TopicConfig>,
    strategy: Arc<Strategy>,
}

/// Drives the fetch loop of one subscription group.
///
/// The listener owns the client handle, the buffers and the trackers; it is
/// the only task that polls, resumes pauses and builds jobs. Workers touch
/// the client only through the post-consume path installed on coordinators.
///
/// Phase machine: `Booting → Running → Quieting → Quiet → Stopping →
/// Stopped`, driven by the shared `Status` cell. Any error inside a running
/// iteration triggers a full restart: queued jobs dropped, in-flight jobs
/// drained, client reset, coordinators and executors recreated.
pub struct Listener {
    group_id: SubscriptionGroupId,
    topics: HashMap<String, TopicRuntime>,
    client: Arc<dyn Client>,
    queue: Arc<JobsQueue>,
    scheduler: Scheduler,
    status: Arc<Status>,
    tick_interval: Duration,
    coordinators: CoordinatorsBuffer,
    executors: ExecutorsBuffer,
    usage: UsageTracker,
    buffer: Mutex<MessagesBuffer>,
    builder: JobsBuilder,
    stopped: AtomicBool,
    shutdown_lock: tokio::sync::Mutex<()>,
}

impl Listener {
    pub fn new(
        group_id: impl Into<SubscriptionGroupId>,
        topics: Vec<TopicConfig>,
        client: Arc<dyn Client>,
        queue: Arc<JobsQueue>,
        status: Arc<Status>,
        config: &RuntimeConfig,
    ) -> Result<Self, RuntimeError> {
        let group_id = group_id.into();

        config.validate()?;
        if topics.is_empty() {
            return Err(RuntimeError::InvalidConfiguration(format!(
                "subscription group {group_id:?} has no topics"
            )));
        }

        let mut runtimes = HashMap::new();
        for topic in topics {
            topic.validate()?;
            if topic.subscription_group != group_id {
                return Err(RuntimeError::InvalidConfiguration(format!(
                    "topic {:?} belongs to subscription group {:?}, not {group_id:?}",
                    topic.name, topic.subscription_group
                )));
            }
            let topic_config = Arc::new(topic);
            let strategy = Arc::new(Strategy::new(topic_config.clone(), client.clone()));
            runtimes.insert(
                topic_config.name.clone(),
                TopicRuntime {
                    config: topic_config,
                    strategy,
                },
            );
        }

        queue.register(&group_id);

        Ok(Self {
            builder: JobsBuilder::new(group_id.clone(), client.clone()),
            scheduler: Scheduler::new(queue.clone()),
            coordinators: CoordinatorsBuffer::new(config.pause_config()),
            executors: ExecutorsBuffer::new(),
            usage: UsageTracker::new(),
            buffer: Mutex::new(MessagesBuffer::new()),
            tick_interval: config.tick_interval(),
            group_id,
            topics: runtimes,
            client,
            queue,
            status,
            stopped: AtomicBool::new(false),
            shutdown_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn group_id(&self) -> &SubscriptionGroupId {
        &self.group_id
    }

    /// Run until the status cell requests quiet or stop, then drain and
    /// close the client.
    pub async fn run(&self) {
        info!(group = %self.group_id, "Starting listener");

        // Warm client statistics and callbacks before the first fetch.
        self.client.events_poll(BOOT_EVENTS_POLL).await;
        self.status.transition(RunState::Running);

        while !self.status.done() {
            if let Err(e) = self.iteration().await {
                error!(
                    group = %self.group_id,
                    error = %e,
                    "Fetch loop failed, restarting"
                );
                metrics::counter!(ERRORS_OCCURRED, "type" => "connection.listener.fetch_loop.error")
                    .increment(1);

                self.restart().await;
                tokio::time::sleep(RESTART_BACKOFF).await;
            }
        }

        self.quiet_down().await;
        self.shutdown().await;
    }

    /// One ordered pass of the running phase. No two phases of the same
    /// listener ever overlap.
    async fn iteration(&self) -> Result<()> {
        self.resume_paused_partitions();
        self.poll_and_remap_messages().await?;
        self.build_and_schedule_revoked_jobs();
        // Revocation jobs must finish before new consumption starts on
        // possibly re-assigned partitions.
        self.wait().await;
        self.build_and_schedule_flow_jobs();
        self.wait().await;
        self.build_and_schedule_periodic_jobs();
        self.wait().await;
        Ok(())
    }

    /// Lift expired, non-manual pause windows.
    fn resume_paused_partitions(&self) {
        let now = Instant::now();
        self.coordinators.each(|coordinator| {
            if coordinator.pause_expired(now) {
                match self.client.resume(coordinator.partition()) {
                    Ok(()) => {
                        coordinator.resume_pause();
                        debug!(partition = %coordinator.partition(), "Resumed partition");
                    }
                    Err(e) => {
                        warn!(
                            partition = %coordinator.partition(),
                            error = %e,
                            "Resume failed, keeping partition paused"
                        );
                    }
                }
            }
        });
    }

    async fn poll_and_remap_messages(&self) -> Result<()> {
        let messages = self.client.batch_poll().await?;
        metrics::counter!(BATCHES_POLLED, "group" => self.group_id.clone()).increment(1);
        self.buffer.lock().unwrap().remap(messages);
        Ok(())
    }

    /// Schedule one revoked job per live executor of each revoked
    /// partition, then purge the executors. Jobs are built first so they
    /// still see the executors that existed at revocation time.
    fn build_and_schedule_revoked_jobs(&self) {
        for partition in self.client.revoked_partitions() {
            let Some(runtime) = self.topics.get(partition.topic()) else {
                continue;
            };

            info!(partition = %partition, "Partition revoked");
            self.usage.revoke(&partition);

            let coordinator = self.coordinators.find_or_create(
                &partition,
                &runtime.config,
                runtime.strategy.clone(),
            );
            self.coordinators.revoke(&partition);

            let jobs: Vec<Job> = self
                .executors
                .for_partition(&partition)
                .into_iter()
                .map(|executor| self.builder.revoked(executor, coordinator.clone()))
                .collect();

            if !jobs.is_empty() {
                self.scheduler.on_schedule_revocation(jobs);
            }
            self.executors.revoke(&partition);
        }
    }

    /// Turn the polled batch into idle and consume jobs. Idle jobs are
    /// scheduled first; every consume job is counted on its coordinator
    /// before it is enqueued.
    fn build_and_schedule_flow_jobs(&self) {
        if self.status.done() {
            return;
        }

        let groups = self.buffer.lock().unwrap().drain();
        let mut idle_jobs = Vec::new();
        let mut consume_jobs = Vec::new();

        for (partition, mut messages) in groups {
            let Some(runtime) = self.topics.get(partition.topic()) else {
                warn!(partition = %partition, "Messages for an unconfigured topic, dropping");
                continue;
            };

            self.usage.track(&partition);
            let coordinator = self.coordinators.find_or_create(
                &partition,
                &runtime.config,
                runtime.strategy.clone(),
            );
            coordinator.filter_apply(&mut messages);

            if messages.is_empty() {
                let executor = self.executors.find_or_create(&partition, 0, &runtime.config);
                idle_jobs.push(self.builder.idle(executor, coordinator));
                continue;
            }

            coordinator.start(&messages);

            if runtime.config.long_running_job {
                // Paused for the duration of the batch so the poll loop can
                // keep the session alive without refetching; the strategy
                // resumes on success.
                if let Err(e) = self.client.pause(&partition) {
                    warn!(partition = %partition, error = %e, "Pause for long-running job failed");
                }
            }

            for (group_id, sub_batch) in Partitioner::call(&runtime.config, messages) {
                let executor = self
                    .executors
                    .find_or_create(&partition, group_id, &runtime.config);
                coordinator.increment();
                consume_jobs.push(self.builder.consume(
                    executor,
                    coordinator.clone(),
                    Arc::new(sub_batch),
                ));
            }
        }

        self.scheduler.on_schedule_idle(idle_jobs);
        self.scheduler.on_schedule_consumption(consume_jobs);
    }

    /// Schedule periodic jobs for assigned partitions that have periodics
    /// enabled and no recent activity.
    fn build_and_schedule_periodic_jobs(&self) {
        let mut jobs = Vec::new();

        for partition in self.client.assignment() {
            let Some(runtime) = self.topics.get(partition.topic()) else {
                continue;
            };
            let Some(periodics) = &runtime.config.periodics else {
                continue;
            };
            if self.usage.revoked(&partition)
                || self.usage.active_within(&partition, periodics.interval)
            {
                continue;
            }

            self.usage.track(&partition);
            let coordinator = self.coordinators.find_or_create(
                &partition,
                &runtime.config,
                runtime.strategy.clone(),
            );

            let mut executors = self.executors.for_partition(&partition);
            if executors.is_empty() {
                executors.push(self.executors.find_or_create(&partition, 0, &runtime.config));
            }
            for executor in executors {
                jobs.push(self.builder.periodic(executor, coordinator.clone()));
            }
        }

        if !jobs.is_empty() {
            self.scheduler.on_schedule_periodic(jobs);
        }
    }

    /// Block until this group's queue shard drains, pumping events polling
    /// and the scheduler's manage tick.
    async fn wait(&self) {
        let client = self.client.clone();
        let scheduler = self.scheduler.clone();
        self.queue
            .wait(&self.group_id, self.tick_interval, move || {
                let client = client.clone();
                let scheduler = scheduler.clone();
                async move {
                    client.events_poll(Duration::ZERO).await;
                    scheduler.on_manage();
                }
            })
            .await;
    }

    /// Recover from a fetch-loop error: drop queued jobs, drain in-flight
    /// ones, reset the client session and discard all state tied to the
    /// previous session generation.
    async fn restart(&self) {
        metrics::counter!(LISTENER_RESTARTS, "group" => self.group_id.clone()).increment(1);

        self.scheduler.on_clear(&self.group_id);
        self.wait().await;

        self.client.reset();
        self.coordinators.reset();
        self.executors.clear();
        self.usage.clear();
        self.buffer.lock().unwrap().clear();
    }

    /// Quieting phase: no new flow jobs, but the session is kept alive and
    /// long-running jobs keep learning about cluster changes until a stop
    /// request arrives.
    async fn quiet_down(&self) {
        while !self.status.stopping() {
            self.client.ping().await;
            self.build_and_schedule_revoked_jobs();
            self.wait().await;

            if self.status.quieting() && self.queue.is_empty(&self.group_id) {
                info!(group = %self.group_id, "Subscription group is quiet");
                self.status.transition(RunState::Quiet);
            }

            tokio::time::sleep(self.tick_interval).await;
        }
    }

    /// Final drain: one shutdown job per executor, then close the client.
    /// Idempotent and safe to call from a foreign task (forced-shutdown
    /// timers).
    pub async fn shutdown(&self) {
        let _guard = self.shutdown_lock.lock().await;
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(group = %self.group_id, "Shutting down listener");
        self.status.transition(RunState::Stopping);

        let mut jobs = Vec::new();
        for executor in self.executors.all() {
            let Some(runtime) = self.topics.get(executor.partition().topic()) else {
                continue;
            };
            let coordinator = self.coordinators.find_or_create(
                executor.partition(),
                &runtime.config,
                runtime.strategy.clone(),
            );
            jobs.push(self.builder.shutdown(executor, coordinator));
        }

        if !jobs.is_empty() {
            self.scheduler.on_schedule_shutdown(jobs);
        }
        self.wait().await;

        self.executors.clear();
        self.client.ping().await;
        self.client.stop().await;
        self.status.transition(RunState::Stopped);
        info!(group = %self.group_id, "Listener stopped");
    }
}
