use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::jobs::{Job, JobKind};
use crate::jobs_queue::JobsQueue;
use crate::metrics_consts::{JOBS_COMPLETED, JOB_FAILURES};

/// Pool of worker tasks consuming the shared jobs queue.
///
/// Workers execute user code, feed results back into the job's coordinator
/// and run the post-consume continuation when they are the one draining the
/// coordinator to zero. User-code failures never propagate out of a worker.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(queue: Arc<JobsQueue>, concurrency: usize) -> Self {
        info!("Starting worker pool with {} workers", concurrency);

        let handles = (0..concurrency)
            .map(|id| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    Self::run_worker(id, queue).await;
                })
            })
            .collect();

        Self { handles }
    }

    async fn run_worker(id: usize, queue: Arc<JobsQueue>) {
        debug!("Worker {} started", id);

        while let Some(job) = queue.pop().await {
            let group = job.group().clone();
            Self::execute(job).await;
            queue.complete(&group);
        }

        debug!("Worker {} shutting down", id);
    }

    async fn execute(job: Job) {
        let kind = job.kind();
        let partition = job.executor().partition().clone();

        match kind {
            JobKind::Consume => {
                let result = job.executor().consume(job.messages(), job.ctx()).await;
                let success = result.is_ok();

                if let Err(e) = result {
                    error!(
                        partition = %partition,
                        error = %e,
                        "Consume job failed"
                    );
                    metrics::counter!(JOB_FAILURES, "kind" => kind.label()).increment(1);
                }

                let coordinator = job.coordinator().clone();
                if coordinator.decrement(success) {
                    let last_message = coordinator.last_message();
                    for callback in coordinator.callbacks() {
                        callback.on_finished(&coordinator, last_message.clone()).await;
                    }
                }
            }
            JobKind::Idle => Self::run_lifecycle(&job, job.executor().idle(job.ctx()).await),
            JobKind::Revoked => Self::run_lifecycle(&job, job.executor().revoked(job.ctx()).await),
            JobKind::Shutdown => Self::run_lifecycle(&job, job.executor().shutdown(job.ctx()).await),
            JobKind::Periodic => Self::run_lifecycle(&job, job.executor().periodic(job.ctx()).await),
        }

        metrics::counter!(JOBS_COMPLETED, "kind" => kind.label()).increment(1);
    }

    fn run_lifecycle(job: &Job, result: anyhow::Result<()>) {
        if let Err(e) = result {
            error!(
                partition = %job.executor().partition(),
                kind = job.kind().label(),
                error = %e,
                "Lifecycle job failed"
            );
            metrics::counter!(JOB_FAILURES, "kind" => job.kind().label()).increment(1);
        }
    }

    /// Wait for all workers to exit. Call after closing the queue.
    pub async fn shutdown(self) {
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{Consumer, JobContext};
    use crate::coordinator::{Coordinator, FinishedCallback};
    use crate::executor::Executor;
    use crate::jobs::JobsBuilder;
    use crate::pause_tracker::PauseConfig;
    use crate::test_support::{test_message, MockClient};
    use crate::types::Partition;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use rdkafka::message::OwnedMessage;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    struct RecordingConsumer {
        consumed: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Consumer for RecordingConsumer {
        async fn consume(&mut self, messages: &[OwnedMessage], _ctx: &JobContext) -> Result<()> {
            self.consumed.fetch_add(messages.len(), Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("boom"))
            } else {
                Ok(())
            }
        }
    }

    struct FinishedFlag {
        fired: AtomicUsize,
        success: AtomicBool,
    }

    #[async_trait]
    impl FinishedCallback for FinishedFlag {
        async fn on_finished(
            &self,
            coordinator: &Arc<Coordinator>,
            _last_message: Option<OwnedMessage>,
        ) {
            self.fired.fetch_add(1, Ordering::SeqCst);
            self.success.store(coordinator.success(), Ordering::SeqCst);
        }
    }

    fn setup(
        fail: bool,
    ) -> (
        Arc<JobsQueue>,
        JobsBuilder,
        Arc<Executor>,
        Arc<Coordinator>,
        Arc<FinishedFlag>,
        Arc<AtomicUsize>,
    ) {
        let queue = Arc::new(JobsQueue::new());
        let group = "group-a".to_string();
        queue.register(&group);

        let builder = JobsBuilder::new(group, Arc::new(MockClient::new()));
        let partition = Partition::new("test-topic".to_string(), 0);
        let consumed = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(Executor::new(
            partition.clone(),
            0,
            Box::new(RecordingConsumer {
                consumed: consumed.clone(),
                fail,
            }),
        ));
        let coordinator = Arc::new(Coordinator::new(partition, PauseConfig::default(), None));
        let flag = Arc::new(FinishedFlag {
            fired: AtomicUsize::new(0),
            success: AtomicBool::new(false),
        });
        coordinator.install(flag.clone());

        (queue, builder, executor, coordinator, flag, consumed)
    }

    #[tokio::test]
    async fn test_worker_executes_and_fires_finished() {
        let (queue, builder, executor, coordinator, flag, consumed) = setup(false);

        let batch = vec![
            test_message("test-topic", 0, 1, "a"),
            test_message("test-topic", 0, 2, "b"),
        ];
        coordinator.start(&batch);
        coordinator.increment();
        queue.push(builder.consume(executor, coordinator.clone(), Arc::new(batch)));

        let pool = WorkerPool::start(queue.clone(), 2);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(consumed.load(Ordering::SeqCst), 2);
        assert_eq!(flag.fired.load(Ordering::SeqCst), 1);
        assert!(flag.success.load(Ordering::SeqCst));

        queue.close();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_user_failure_is_contained_and_flips_success() {
        let (queue, builder, executor, coordinator, flag, _consumed) = setup(true);

        let batch = vec![test_message("test-topic", 0, 1, "a")];
        coordinator.start(&batch);
        coordinator.increment();
        queue.push(builder.consume(executor, coordinator.clone(), Arc::new(batch)));

        let pool = WorkerPool::start(queue.clone(), 1);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(flag.fired.load(Ordering::SeqCst), 1);
        assert!(!flag.success.load(Ordering::SeqCst));
        assert!(queue.is_empty(&"group-a".to_string()));

        queue.close();
        pool.shutdown().await;
    }
}
