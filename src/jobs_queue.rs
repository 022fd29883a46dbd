use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::jobs::Job;
use crate::metrics_consts::{QUEUE_DEPTH, QUEUE_IN_FLIGHT};
use crate::types::SubscriptionGroupId;

#[derive(Default)]
struct Shard {
    urgent: VecDeque<Job>,
    regular: VecDeque<Job>,
    in_flight: usize,
}

impl Shard {
    fn depth(&self) -> usize {
        self.urgent.len() + self.regular.len()
    }

    fn busy(&self) -> bool {
        self.depth() > 0 || self.in_flight > 0
    }
}

struct Inner {
    shards: HashMap<SubscriptionGroupId, Shard>,
    closed: bool,
}

/// Multi-producer multi-consumer job queue, sharded by subscription group.
///
/// Revocation and shutdown jobs travel through a per-shard urgent lane that
/// workers drain first. A shard counts both queued and in-flight jobs;
/// `wait` returns only when both hit zero, which is what makes the
/// listener's drain barriers safe across rebalances.
pub struct JobsQueue {
    inner: Mutex<Inner>,
    work: Notify,
    drained: Notify,
}

impl Default for JobsQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobsQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                shards: HashMap::new(),
                closed: false,
            }),
            work: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// Create the shard for a subscription group. Idempotent.
    pub fn register(&self, group: &SubscriptionGroupId) {
        let mut inner = self.inner.lock().unwrap();
        inner.shards.entry(group.clone()).or_default();
    }

    pub fn push(&self, job: Job) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            let shard = inner.shards.entry(job.group().clone()).or_default();
            if job.urgent() {
                shard.urgent.push_back(job);
            } else {
                shard.regular.push_back(job);
            }
        }
        self.work.notify_one();
    }

    /// Pop the next job, blocking until one is available. Returns `None`
    /// once the queue is closed and empty, which is the workers' exit
    /// signal. Popping counts the job as in-flight until `complete`.
    pub async fn pop(&self) -> Option<Job> {
        loop {
            let notified = self.work.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                let mut found = None;
                for shard in inner.shards.values_mut() {
                    if let Some(job) = shard.urgent.pop_front().or_else(|| shard.regular.pop_front())
                    {
                        shard.in_flight += 1;
                        found = Some(job);
                        break;
                    }
                }
                if let Some(job) = found {
                    // Other workers may still find work.
                    self.work.notify_one();
                    return Some(job);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Report a popped job as finished. Releases `wait`ers once the shard is
    /// fully drained.
    pub fn complete(&self, group: &SubscriptionGroupId) {
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            let Some(shard) = inner.shards.get_mut(group) else {
                return;
            };
            shard.in_flight = shard.in_flight.saturating_sub(1);
            !shard.busy()
        };
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// True when the shard has neither queued nor in-flight jobs.
    pub fn is_empty(&self, group: &SubscriptionGroupId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.shards.get(group).is_none_or(|shard| !shard.busy())
    }

    /// Block until the shard drains, invoking `tick` at least every
    /// `tick_every` so the caller can keep servicing client events.
    pub async fn wait<F, Fut>(&self, group: &SubscriptionGroupId, tick_every: Duration, mut tick: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            if self.is_empty(group) {
                return;
            }
            let _ = tokio::time::timeout(tick_every, self.drained.notified()).await;
            tick().await;

            let (depth, in_flight) = self.shard_stats(group);
            metrics::gauge!(QUEUE_DEPTH, "group" => group.clone()).set(depth as f64);
            metrics::gauge!(QUEUE_IN_FLIGHT, "group" => group.clone()).set(in_flight as f64);
        }
    }

    /// Drop the shard's queued jobs. In-flight jobs keep running; `wait`
    /// still blocks until they complete.
    pub fn clear(&self, group: &SubscriptionGroupId) {
        let drained = {
            let mut inner = self.inner.lock().unwrap();
            let Some(shard) = inner.shards.get_mut(group) else {
                return;
            };
            shard.urgent.clear();
            shard.regular.clear();
            !shard.busy()
        };
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Close the queue: no further pushes are accepted, and workers drain
    /// the remaining jobs before exiting.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.closed = true;
        }
        self.work.notify_waiters();
    }

    fn shard_stats(&self, group: &SubscriptionGroupId) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        inner
            .shards
            .get(group)
            .map(|shard| (shard.depth(), shard.in_flight))
            .unwrap_or((0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_job;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_push_pop_complete_roundtrip() {
        let queue = JobsQueue::new();
        let group = "group-a".to_string();
        queue.register(&group);

        assert!(queue.is_empty(&group));

        queue.push(test_job(&group, crate::jobs::JobKind::Consume));
        assert!(!queue.is_empty(&group));

        let job = queue.pop().await.unwrap();
        // Popped but in-flight: still not empty.
        assert!(!queue.is_empty(&group));

        queue.complete(job.group());
        assert!(queue.is_empty(&group));
    }

    #[tokio::test]
    async fn test_urgent_jobs_jump_the_queue() {
        let queue = JobsQueue::new();
        let group = "group-a".to_string();
        queue.register(&group);

        queue.push(test_job(&group, crate::jobs::JobKind::Consume));
        queue.push(test_job(&group, crate::jobs::JobKind::Consume));
        queue.push(test_job(&group, crate::jobs::JobKind::Revoked));

        let first = queue.pop().await.unwrap();
        assert_eq!(first.kind(), crate::jobs::JobKind::Revoked);
    }

    #[tokio::test]
    async fn test_wait_blocks_until_in_flight_completes() {
        let queue = Arc::new(JobsQueue::new());
        let group = "group-a".to_string();
        queue.register(&group);
        queue.push(test_job(&group, crate::jobs::JobKind::Consume));

        let job = queue.pop().await.unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let queue = queue.clone();
            let group = group.clone();
            let ticks = ticks.clone();
            tokio::spawn(async move {
                queue
                    .wait(&group, Duration::from_millis(10), || {
                        let ticks = ticks.clone();
                        async move {
                            ticks.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                    .await;
            })
        };

        sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "wait must not return while in-flight");

        queue.complete(job.group());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should return after completion")
            .unwrap();
        assert!(ticks.load(Ordering::SeqCst) > 0, "tick callback must pump");
    }

    #[tokio::test]
    async fn test_clear_drops_queued_but_not_in_flight() {
        let queue = JobsQueue::new();
        let group = "group-a".to_string();
        queue.register(&group);

        queue.push(test_job(&group, crate::jobs::JobKind::Consume));
        queue.push(test_job(&group, crate::jobs::JobKind::Consume));

        let job = queue.pop().await.unwrap();
        queue.clear(&group);

        // The in-flight job still counts.
        assert!(!queue.is_empty(&group));
        queue.complete(job.group());
        assert!(queue.is_empty(&group));
    }

    #[tokio::test]
    async fn test_close_releases_idle_workers() {
        let queue = Arc::new(JobsQueue::new());
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        sleep(Duration::from_millis(20)).await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), popper)
            .await
            .expect("pop should return after close")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_shards_are_independent() {
        let queue = JobsQueue::new();
        let group_a = "group-a".to_string();
        let group_b = "group-b".to_string();
        queue.register(&group_a);
        queue.register(&group_b);

        queue.push(test_job(&group_a, crate::jobs::JobKind::Consume));

        assert!(!queue.is_empty(&group_a));
        assert!(queue.is_empty(&group_b));
    }
}
