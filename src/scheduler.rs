use std::sync::Arc;

use crate::jobs::Job;
use crate::jobs_queue::JobsQueue;
use crate::types::SubscriptionGroupId;

/// Dispatch policy between the listener and the worker pool. The default is
/// FIFO per subscription group; urgency is carried by the jobs themselves so
/// revocation and shutdown are never starved behind consumption.
#[derive(Clone)]
pub struct Scheduler {
    queue: Arc<JobsQueue>,
}

impl Scheduler {
    pub fn new(queue: Arc<JobsQueue>) -> Self {
        Self { queue }
    }

    fn schedule(&self, jobs: Vec<Job>) {
        for mut job in jobs {
            job.before_schedule();
            self.queue.push(job);
        }
    }

    pub fn on_schedule_consumption(&self, jobs: Vec<Job>) {
        self.schedule(jobs);
    }

    pub fn on_schedule_idle(&self, jobs: Vec<Job>) {
        self.schedule(jobs);
    }

    pub fn on_schedule_revocation(&self, jobs: Vec<Job>) {
        self.schedule(jobs);
    }

    pub fn on_schedule_shutdown(&self, jobs: Vec<Job>) {
        self.schedule(jobs);
    }

    pub fn on_schedule_periodic(&self, jobs: Vec<Job>) {
        self.schedule(jobs);
    }

    /// Periodic tick from the listener's drain loop. The FIFO policy has no
    /// deferred work; custom policies would flush it here.
    pub fn on_manage(&self) {}

    /// Drop everything scheduled for a group. Invoked on listener restart.
    pub fn on_clear(&self, group: &SubscriptionGroupId) {
        self.queue.clear(group);
    }
}
