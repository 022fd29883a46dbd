// Metric name constants for the partition runtime.

/// Counter with a `type` label identifying the failure source
/// (e.g. `connection.listener.fetch_loop.error`).
pub const ERRORS_OCCURRED: &str = "partition_runtime_errors_occurred";

pub const JOBS_SCHEDULED: &str = "partition_runtime_jobs_scheduled";
pub const JOBS_COMPLETED: &str = "partition_runtime_jobs_completed";
pub const JOB_FAILURES: &str = "partition_runtime_job_failures";

pub const QUEUE_DEPTH: &str = "partition_runtime_queue_depth";
pub const QUEUE_IN_FLIGHT: &str = "partition_runtime_queue_in_flight";

pub const PARTITION_PAUSES: &str = "partition_runtime_partition_pauses";
pub const CONSUME_RETRIES: &str = "partition_runtime_consume_retries";
pub const DLQ_DISPATCHES: &str = "partition_runtime_dlq_dispatches";
pub const MESSAGES_SKIPPED: &str = "partition_runtime_messages_skipped";

pub const LISTENER_RESTARTS: &str = "partition_runtime_listener_restarts";
pub const BATCHES_POLLED: &str = "partition_runtime_batches_polled";
