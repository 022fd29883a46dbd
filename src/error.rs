use thiserror::Error;

/// Errors surfaced by the runtime at setup or subscription time.
///
/// Failures inside the fetch loop or worker pool are not represented here:
/// user-code failures stay inside the retry/DLQ machinery, and transport
/// failures trigger a listener restart and are reported through the
/// `errors_occurred` counter.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration is structurally wrong. Fatal to process boot.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A time-based offset lookup returned no offset for a requested
    /// partition.
    #[error("time-based offset lookup returned no offset for {topic}-{partition}")]
    InvalidTimeBasedOffset { topic: String, partition: i32 },

    #[error(transparent)]
    Kafka(#[from] rdkafka::error::KafkaError),
}
