use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::message::OwnedMessage;
use rdkafka::Message;

use crate::consumer::ConsumerFactory;
use crate::error::RuntimeError;
use crate::filter::FilterFactory;
use crate::pause_tracker::PauseConfig;

/// Process-level configuration, initialized from the environment.
#[derive(Envconfig, Clone, Debug)]
pub struct RuntimeConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "partition-runtime")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    /// Number of worker tasks shared by all subscription groups.
    #[envconfig(default = "4")]
    pub concurrency: usize,

    /// Maximum messages fetched per poll cycle.
    #[envconfig(default = "100")]
    pub max_messages: usize,

    /// How long one poll may wait for messages.
    #[envconfig(default = "1000")]
    pub max_wait_time_ms: u64,

    #[envconfig(default = "1000")]
    pub pause_timeout_ms: u64,

    #[envconfig(default = "30000")]
    pub pause_max_timeout_ms: u64,

    #[envconfig(default = "true")]
    pub pause_with_exponential_backoff: bool,

    /// Events-poll cadence while the listener blocks on queue drain.
    #[envconfig(default = "200")]
    pub tick_interval_ms: u64,

    #[envconfig(default = "60")]
    pub shutdown_timeout_secs: u64,
}

impl RuntimeConfig {
    /// Initialize from environment variables (for production and tests).
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Self::init_from_env()
    }

    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn pause_config(&self) -> PauseConfig {
        PauseConfig {
            timeout: Duration::from_millis(self.pause_timeout_ms),
            max_timeout: Duration::from_millis(self.pause_max_timeout_ms),
            with_exponential_backoff: self.pause_with_exponential_backoff,
        }
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.concurrency == 0 {
            return Err(RuntimeError::InvalidConfiguration(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_messages == 0 {
            return Err(RuntimeError::InvalidConfiguration(
                "max_messages must be at least 1".to_string(),
            ));
        }
        if self.pause_max_timeout_ms < self.pause_timeout_ms {
            return Err(RuntimeError::InvalidConfiguration(format!(
                "pause_max_timeout_ms ({}) must not be below pause_timeout_ms ({})",
                self.pause_max_timeout_ms, self.pause_timeout_ms
            )));
        }
        Ok(())
    }
}

/// How dead-lettered records are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMethod {
    ProduceAsync,
    ProduceSync,
}

impl DispatchMethod {
    pub fn parse(value: &str) -> Result<Self, RuntimeError> {
        match value {
            "produce_async" => Ok(DispatchMethod::ProduceAsync),
            "produce_sync" => Ok(DispatchMethod::ProduceSync),
            other => Err(RuntimeError::InvalidConfiguration(format!(
                "unknown dead letter queue dispatch method: {other:?}"
            ))),
        }
    }
}

/// Per-message predicate deciding whether an exhausted message is dispatched
/// to the dead-letter topic or skipped silently.
pub type DispatchPredicate = Arc<dyn Fn(&OwnedMessage) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct DlqConfig {
    /// Target topic. `None` bounds retries without dispatching anywhere:
    /// exhausted messages are skipped.
    pub topic: Option<String>,
    pub max_retries: u32,
    pub dispatch_method: DispatchMethod,
    pub dispatch_predicate: Option<DispatchPredicate>,
}

impl DlqConfig {
    pub fn new(
        topic: Option<String>,
        max_retries: u32,
        dispatch_method: &str,
    ) -> Result<Self, RuntimeError> {
        Ok(Self {
            topic,
            max_retries,
            dispatch_method: DispatchMethod::parse(dispatch_method)?,
            dispatch_predicate: None,
        })
    }

    pub fn dispatch_to_dlq(&self, message: &OwnedMessage) -> bool {
        self.topic.is_some()
            && self
                .dispatch_predicate
                .as_ref()
                .is_none_or(|predicate| predicate(message))
    }
}

impl std::fmt::Debug for DlqConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlqConfig")
            .field("topic", &self.topic)
            .field("max_retries", &self.max_retries)
            .field("dispatch_method", &self.dispatch_method)
            .finish()
    }
}

/// Key extractor routing messages of one partition onto virtual groups.
pub type VirtualPartitioner = Arc<dyn Fn(&OwnedMessage) -> Vec<u8> + Send + Sync>;

#[derive(Clone)]
pub struct VirtualPartitionsConfig {
    pub partitioner: VirtualPartitioner,
    pub max_partitions: usize,
}

impl VirtualPartitionsConfig {
    /// Routes by message key; key-less messages share one group.
    pub fn by_message_key(max_partitions: usize) -> Self {
        Self {
            partitioner: Arc::new(|message: &OwnedMessage| {
                message.key().map(|k| k.to_vec()).unwrap_or_default()
            }),
            max_partitions,
        }
    }
}

impl std::fmt::Debug for VirtualPartitionsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualPartitionsConfig")
            .field("max_partitions", &self.max_partitions)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PeriodicsConfig {
    pub interval: Duration,
}

/// Declared feature set of a topic. The post-consume strategy is the unique
/// function of this tuple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet {
    pub active_job: bool,
    pub dead_letter_queue: bool,
    pub filtering: bool,
    pub manual_offset_management: bool,
    pub virtual_partitions: bool,
    pub long_running_job: bool,
}

/// Per-topic configuration: which consumer runs, which features compose the
/// post-consume policy.
#[derive(Clone)]
pub struct TopicConfig {
    pub name: String,
    pub subscription_group: String,
    pub consumer_factory: ConsumerFactory,
    pub manual_offset_management: bool,
    pub dead_letter_queue: Option<DlqConfig>,
    pub filtering: Option<FilterFactory>,
    pub virtual_partitions: Option<VirtualPartitionsConfig>,
    pub long_running_job: bool,
    pub periodics: Option<PeriodicsConfig>,
    pub active_job: bool,
}

impl TopicConfig {
    pub fn new(
        name: impl Into<String>,
        subscription_group: impl Into<String>,
        consumer_factory: ConsumerFactory,
    ) -> Self {
        Self {
            name: name.into(),
            subscription_group: subscription_group.into(),
            consumer_factory,
            manual_offset_management: false,
            dead_letter_queue: None,
            filtering: None,
            virtual_partitions: None,
            long_running_job: false,
            periodics: None,
            active_job: false,
        }
    }

    pub fn with_manual_offset_management(mut self) -> Self {
        self.manual_offset_management = true;
        self
    }

    pub fn with_dead_letter_queue(mut self, dlq: DlqConfig) -> Self {
        self.dead_letter_queue = Some(dlq);
        self
    }

    pub fn with_filtering(mut self, factory: FilterFactory) -> Self {
        self.filtering = Some(factory);
        self
    }

    pub fn with_virtual_partitions(mut self, config: VirtualPartitionsConfig) -> Self {
        self.virtual_partitions = Some(config);
        self
    }

    pub fn with_long_running_job(mut self) -> Self {
        self.long_running_job = true;
        self
    }

    pub fn with_periodics(mut self, interval: Duration) -> Self {
        self.periodics = Some(PeriodicsConfig { interval });
        self
    }

    pub fn with_active_job(mut self) -> Self {
        self.active_job = true;
        self
    }

    pub fn feature_set(&self) -> FeatureSet {
        FeatureSet {
            active_job: self.active_job,
            dead_letter_queue: self.dead_letter_queue.is_some(),
            filtering: self.filtering.is_some(),
            manual_offset_management: self.manual_offset_management,
            virtual_partitions: self.virtual_partitions.is_some(),
            long_running_job: self.long_running_job,
        }
    }

    /// Retry bound before the skip/DLQ path runs. Without a DLQ section the
    /// partition retries forever.
    pub fn max_retries(&self) -> u32 {
        self.dead_letter_queue
            .as_ref()
            .map(|dlq| dlq.max_retries)
            .unwrap_or(u32::MAX)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.name.is_empty() {
            return Err(RuntimeError::InvalidConfiguration(
                "topic name must not be empty".to_string(),
            ));
        }
        if let Some(vp) = &self.virtual_partitions {
            if vp.max_partitions == 0 {
                return Err(RuntimeError::InvalidConfiguration(format!(
                    "virtual_partitions.max_partitions must be at least 1 for topic {:?}",
                    self.name
                )));
            }
        }
        if let Some(periodics) = &self.periodics {
            if periodics.interval.is_zero() {
                return Err(RuntimeError::InvalidConfiguration(format!(
                    "periodics.interval must be positive for topic {:?}",
                    self.name
                )));
            }
        }
        if let Some(dlq) = &self.dead_letter_queue {
            if dlq.topic.as_deref() == Some(self.name.as_str()) {
                return Err(RuntimeError::InvalidConfiguration(format!(
                    "dead letter queue topic must differ from the source topic {:?}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TopicConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicConfig")
            .field("name", &self.name)
            .field("subscription_group", &self.subscription_group)
            .field("features", &self.feature_set())
            .finish()
    }
}
