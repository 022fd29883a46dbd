use std::time::Duration;

use rdkafka::message::OwnedMessage;

/// Message filter applied to a partition's batch before jobs are built.
///
/// A filter may drop any subset of the batch. When it drops the tail, it
/// reports the first removed message as its cursor so the post-consume path
/// can seek back and (optionally) pause until the filter is ready to accept
/// messages again.
pub trait Filter: Send {
    /// Remove unwanted messages from the batch in place.
    fn apply(&mut self, messages: &mut Vec<OwnedMessage>);

    /// Whether the last `apply` removed anything.
    fn applied(&self) -> bool;

    /// The first message removed by the last `apply`, if the filter wants
    /// consumption to resume from it.
    fn cursor(&self) -> Option<&OwnedMessage>;

    /// How long to pause the partition after seeking back to the cursor.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Factory invoked once per partition; each partition gets its own filter
/// instance so filters may carry state.
pub type FilterFactory = std::sync::Arc<dyn Fn() -> Box<dyn Filter> + Send + Sync>;
