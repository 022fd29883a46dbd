use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use rdkafka::message::OwnedMessage;

use crate::config::TopicConfig;
use crate::types::VirtualGroupId;

/// Splits one partition's batch into virtual-partition groups.
///
/// Messages arrive in broker order and are appended to their group in that
/// order, so each group preserves offset order. Without virtual partitions
/// the whole batch maps onto group zero.
pub struct Partitioner;

impl Partitioner {
    pub fn call(
        topic: &TopicConfig,
        messages: Vec<OwnedMessage>,
    ) -> Vec<(VirtualGroupId, Vec<OwnedMessage>)> {
        let Some(vp) = &topic.virtual_partitions else {
            return vec![(0, messages)];
        };

        let buckets = vp.max_partitions.max(1) as u64;
        let mut groups: BTreeMap<VirtualGroupId, Vec<OwnedMessage>> = BTreeMap::new();

        for message in messages {
            let key = (vp.partitioner)(&message);
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            let group_id = (hasher.finish() % buckets) as VirtualGroupId;
            groups.entry(group_id).or_default().push(message);
        }

        groups.into_iter().collect()
    }
}
