use std::collections::HashMap;

use rdkafka::message::OwnedMessage;
use rdkafka::Message;

use crate::types::Partition;

/// Holds the raw batch of one poll generation, grouped by partition. The
/// buffer is remapped on every poll cycle; it never carries messages across
/// cycles.
#[derive(Debug, Default)]
pub struct MessagesBuffer {
    groups: HashMap<Partition, Vec<OwnedMessage>>,
    size: usize,
}

impl MessagesBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the previous generation with a freshly polled batch.
    pub fn remap(&mut self, messages: Vec<OwnedMessage>) {
        self.groups.clear();
        self.size = messages.len();

        for message in messages {
            let partition = Partition::new(message.topic().to_string(), message.partition());
            self.groups.entry(partition).or_default().push(message);
        }
    }

    /// Take the current generation out of the buffer, leaving it empty.
    pub fn drain(&mut self) -> Vec<(Partition, Vec<OwnedMessage>)> {
        self.size = 0;
        self.groups.drain().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_message;

    #[test]
    fn test_remap_groups_by_partition() {
        let mut buffer = MessagesBuffer::new();
        buffer.remap(vec![
            test_message("topic-a", 0, 10, "a"),
            test_message("topic-a", 1, 5, "b"),
            test_message("topic-a", 0, 11, "c"),
            test_message("topic-b", 0, 7, "d"),
        ]);

        assert_eq!(buffer.size(), 4);
        let groups: HashMap<_, _> = buffer.drain().into_iter().collect();
        assert_eq!(groups.len(), 3);

        let a0 = &groups[&Partition::new("topic-a".to_string(), 0)];
        assert_eq!(a0.len(), 2);
        assert_eq!(a0[0].offset(), 10);
        assert_eq!(a0[1].offset(), 11);
    }

    #[test]
    fn test_remap_replaces_previous_generation() {
        let mut buffer = MessagesBuffer::new();
        buffer.remap(vec![test_message("topic-a", 0, 1, "old")]);
        buffer.remap(vec![test_message("topic-b", 2, 9, "new")]);

        let groups = buffer.drain();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, Partition::new("topic-b".to_string(), 2));
    }

    #[test]
    fn test_drain_empties_the_buffer() {
        let mut buffer = MessagesBuffer::new();
        buffer.remap(vec![test_message("topic-a", 0, 1, "x")]);

        assert!(!buffer.is_empty());
        let _ = buffer.drain();
        assert!(buffer.is_empty());
        assert_eq!(buffer.size(), 0);
    }
}
