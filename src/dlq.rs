use rdkafka::message::{Headers, OwnedMessage};
use rdkafka::Message;

/// Headers added to every dead-lettered message, identifying where the
/// original came from.
pub const ORIGINAL_TOPIC_HEADER: &str = "original_topic";
pub const ORIGINAL_PARTITION_HEADER: &str = "original_partition";
pub const ORIGINAL_OFFSET_HEADER: &str = "original_offset";

/// A record ready to be produced to a dead-letter topic. Carries the
/// original key, payload and headers, plus the origin coordinates.
#[derive(Debug, Clone)]
pub struct DlqRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Option<Vec<u8>>)>,
}

impl DlqRecord {
    pub fn from_original(dlq_topic: &str, message: &OwnedMessage) -> Self {
        let mut headers: Vec<(String, Option<Vec<u8>>)> = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| (h.key.to_owned(), h.value.map(|v| v.to_vec())))
                    .collect()
            })
            .unwrap_or_default();

        headers.push((
            ORIGINAL_TOPIC_HEADER.to_string(),
            Some(message.topic().as_bytes().to_vec()),
        ));
        headers.push((
            ORIGINAL_PARTITION_HEADER.to_string(),
            Some(message.partition().to_string().into_bytes()),
        ));
        headers.push((
            ORIGINAL_OFFSET_HEADER.to_string(),
            Some(message.offset().to_string().into_bytes()),
        ));

        Self {
            topic: dlq_topic.to_string(),
            key: message.key().map(|k| k.to_vec()),
            payload: message.payload().map(|p| p.to_vec()),
            headers,
        }
    }

    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::{Header, OwnedHeaders, Timestamp};

    #[test]
    fn test_record_carries_original_key_payload_and_headers() {
        let headers = OwnedHeaders::new().insert(Header {
            key: "trace-id",
            value: Some("abc".as_bytes()),
        });
        let message = OwnedMessage::new(
            Some(b"payload".to_vec()),
            Some(b"key".to_vec()),
            "events".to_string(),
            Timestamp::NotAvailable,
            3,
            42,
            Some(headers),
        );

        let record = DlqRecord::from_original("events-dlq", &message);

        assert_eq!(record.topic, "events-dlq");
        assert_eq!(record.key.as_deref(), Some(b"key".as_ref()));
        assert_eq!(record.payload.as_deref(), Some(b"payload".as_ref()));
        assert_eq!(record.header("trace-id"), Some(b"abc".as_ref()));
        assert_eq!(record.header(ORIGINAL_TOPIC_HEADER), Some(b"events".as_ref()));
        assert_eq!(record.header(ORIGINAL_PARTITION_HEADER), Some(b"3".as_ref()));
        assert_eq!(record.header(ORIGINAL_OFFSET_HEADER), Some(b"42".as_ref()));
    }

    #[test]
    fn test_record_without_headers_still_gets_origin() {
        let message = OwnedMessage::new(
            None,
            None,
            "events".to_string(),
            Timestamp::NotAvailable,
            0,
            7,
            None,
        );

        let record = DlqRecord::from_original("events-dlq", &message);

        assert!(record.key.is_none());
        assert!(record.payload.is_none());
        assert_eq!(record.header(ORIGINAL_OFFSET_HEADER), Some(b"7".as_ref()));
    }
}
