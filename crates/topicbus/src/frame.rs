//! Frame body layout for one `(topic, payload)` message.
//!
//! ```text
//! ┌──────────────┬──────────────────┬─────────────────┐
//! │ topic_len u16│ topic (UTF-8)    │ payload (opaque)│
//! │ big-endian   │ topic_len bytes  │ rest of frame   │
//! └──────────────┴──────────────────┴─────────────────┘
//! ```
//!
//! The payload is never inspected; decoding only needs the header.
//! Stream framing (the outer length prefix) lives in `codec`.

use tokio_util::bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const TOPIC_HEADER_LEN: usize = 2;
pub const MAX_TOPIC_LEN: usize = u16::MAX as usize;

/// A topic-tagged message with an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as UTF-8, if it is.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn into_parts(self) -> (String, Bytes) {
        (self.topic, self.payload)
    }
}

/// Size of the encoded body for a topic and payload.
pub fn encoded_len(topic: &str, payload: &[u8]) -> usize {
    TOPIC_HEADER_LEN + topic.len() + payload.len()
}

/// Encode a frame body.
pub fn encode(topic: &str, payload: &[u8]) -> Result<Bytes> {
    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::TopicTooLong {
            len: topic.len(),
            max: MAX_TOPIC_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(encoded_len(topic, payload));
    buf.put_u16(topic.len() as u16);
    buf.put_slice(topic.as_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode a frame body. The payload shares the frame's buffer.
pub fn decode(frame: Bytes) -> Result<Message> {
    if frame.len() < TOPIC_HEADER_LEN {
        return Err(Error::MalformedFrame("shorter than topic header"));
    }

    let topic_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let topic_end = TOPIC_HEADER_LEN + topic_len;
    if frame.len() < topic_end {
        return Err(Error::MalformedFrame("topic length overruns frame"));
    }

    let topic = std::str::from_utf8(&frame[TOPIC_HEADER_LEN..topic_end])
        .map_err(|_| Error::MalformedFrame("topic is not valid UTF-8"))?
        .to_string();
    let payload = frame.slice(topic_end..);

    Ok(Message { topic, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_topic_and_payload() {
        let cases: [(&str, &[u8]); 5] = [
            ("greet", b"hi"),
            ("", b"no topic"),
            ("empty-payload", b""),
            ("", b""),
            ("sensor/temp", &[0, 255, 0, 10, 13]),
        ];

        for (topic, payload) in cases {
            let frame = encode(topic, payload).unwrap();
            assert_eq!(frame.len(), encoded_len(topic, payload));
            let msg = decode(frame).unwrap();
            assert_eq!(msg.topic(), topic);
            assert_eq!(msg.payload(), payload);
        }
    }

    #[test]
    fn layout_is_length_prefixed_topic() {
        let frame = encode("ab", b"xyz").unwrap();
        assert_eq!(&frame[..], &[0, 2, b'a', b'b', b'x', b'y', b'z']);
    }

    #[test]
    fn payload_is_not_inspected() {
        // A payload that itself looks like a header must come back untouched.
        let frame = encode("t", &[0xff, 0xff, 0x00]).unwrap();
        assert_eq!(decode(frame).unwrap().payload(), &[0xff, 0xff, 0x00]);
    }

    #[test]
    fn truncated_frames_are_malformed() {
        assert!(matches!(
            decode(Bytes::from_static(&[])),
            Err(Error::MalformedFrame(_))
        ));
        assert!(matches!(
            decode(Bytes::from_static(&[0])),
            Err(Error::MalformedFrame(_))
        ));
        assert!(matches!(
            decode(Bytes::from_static(&[0, 5, b'a', b'b'])),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn non_utf8_topic_is_malformed() {
        let err = decode(Bytes::from_static(&[0, 2, 0xc3, 0x28])).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame("topic is not valid UTF-8")));
    }

    #[test]
    fn oversized_topic_is_rejected() {
        let topic = "t".repeat(MAX_TOPIC_LEN + 1);
        let err = encode(&topic, b"").unwrap_err();
        assert!(matches!(err, Error::TopicTooLong { .. }));
    }

    #[test]
    fn payload_str_reads_utf8() {
        let msg = Message::new("t", Bytes::from_static(b"{\"x\":1}"));
        assert_eq!(msg.payload_str(), Some("{\"x\":1}"));
        let (topic, payload) = msg.into_parts();
        assert_eq!(topic, "t");
        assert_eq!(&payload[..], b"{\"x\":1}");
    }
}
