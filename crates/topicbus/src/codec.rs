//! Stream codec for frame bodies.
//!
//! Uses LengthDelimitedCodec (u32 big-endian prefix) for framing. Bodies are
//! opaque here; topic parsing happens in `frame::decode` on the consumer side
//! so a malformed body costs one message, not the connection.
//! Works over any AsyncRead/AsyncWrite (Unix sockets, TCP, in-memory duplex).

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::config::DEFAULT_MAX_FRAME_LEN;

const LARGE_FRAME_BYTES: usize = 1024 * 1024;

pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_len)
                .new_codec(),
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.inner.max_frame_length()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode(src)?.map(BytesMut::freeze))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame_len = frame.len();
        tracing::trace!(frame_size_bytes = frame_len, "Encoding frame");
        if frame_len > LARGE_FRAME_BYTES {
            tracing::debug!(
                frame_size_bytes = frame_len,
                frame_size_kb = frame_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(frame, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn codec_roundtrip_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();

        let body = frame::encode("greet", b"hi").unwrap();
        codec.encode(body.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..4], &(body.len() as u32).to_be_bytes());

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, body);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_input_waits_for_more() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"\x00\x01tpayload"), &mut buf)
            .unwrap();

        let mut head = buf.split_to(6);
        assert!(codec.decode(&mut head).unwrap().is_none());
        head.unsplit(buf);
        assert!(codec.decode(&mut head).unwrap().is_some());
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut codec = FrameCodec::new(8);
        assert_eq!(codec.max_frame_len(), 8);
        assert_eq!(FrameCodec::default().max_frame_len(), DEFAULT_MAX_FRAME_LEN);
        let mut buf = BytesMut::new();
        assert!(codec.encode(Bytes::from_static(&[0u8; 9]), &mut buf).is_err());

        let mut wire = BytesMut::from(&[0u8, 0, 0, 9][..]);
        wire.extend_from_slice(&[0u8; 9]);
        assert!(FrameCodec::new(8).decode(&mut wire).is_err());
    }

    #[tokio::test]
    async fn frames_survive_a_stream_in_order() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, FrameCodec::default());
        let mut reader = FramedRead::new(server, FrameCodec::default());

        let sender = tokio::spawn(async move {
            for i in 0..20u8 {
                let body = frame::encode("seq", &[i; 16]).unwrap();
                writer.send(body).await.unwrap();
            }
        });

        for i in 0..20u8 {
            let body = reader.next().await.unwrap().unwrap();
            let msg = frame::decode(body).unwrap();
            assert_eq!(msg.payload(), &[i; 16]);
        }
        sender.await.unwrap();
    }
}
