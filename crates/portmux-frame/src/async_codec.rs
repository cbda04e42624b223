use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, Frame};
use crate::error::FrameError;

/// `tokio_util` codec for the multiplexing frame format.
///
/// Same wire format as [`FrameReader`](crate::FrameReader) and
/// [`FrameWriter`](crate::FrameWriter). Frames larger than
/// [`MAX_FRAME_PAYLOAD`](crate::MAX_FRAME_PAYLOAD) are rejected rather than
/// split.
#[derive(Debug, Default, Clone, Copy)]
pub struct MuxCodec;

impl Decoder for MuxCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        decode_frame(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match decode_frame(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ProtocolViolation(format!(
                "stream ended with {} bytes of an incomplete frame",
                src.len()
            ))),
        }
    }
}

impl Encoder<Frame> for MuxCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_frame(frame.connection_id, frame.payload.as_ref(), dst)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;

    #[tokio::test]
    async fn framed_roundtrip_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut sink = FramedWrite::new(client, MuxCodec);
        let mut stream = FramedRead::new(server, MuxCodec);

        sink.send(Frame::new(7, &b"hello"[..])).await.unwrap();
        sink.send(Frame::close(7)).await.unwrap();
        drop(sink);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, Frame::new(7, &b"hello"[..]));
        let second = stream.next().await.unwrap().unwrap();
        assert!(second.is_close());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn truncated_stream_is_a_violation() {
        let (mut client, server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[1, 0, 0, 0, 9, 0, b'x'])
            .await
            .unwrap();
        drop(client);

        let mut stream = FramedRead::new(server, MuxCodec);
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, FrameError::ProtocolViolation(_)));
    }

    #[test]
    fn decode_matches_blocking_codec() {
        let mut wire = BytesMut::new();
        encode_frame(42, b"same bytes", &mut wire).unwrap();

        let frame = MuxCodec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.connection_id, 42);
        assert_eq!(frame.payload.as_ref(), b"same bytes");
    }
}
