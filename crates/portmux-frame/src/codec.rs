use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame preamble: connection id (4) + length (2) = 6 bytes.
pub const PREAMBLE_SIZE: usize = 6;

/// Largest payload a single frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Identifier of a logical connection within one carrier.
pub type ConnectionId = u32;

/// One chunk of a logical connection.
///
/// An empty payload is the close sentinel for `connection_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The logical connection this chunk belongs to.
    pub connection_id: ConnectionId,
    /// The chunk bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(connection_id: ConnectionId, payload: impl Into<Bytes>) -> Self {
        Self {
            connection_id,
            payload: payload.into(),
        }
    }

    /// The zero-length frame that closes `connection_id`.
    pub fn close(connection_id: ConnectionId) -> Self {
        Self::new(connection_id, Bytes::new())
    }

    pub fn is_close(&self) -> bool {
        self.payload.is_empty()
    }

    /// The total wire size of this frame (preamble + payload).
    pub fn wire_size(&self) -> usize {
        PREAMBLE_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────────┬───────────┬─────────────────┐
/// │ Connection id  │ Length    │ Payload         │
/// │ (4B LE)        │ (2B LE)   │ (Length bytes)  │
/// └────────────────┴───────────┴─────────────────┘
/// ```
pub fn encode_frame(connection_id: ConnectionId, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }
    dst.reserve(PREAMBLE_SIZE + payload.len());
    dst.put_u32_le(connection_id);
    dst.put_u16_le(payload.len() as u16);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>> {
    if src.len() < PREAMBLE_SIZE {
        return Ok(None);
    }

    let mut preamble = &src[..PREAMBLE_SIZE];
    let connection_id = preamble.get_u32_le();
    let payload_len = preamble.get_u16_le() as usize;

    let total = PREAMBLE_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(PREAMBLE_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        connection_id,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        encode_frame(7, b"hello", &mut buf).unwrap();

        assert_eq!(buf.len(), PREAMBLE_SIZE + 5);
        assert_eq!(&buf[..PREAMBLE_SIZE], &[7, 0, 0, 0, 5, 0]);

        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::new(7, &b"hello"[..]));
        assert!(buf.is_empty());
    }

    #[test]
    fn close_sentinel_is_six_bytes() {
        let mut buf = BytesMut::new();
        encode_frame(3, b"", &mut buf).unwrap();
        assert_eq!(buf.as_ref(), &[3, 0, 0, 0, 0, 0]);

        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.connection_id, 3);
        assert!(frame.is_close());
        assert_eq!(frame, Frame::close(3));
    }

    #[test]
    fn decode_incomplete_preamble() {
        let mut buf = BytesMut::from(&[1, 0, 0][..]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(1, b"hello", &mut buf).unwrap();
        buf.truncate(PREAMBLE_SIZE + 2);

        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn payload_over_limit_rejected() {
        let mut buf = BytesMut::new();
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        let err = encode_frame(1, &payload, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn largest_payload_fits() {
        let mut buf = BytesMut::new();
        let payload = vec![0xAB; MAX_FRAME_PAYLOAD];
        encode_frame(u32::MAX, &payload, &mut buf).unwrap();

        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.connection_id, u32::MAX);
        assert_eq!(frame.payload.len(), MAX_FRAME_PAYLOAD);
    }

    #[test]
    fn multiple_frames() {
        let mut buf = BytesMut::new();
        encode_frame(1, b"first", &mut buf).unwrap();
        encode_frame(2, b"second", &mut buf).unwrap();

        let f1 = decode_frame(&mut buf).unwrap().unwrap();
        let f2 = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!((f1.connection_id, f1.payload.as_ref()), (1, b"first".as_ref()));
        assert_eq!((f2.connection_id, f2.payload.as_ref()), (2, b"second".as_ref()));
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_wire_size() {
        let frame = Frame::new(1, Bytes::from_static(b"test"));
        assert_eq!(frame.wire_size(), PREAMBLE_SIZE + 4);
    }
}
