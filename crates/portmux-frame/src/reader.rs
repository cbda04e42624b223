use std::io::{ErrorKind, Read};

use bytes::BytesMut;

use crate::codec::{decode_frame, Frame, PREAMBLE_SIZE};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete frames.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Read> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Ok(None)` when the stream ends on a frame boundary. Ending
    /// inside a preamble or payload is a [`FrameError::ProtocolViolation`].
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf)? {
                return Ok(Some(frame));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return match self.buf.len() {
                    0 => Ok(None),
                    n if n < PREAMBLE_SIZE => Err(FrameError::ProtocolViolation(format!(
                        "stream ended after {n} of {PREAMBLE_SIZE} preamble bytes"
                    ))),
                    n => Err(FrameError::ProtocolViolation(format!(
                        "stream ended inside a frame payload ({} bytes buffered)",
                        n - PREAMBLE_SIZE
                    ))),
                };
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Bytes read from the stream but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read> Iterator for FrameReader<T> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_frame().transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;

    use super::*;
    use crate::codec::encode_frame;

    fn wire(frames: &[(u32, &str)]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (id, payload) in frames {
            encode_frame(*id, payload.as_bytes(), &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn read_single_frame() {
        let mut reader = FrameReader::new(Cursor::new(wire(&[(7, "hello")])));
        let frame = reader.read_frame().unwrap().unwrap();

        assert_eq!(frame.connection_id, 7);
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn read_interleaved_frames_in_order() {
        let data = wire(&[(1, "a"), (1, "b"), (2, "x"), (1, "c"), (1, "")]);
        let frames: Vec<Frame> = FrameReader::new(Cursor::new(data))
            .collect::<Result<_>>()
            .unwrap();

        let ids: Vec<u32> = frames.iter().map(|f| f.connection_id).collect();
        assert_eq!(ids, vec![1, 1, 2, 1, 1]);
        assert!(frames[4].is_close());
    }

    #[test]
    fn eof_on_boundary_is_clean() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()));
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn eof_inside_preamble_is_violation() {
        let mut reader = FrameReader::new(Cursor::new(vec![1, 0, 0]));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ProtocolViolation(_)));
    }

    #[test]
    fn truncated_payload_is_violation() {
        // Preamble announces 10 bytes, only 4 follow.
        let mut data = vec![9, 0, 0, 0, 10, 0];
        data.extend_from_slice(b"shor");
        let mut reader = FrameReader::new(Cursor::new(data));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ProtocolViolation(_)));
    }

    #[test]
    fn byte_at_a_time_reads_assemble_frames() {
        let data = wire(&[(5, "slow"), (6, "drip")]);
        let mut reader = FrameReader::new(OneByteReader { data, pos: 0 });

        let f1 = reader.read_frame().unwrap().unwrap();
        let f2 = reader.read_frame().unwrap().unwrap();
        assert_eq!((f1.connection_id, f1.payload.as_ref()), (5, b"slow".as_ref()));
        assert_eq!((f2.connection_id, f2.payload.as_ref()), (6, b"drip".as_ref()));
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn interrupted_reads_are_retried() {
        let data = wire(&[(2, "again")]);
        let mut reader = FrameReader::new(InterruptOnce {
            inner: Cursor::new(data),
            interrupted: false,
        });
        let frame = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"again");
    }

    #[test]
    fn io_errors_propagate() {
        let mut reader = FrameReader::new(FailingReader);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    struct OneByteReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for OneByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.data.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptOnce {
        inner: Cursor<Vec<u8>>,
        interrupted: bool,
    }

    impl Read for InterruptOnce {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.inner.read(buf)
        }
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::ConnectionReset))
        }
    }
}
