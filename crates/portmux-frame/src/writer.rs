use std::io::{ErrorKind, Write};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;

use crate::codec::{encode_frame, ConnectionId, Frame, MAX_FRAME_PAYLOAD, PREAMBLE_SIZE};
use crate::error::{FrameError, Result};

/// Writes complete frames to any `Write` stream.
///
/// Each frame goes out as one buffered write followed by a flush.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Write> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(PREAMBLE_SIZE + MAX_FRAME_PAYLOAD),
        }
    }

    /// Write one frame as-is (blocking).
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.buf.clear();
        encode_frame(frame.connection_id, frame.payload.as_ref(), &mut self.buf)?;
        self.write_buffered()
    }

    /// Send `payload` for a connection.
    ///
    /// Payloads larger than one frame are split into consecutive frames. An
    /// empty payload writes nothing; use [`send_close`](Self::send_close).
    pub fn send(&mut self, connection_id: ConnectionId, payload: &[u8]) -> Result<()> {
        for chunk in payload.chunks(MAX_FRAME_PAYLOAD) {
            self.buf.clear();
            encode_frame(connection_id, chunk, &mut self.buf)?;
            self.write_buffered()?;
        }
        Ok(())
    }

    /// Write the zero-length frame that closes `connection_id`.
    pub fn send_close(&mut self, connection_id: ConnectionId) -> Result<()> {
        self.buf.clear();
        encode_frame(connection_id, &[], &mut self.buf)?;
        self.write_buffered()
    }

    fn write_buffered(&mut self) -> Result<()> {
        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

/// Cloneable, serialized frame sink shared by every connection of a session.
///
/// The lock is held for exactly one frame, so frames from different
/// connections interleave but never tear.
#[derive(Clone)]
pub struct SharedFrameWriter {
    inner: Arc<Mutex<FrameWriter<Box<dyn Write + Send>>>>,
}

impl SharedFrameWriter {
    pub fn new<W: Write + Send + 'static>(sink: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FrameWriter::new(Box::new(sink)))),
        }
    }

    /// Send `payload` for a connection, one locked frame at a time.
    pub fn send(&self, connection_id: ConnectionId, payload: &[u8]) -> Result<()> {
        for chunk in payload.chunks(MAX_FRAME_PAYLOAD) {
            self.lock().send(connection_id, chunk)?;
        }
        Ok(())
    }

    pub fn send_close(&self, connection_id: ConnectionId) -> Result<()> {
        self.lock().send_close(connection_id)
    }

    pub fn write_frame(&self, frame: &Frame) -> Result<()> {
        self.lock().write_frame(frame)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FrameWriter<Box<dyn Write + Send>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SharedFrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFrameWriter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};

    use bytes::BytesMut;

    use super::*;
    use crate::codec::decode_frame;
    use crate::reader::FrameReader;

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut wire = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = decode_frame(&mut wire).unwrap() {
            frames.push(frame);
        }
        assert!(wire.is_empty(), "trailing bytes after last frame");
        frames
    }

    #[test]
    fn write_single_frame() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send(7, b"hello").unwrap();

        let frames = decode_all(&writer.into_inner().into_inner());
        assert_eq!(frames, vec![Frame::new(7, &b"hello"[..])]);
    }

    #[test]
    fn send_close_writes_sentinel() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send_close(3).unwrap();

        assert_eq!(writer.into_inner().into_inner(), vec![3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn empty_send_writes_nothing() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send(1, b"").unwrap();
        assert!(writer.into_inner().into_inner().is_empty());
    }

    #[test]
    fn oversized_payload_is_fragmented() {
        let payload: Vec<u8> = (0..(MAX_FRAME_PAYLOAD * 2 + 10))
            .map(|i| (i % 251) as u8)
            .collect();
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send(4, &payload).unwrap();

        let frames = decode_all(&writer.into_inner().into_inner());
        let sizes: Vec<usize> = frames.iter().map(|f| f.payload.len()).collect();
        assert_eq!(sizes, vec![MAX_FRAME_PAYLOAD, MAX_FRAME_PAYLOAD, 10]);
        assert!(frames.iter().all(|f| f.connection_id == 4));

        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn write_frame_rejects_oversized_frame() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let frame = Frame::new(1, vec![0u8; MAX_FRAME_PAYLOAD + 1]);
        let err = writer.write_frame(&frame).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[test]
    fn flush_propagates() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = FrameWriter::new(sink);

        writer.send(1, b"x").unwrap();

        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn handles_interrupted_and_would_block() {
        let mut writer = FrameWriter::new(FlakyWriter {
            failures: vec![ErrorKind::Interrupted, ErrorKind::WouldBlock],
            data: Vec::new(),
        });
        writer.send(5, b"retry").unwrap();

        let frames = decode_all(&writer.into_inner().data);
        assert_eq!(frames, vec![Frame::new(5, &b"retry"[..])]);
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer.send(1, b"x").unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn shared_writer_never_tears_frames() {
        let sink = Arc::new(Mutex::new(Vec::<u8>::new()));
        let shared = SharedFrameWriter::new(SharedVec(Arc::clone(&sink)));

        let handles: Vec<_> = (1..=4u32)
            .map(|id| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        shared.send(id, &[id as u8; 300]).unwrap();
                    }
                    shared.send_close(id).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let bytes = sink.lock().unwrap().clone();
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let mut closes = 0;
        while let Some(frame) = reader.read_frame().unwrap() {
            if frame.is_close() {
                closes += 1;
            } else {
                assert!(frame.payload.iter().all(|b| *b as u32 == frame.connection_id));
            }
        }
        assert_eq!(closes, 4);
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
        data: Vec<u8>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FlakyWriter {
        failures: Vec<ErrorKind>,
        data: Vec<u8>,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Some(kind) = self.failures.pop() {
                return Err(std::io::Error::from(kind));
            }
            // Short writes exercise the offset loop.
            let n = buf.len().min(3);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct SharedVec(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedVec {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
