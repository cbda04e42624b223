use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use tracing::trace;

use crate::error::QueueError;
use crate::queue::HandoffQueue;
use crate::throttle::Throttle;

/// Configuration for a [`QueueStream`].
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    /// Bound on chunks written but not yet read. `None` is unbounded.
    pub throttle_capacity: Option<usize>,
    /// When set, a read keeps collecting chunks that arrive within this delay.
    pub nagle_delay: Option<Duration>,
    /// Read timeout. `None` blocks indefinitely.
    pub read_timeout: Option<Duration>,
    /// How long a throttled write may wait for a permit. `None` blocks
    /// indefinitely.
    pub write_timeout: Option<Duration>,
}

struct ReadState {
    current: Bytes,
    finished: bool,
}

struct Shared {
    queue: HandoffQueue<Bytes>,
    throttle: Option<Arc<Throttle>>,
    config: StreamConfig,
    read_state: Mutex<ReadState>,
    end_of_stream: AtomicBool,
}

/// In-process byte stream backed by a [`HandoffQueue`] of chunks.
///
/// Every `write` becomes one owned chunk; `read` copies out of the current
/// chunk and keeps the remainder for the next call. Clones share the same
/// stream, so one side can write while another reads.
#[derive(Clone)]
pub struct QueueStream {
    shared: Arc<Shared>,
}

impl Default for QueueStream {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueStream {
    /// Unthrottled stream without nagling.
    pub fn new() -> Self {
        Self::with_config(StreamConfig::default())
    }

    /// Stream that allows at most `capacity` unread chunks.
    pub fn throttled(capacity: usize) -> Self {
        Self::with_config(StreamConfig {
            throttle_capacity: Some(capacity),
            ..StreamConfig::default()
        })
    }

    pub fn with_config(config: StreamConfig) -> Self {
        let throttle = config
            .throttle_capacity
            .map(|capacity| Arc::new(Throttle::new(capacity)));
        Self {
            shared: Arc::new(Shared {
                queue: HandoffQueue::new(),
                throttle,
                config,
                read_state: Mutex::new(ReadState {
                    current: Bytes::new(),
                    finished: false,
                }),
                end_of_stream: AtomicBool::new(false),
            }),
        }
    }

    /// Read into `buf`.
    ///
    /// Blocks for the first chunk, then coalesces further chunks into the same
    /// read: those already queued, or with nagling those arriving within the
    /// delay. Returns 0 once the stream has ended and is drained.
    pub fn read_chunked(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self
            .shared
            .read_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.finished {
            return Ok(0);
        }

        if state.current.is_empty() {
            match self.shared.queue.dequeue(self.shared.config.read_timeout) {
                Ok(Some(chunk)) => state.current = chunk,
                Ok(None) => {
                    state.finished = true;
                    return Ok(0);
                }
                Err(err) => return Err(err.into()),
            }
        }

        let mut filled = copy_out(&mut state.current, buf);
        let deadline = self.shared.config.nagle_delay.map(|d| Instant::now() + d);
        while filled < buf.len() {
            let next = match deadline {
                None => self.shared.queue.try_dequeue(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.shared.queue.try_dequeue()
                    } else {
                        self.shared.queue.dequeue(Some(deadline - now)).ok().flatten()
                    }
                }
            };
            match next {
                Some(chunk) => {
                    state.current = chunk;
                    filled += copy_out(&mut state.current, &mut buf[filled..]);
                }
                None => break,
            }
        }
        Ok(filled)
    }

    /// Enqueue a copy of `buf` as one chunk.
    ///
    /// Throttled streams wait for a permit first; the permit is returned when
    /// a reader takes the chunk.
    pub fn write_chunk(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.is_end_of_stream() {
            return Err(broken_pipe());
        }
        let chunk = Bytes::copy_from_slice(buf);
        let enqueued = match &self.shared.throttle {
            Some(throttle) => {
                throttle
                    .acquire(self.shared.config.write_timeout)
                    .map_err(io::Error::from)?;
                let permit = Arc::clone(throttle);
                self.shared
                    .queue
                    .enqueue_with_callback(chunk, move || permit.release())
            }
            None => self.shared.queue.enqueue_and_dispatch(chunk),
        };
        enqueued.map_err(|_| broken_pipe())?;
        Ok(buf.len())
    }

    /// No more writes; readers drain what is buffered and then see EOF.
    pub fn set_end_of_stream(&self) {
        if !self.shared.end_of_stream.swap(true, Ordering::SeqCst) {
            trace!(pending = self.pending_chunks(), "queue stream end of stream");
            self.shared.queue.shutdown();
        }
    }

    /// End the stream and release everything blocked on it.
    ///
    /// Buffered chunks are discarded. Idempotent.
    pub fn close(&self) {
        self.set_end_of_stream();
        self.shared.queue.close();
        if let Some(throttle) = &self.shared.throttle {
            throttle.close();
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.shared.end_of_stream.load(Ordering::SeqCst)
    }

    /// Chunks written but not yet taken by a reader.
    pub fn pending_chunks(&self) -> usize {
        self.shared.queue.pending_count()
    }

    /// Free throttle permits, if throttled.
    pub fn available_permits(&self) -> Option<usize> {
        self.shared.throttle.as_ref().map(|t| t.available())
    }

    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }
}

fn copy_out(chunk: &mut Bytes, buf: &mut [u8]) -> usize {
    let n = chunk.len().min(buf.len());
    buf[..n].copy_from_slice(&chunk[..n]);
    chunk.advance(n);
    n
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, QueueError::Closed)
}

impl Read for QueueStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunked(buf)
    }
}

impl Read for &QueueStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunked(buf)
    }
}

impl Write for QueueStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_chunk(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &QueueStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_chunk(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for QueueStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStream")
            .field("pending", &self.pending_chunks())
            .field("end_of_stream", &self.is_end_of_stream())
            .field("throttle", &self.shared.config.throttle_capacity)
            .finish()
    }
}
