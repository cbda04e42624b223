use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use portmux_frame::{ConnectionId, Frame, FrameReader, SharedFrameWriter, MAX_FRAME_PAYLOAD};
use portmux_transport::Duplex;
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionTable, LogicalConnection};
use crate::error::Result;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Produces the real endpoint for a connection id seen for the first time.
///
/// `Ok(None)` means the id is not known here and the frame is dropped.
pub trait ConnectionFactory: Send + Sync {
    fn open(&self, id: ConnectionId) -> Result<Option<Box<dyn Duplex>>>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(ConnectionId) -> Result<Option<Box<dyn Duplex>>> + Send + Sync,
{
    fn open(&self, id: ConnectionId) -> Result<Option<Box<dyn Duplex>>> {
        self(id)
    }
}

/// Factory for sides that only correlate frames with connections they
/// registered themselves; it never creates one.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelateOnly;

impl ConnectionFactory for CorrelateOnly {
    fn open(&self, _id: ConnectionId) -> Result<Option<Box<dyn Duplex>>> {
        Ok(None)
    }
}

/// Why a demux pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxExit {
    /// The inbound stream ended on a frame boundary.
    CarrierClosed,
    /// A stop was requested.
    Stopped,
}

/// Reads frames from the carrier and routes each payload to its connection.
pub struct DemuxPump<R> {
    reader: FrameReader<R>,
    table: ConnectionTable,
    factory: Arc<dyn ConnectionFactory>,
    sink: Option<SharedFrameWriter>,
    stop: Arc<AtomicBool>,
    chunk_size: usize,
}

impl<R: Read> DemuxPump<R> {
    pub fn new(reader: R, table: ConnectionTable, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            reader: FrameReader::new(reader),
            table,
            factory,
            sink: None,
            stop: Arc::new(AtomicBool::new(false)),
            chunk_size: MAX_FRAME_PAYLOAD,
        }
    }

    /// Frame sink for connections the factory creates.
    ///
    /// Without a sink, created connections are write-only and failed opens
    /// are not reported to the far side.
    pub fn with_sink(mut self, sink: SharedFrameWriter) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_FRAME_PAYLOAD);
        self
    }

    /// Run until the carrier ends, a stop is requested or the stream breaks.
    ///
    /// Errors (protocol violations, carrier I/O) are fatal to the session.
    /// Failures of a single connection never end the pump.
    pub fn run(mut self) -> Result<DemuxExit> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(DemuxExit::Stopped);
            }
            let frame = match self.reader.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) if self.stop.load(Ordering::SeqCst) => return Ok(DemuxExit::Stopped),
                Ok(None) => return Ok(DemuxExit::CarrierClosed),
                Err(_) if self.stop.load(Ordering::SeqCst) => return Ok(DemuxExit::Stopped),
                Err(err) => return Err(err.into()),
            };
            self.dispatch(frame);
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        let id = frame.connection_id;
        if frame.is_close() {
            if !self.table.close_remote(id) {
                trace!(connection_id = id, "close for unknown connection ignored");
            }
            return;
        }

        let connection = match self.table.get(id) {
            Some(connection) => connection,
            // Closed here while the far side was still sending.
            None if self.table.is_retired(id) => {
                trace!(connection_id = id, "frame for closed connection dropped");
                return;
            }
            None => match self.open(id) {
                Some(connection) => connection,
                None => return,
            },
        };

        if let Err(err) = connection.write(&frame.payload) {
            debug!(connection_id = id, error = %err, "endpoint write failed");
            self.table.retire(id);
        }
    }

    fn open(&mut self, id: ConnectionId) -> Option<Arc<LogicalConnection>> {
        let endpoint = match self.factory.open(id) {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                debug!(connection_id = id, "frame for unknown connection dropped");
                return None;
            }
            Err(err) => {
                warn!(connection_id = id, error = %err, "failed to open connection");
                self.refuse(id);
                return None;
            }
        };

        let started = match &self.sink {
            Some(sink) => LogicalConnection::start(
                id,
                endpoint,
                sink.clone(),
                self.table.clone(),
                self.chunk_size,
            ),
            None => LogicalConnection::detached(id, endpoint).map(|connection| {
                self.table.insert(Arc::clone(&connection));
                connection
            }),
        };
        match started {
            Ok(connection) => {
                debug!(connection_id = id, "connection opened");
                Some(connection)
            }
            Err(err) => {
                warn!(connection_id = id, error = %err, "failed to start connection");
                self.refuse(id);
                None
            }
        }
    }

    /// Drop further frames for `id` and tell the far side it is closed.
    fn refuse(&mut self, id: ConnectionId) {
        self.table.refuse(id);
        if let Some(sink) = &self.sink {
            if let Err(err) = sink.send_close(id) {
                debug!(connection_id = id, error = %err, "could not report refused connection");
            }
        }
    }
}

/// Reads a connection's real endpoint and frames the bytes onto the carrier.
pub struct MuxPump {
    connection: Arc<LogicalConnection>,
    reader: Box<dyn Duplex>,
    sink: SharedFrameWriter,
    table: ConnectionTable,
    chunk_size: usize,
}

impl MuxPump {
    pub fn new(
        connection: Arc<LogicalConnection>,
        reader: Box<dyn Duplex>,
        sink: SharedFrameWriter,
        table: ConnectionTable,
    ) -> Self {
        Self {
            connection,
            reader,
            sink,
            table,
            chunk_size: MAX_FRAME_PAYLOAD,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_FRAME_PAYLOAD);
        self
    }

    /// Pump until the endpoint ends, then close the connection.
    ///
    /// The far side is sent a close frame unless it closed the connection
    /// itself or the carrier is already broken.
    pub fn run(mut self) {
        let id = self.connection.id();
        let mut buf = vec![0u8; self.chunk_size];
        let mut sink_ok = true;
        let mut sent: u64 = 0;

        loop {
            let n = match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    if !self.connection.is_closed() {
                        debug!(connection_id = id, error = %err, "endpoint read failed");
                    }
                    break;
                }
            };
            if let Err(err) = self.sink.send(id, &buf[..n]) {
                debug!(connection_id = id, error = %err, "carrier sink failed");
                sink_ok = false;
                break;
            }
            sent += n as u64;
        }

        if sink_ok && !self.connection.is_remote_closed() {
            if let Err(err) = self.sink.send_close(id) {
                debug!(connection_id = id, error = %err, "could not send close frame");
            }
        }
        self.table.retire(id);
        self.connection.close();
        debug!(connection_id = id, bytes = sent, "mux pump finished");
    }
}

/// Copies one byte stream into another until EOF.
pub struct CopyPump<R, W> {
    name: &'static str,
    reader: R,
    writer: W,
    stop: Option<Arc<AtomicBool>>,
    buffer_size: usize,
}

impl<R: Read, W: Write> CopyPump<R, W> {
    pub fn new(name: &'static str, reader: R, writer: W) -> Self {
        Self {
            name,
            reader,
            writer,
            stop: None,
            buffer_size: COPY_BUFFER_SIZE,
        }
    }

    /// End the copy before the next read once `stop` is set.
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Copy until the reader ends, returning the number of bytes moved.
    pub fn run(mut self) -> io::Result<u64> {
        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0u64;
        loop {
            if self.stopped() {
                break;
            }
            let n = match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            self.writer.write_all(&buf[..n])?;
            self.writer.flush()?;
            total += n as u64;
        }
        trace!(pump = self.name, bytes = total, "copy pump finished");
        Ok(total)
    }

    fn stopped(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|stop| stop.load(Ordering::SeqCst))
    }
}
