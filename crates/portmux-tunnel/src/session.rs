use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use portmux_frame::{ConnectionId, FrameError, SharedFrameWriter, MAX_FRAME_PAYLOAD};
use portmux_queue::{QueueStream, StreamConfig};
use portmux_transport::Duplex;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionTable, LogicalConnection};
use crate::error::{Result, TunnelError};
use crate::pump::{ConnectionFactory, CopyPump, DemuxExit, DemuxPump};

/// Outbound chunks a TCP session may queue before connection pumps block.
pub const TCP_THROTTLE_CAPACITY: usize = 5;

/// Outbound chunks a pipe session may queue before connection pumps block.
pub const PIPE_THROTTLE_CAPACITY: usize = 10;

/// Carrier reads buffered ahead of the demux pump.
pub const INBOUND_CAPACITY: usize = 4;

/// Per-session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Outbound chunks written but not yet sent on the carrier.
    pub throttle_capacity: usize,
    /// Carrier reads buffered ahead of the demux pump. Once full the carrier
    /// is not read, so a slow endpoint pushes back on the far side.
    pub inbound_capacity: usize,
    /// Coalesce outbound chunks arriving within this delay into one carrier
    /// write.
    pub nagle_delay: Option<Duration>,
    /// Largest payload a connection pump reads (and frames) at once.
    pub chunk_size: usize,
    pub carrier_read_timeout: Option<Duration>,
    pub carrier_write_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn for_tcp() -> Self {
        Self {
            throttle_capacity: TCP_THROTTLE_CAPACITY,
            inbound_capacity: INBOUND_CAPACITY,
            nagle_delay: None,
            chunk_size: MAX_FRAME_PAYLOAD,
            carrier_read_timeout: None,
            carrier_write_timeout: None,
        }
    }

    pub fn for_pipes() -> Self {
        Self {
            throttle_capacity: PIPE_THROTTLE_CAPACITY,
            ..Self::for_tcp()
        }
    }

    pub fn with_throttle_capacity(mut self, capacity: usize) -> Self {
        self.throttle_capacity = capacity.max(1);
        self
    }

    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }

    pub fn with_nagle_delay(mut self, delay: Option<Duration>) -> Self {
        self.nagle_delay = delay;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_FRAME_PAYLOAD);
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::for_tcp()
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// The far side closed the carrier cleanly.
    CarrierClosed,
    /// [`Session::close`] was called.
    Stopped,
    /// The carrier carried something that is not a frame stream.
    ProtocolViolation(String),
    /// Reading or writing the carrier failed.
    CarrierError(String),
}

impl std::fmt::Display for SessionExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CarrierClosed => write!(f, "carrier closed"),
            Self::Stopped => write!(f, "stopped"),
            Self::ProtocolViolation(detail) => write!(f, "protocol violation: {detail}"),
            Self::CarrierError(detail) => write!(f, "carrier error: {detail}"),
        }
    }
}

#[derive(Default)]
struct ExitState {
    reason: Option<SessionExit>,
    finished: bool,
}

struct SessionInner {
    name: String,
    carrier: Mutex<Box<dyn Duplex>>,
    table: ConnectionTable,
    inbound: QueueStream,
    outbound: QueueStream,
    sink: SharedFrameWriter,
    next_id: AtomicU32,
    stop: Arc<AtomicBool>,
    closed: AtomicBool,
    exit: Mutex<ExitState>,
    exited: Condvar,
    config: SessionConfig,
}

/// One carrier with its pumps and logical connections.
///
/// Three threads serve a session: `carrier-in` copies the carrier into the
/// bounded inbound stream, `demux` routes inbound frames to connections, and
/// `carrier-out` drains the throttled outbound stream onto the carrier. Any
/// carrier failure closes the whole session. Clones share the session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start serving `carrier`.
    ///
    /// `factory` is asked for an endpoint whenever a frame arrives for an id
    /// the session does not know.
    pub fn start(
        name: impl Into<String>,
        carrier: Box<dyn Duplex>,
        factory: Arc<dyn ConnectionFactory>,
        config: SessionConfig,
    ) -> Result<Self> {
        let name = name.into();
        carrier.set_read_timeout(config.carrier_read_timeout)?;
        carrier.set_write_timeout(config.carrier_write_timeout)?;
        let carrier_reader = carrier.try_clone_duplex()?;
        let carrier_writer = carrier.try_clone_duplex()?;

        let outbound = QueueStream::with_config(StreamConfig {
            throttle_capacity: Some(config.throttle_capacity.max(1)),
            nagle_delay: config.nagle_delay,
            ..StreamConfig::default()
        });
        let inbound = QueueStream::throttled(config.inbound_capacity.max(1));

        let inner = Arc::new(SessionInner {
            sink: SharedFrameWriter::new(outbound.clone()),
            name,
            carrier: Mutex::new(carrier),
            table: ConnectionTable::new(),
            inbound,
            outbound,
            next_id: AtomicU32::new(1),
            stop: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            exit: Mutex::new(ExitState::default()),
            exited: Condvar::new(),
            config,
        });

        let session = Self { inner };
        if let Err(err) = session.spawn_pumps(carrier_reader, carrier_writer, factory) {
            session.inner.close();
            return Err(err.into());
        }
        info!(session = %session.inner.name, "session started");
        Ok(session)
    }

    fn spawn_pumps(
        &self,
        carrier_reader: Box<dyn Duplex>,
        mut carrier_writer: Box<dyn Duplex>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> io::Result<()> {
        let inner = Arc::clone(&self.inner);
        std::thread::Builder::new()
            .name("carrier-in".into())
            .spawn(move || {
                let copied = CopyPump::new("carrier-in", carrier_reader, inner.inbound.clone())
                    .with_stop(Arc::clone(&inner.stop))
                    .run();
                if let Err(err) = copied {
                    if !inner.is_stopping() {
                        inner.record(SessionExit::CarrierError(err.to_string()));
                    }
                }
                // Let the demux drain what already arrived.
                inner.inbound.set_end_of_stream();
            })?;

        let inner = Arc::clone(&self.inner);
        std::thread::Builder::new()
            .name("demux".into())
            .spawn(move || {
                let pump = DemuxPump::new(inner.inbound.clone(), inner.table.clone(), factory)
                    .with_sink(inner.sink.clone())
                    .with_stop(Arc::clone(&inner.stop))
                    .with_chunk_size(inner.config.chunk_size);
                let exit = match pump.run() {
                    Ok(DemuxExit::CarrierClosed) => SessionExit::CarrierClosed,
                    Ok(DemuxExit::Stopped) => SessionExit::Stopped,
                    Err(TunnelError::Frame(FrameError::ProtocolViolation(detail))) => {
                        SessionExit::ProtocolViolation(detail)
                    }
                    Err(err) => SessionExit::CarrierError(err.to_string()),
                };
                inner.record(exit);
                inner.close();
            })?;

        let inner = Arc::clone(&self.inner);
        std::thread::Builder::new()
            .name("carrier-out".into())
            .spawn(move || {
                let copied =
                    CopyPump::new("carrier-out", inner.outbound.clone(), &mut carrier_writer).run();
                match copied {
                    // Outbound drained after finish(): tell the peer we are done writing.
                    Ok(_) if !inner.is_stopping() => {
                        if let Err(err) = carrier_writer.shutdown_write() {
                            debug!(session = %inner.name, error = %err, "carrier half-close failed");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if !inner.is_stopping() {
                            inner.record(SessionExit::CarrierError(err.to_string()));
                            inner.close();
                        }
                    }
                }
            })?;
        Ok(())
    }

    /// Register a locally accepted endpoint as a new logical connection.
    ///
    /// Ids start at 1 and are never reused within the session.
    pub fn open_connection(&self, endpoint: Box<dyn Duplex>) -> Result<ConnectionId> {
        let inner = &self.inner;
        if inner.is_stopping() {
            return Err(TunnelError::SessionClosed);
        }
        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        LogicalConnection::start(
            id,
            endpoint,
            inner.sink.clone(),
            inner.table.clone(),
            inner.config.chunk_size,
        )?;
        // A close racing the insert may have missed this entry.
        if inner.is_stopping() {
            inner.table.teardown(id);
            return Err(TunnelError::SessionClosed);
        }
        debug!(session = %inner.name, connection_id = id, "connection opened");
        Ok(id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.inner.table
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_stopping()
    }

    /// Stop the pumps, close the carrier and every connection. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Send what is already queued, then half-close the carrier.
    ///
    /// Frames written after this fail. The session ends once the peer closes
    /// its side, and reports [`SessionExit::Stopped`].
    pub fn finish(&self) {
        if self.inner.is_stopping() {
            return;
        }
        self.inner.record(SessionExit::Stopped);
        debug!(session = %self.inner.name, pending = self.inner.outbound.pending_chunks(), "session finishing");
        self.inner.outbound.set_end_of_stream();
    }

    /// Wait for the session to finish closing. Returns `false` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.inner.lock_exit();
        while !state.finished {
            state = match deadline {
                None => self
                    .inner
                    .exited
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.inner
                        .exited
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        true
    }

    /// Why the session ended, once it has.
    pub fn exit(&self) -> Option<SessionExit> {
        let state = self.inner.lock_exit();
        if state.finished {
            state.reason.clone()
        } else {
            None
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.name)
            .field("connections", &self.connection_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    fn is_stopping(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_exit(&self) -> MutexGuard<'_, ExitState> {
        self.exit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep the first reason only.
    fn record(&self, exit: SessionExit) {
        let mut state = self.lock_exit();
        if state.reason.is_none() {
            state.reason = Some(exit);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        // Pumps unblocked below record their own reason; an explicit close
        // must win over those.
        self.record(SessionExit::Stopped);
        self.inbound.close();
        self.outbound.close();
        {
            let carrier = self.carrier.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = carrier.close() {
                debug!(session = %self.name, error = %err, "carrier already shut down");
            }
        }
        let dropped = self.table.drain();

        let mut state = self.lock_exit();
        let reason = state.reason.get_or_insert(SessionExit::Stopped).clone();
        state.finished = true;
        drop(state);
        self.exited.notify_all();

        match &reason {
            SessionExit::CarrierClosed | SessionExit::Stopped => {
                info!(session = %self.name, connections = dropped, reason = %reason, "session closed");
            }
            _ => {
                warn!(session = %self.name, connections = dropped, reason = %reason, "session failed");
            }
        }
    }
}
