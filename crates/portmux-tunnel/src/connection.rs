use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use portmux_frame::{ConnectionId, SharedFrameWriter};
use portmux_transport::Duplex;
use tracing::{debug, trace};

use crate::error::Result;
use crate::pump::MuxPump;

/// One proxied connection inside a session.
///
/// Holds the real endpoint the connection's bytes are delivered to. When
/// started with a sink, a mux pump thread reads the endpoint and frames what
/// it reads onto the carrier.
pub struct LogicalConnection {
    id: ConnectionId,
    writer: Mutex<Box<dyn Duplex>>,
    control: Mutex<Box<dyn Duplex>>,
    closed: AtomicBool,
    remote_closed: AtomicBool,
}

impl LogicalConnection {
    /// Register `endpoint` as connection `id` and start its mux pump.
    ///
    /// The connection is in `table` before the pump runs, so frames arriving
    /// for `id` are never mistaken for a new connection.
    pub fn start(
        id: ConnectionId,
        endpoint: Box<dyn Duplex>,
        sink: SharedFrameWriter,
        table: ConnectionTable,
        chunk_size: usize,
    ) -> Result<Arc<Self>> {
        let reader = endpoint.try_clone_duplex()?;
        let connection = Self::new(id, endpoint)?;
        table.insert(Arc::clone(&connection));

        let pump = MuxPump::new(Arc::clone(&connection), reader, sink, table.clone())
            .with_chunk_size(chunk_size);
        let spawned = std::thread::Builder::new()
            .name(format!("mux-{id}"))
            .spawn(move || pump.run());
        if let Err(err) = spawned {
            table.teardown(id);
            return Err(err.into());
        }

        debug!(connection_id = id, "logical connection started");
        Ok(connection)
    }

    /// A write-only connection without an outbound pump.
    pub fn detached(id: ConnectionId, endpoint: Box<dyn Duplex>) -> Result<Arc<Self>> {
        Self::new(id, endpoint)
    }

    fn new(id: ConnectionId, endpoint: Box<dyn Duplex>) -> Result<Arc<Self>> {
        let control = endpoint.try_clone_duplex()?;
        Ok(Arc::new(Self {
            id,
            writer: Mutex::new(endpoint),
            control: Mutex::new(control),
            closed: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Deliver a payload to the real endpoint.
    pub fn write(&self, payload: &[u8]) -> std::io::Result<()> {
        if self.is_closed() {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(payload)?;
        writer.flush()
    }

    /// Shut the endpoint down in both directions. Idempotent.
    ///
    /// A pump blocked reading the endpoint sees EOF afterwards.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = control.close() {
            trace!(connection_id = self.id, error = %err, "endpoint already shut down");
        }
    }

    /// Record that the far side closed this connection, so no close frame is
    /// sent back for it.
    pub fn mark_remote_closed(&self) {
        self.remote_closed.store(true, Ordering::SeqCst);
    }

    pub fn is_remote_closed(&self) -> bool {
        self.remote_closed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("remote_closed", &self.is_remote_closed())
            .finish_non_exhaustive()
    }
}

/// Correlation table of a session: connection id to logical connection.
///
/// Besides the live connections it remembers ids this side closed (or
/// refused) whose close the far side has not confirmed yet. Frames still in
/// flight for such an id are stale and must not open a new connection.
///
/// Clones share the table. The lock is held only for lookup, insert and
/// remove; endpoints are closed outside it.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<Mutex<TableState>>,
}

#[derive(Default)]
struct TableState {
    live: HashMap<ConnectionId, Arc<LogicalConnection>>,
    retired: HashSet<ConnectionId>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection, returning any entry it replaced.
    pub fn insert(&self, connection: Arc<LogicalConnection>) -> Option<Arc<LogicalConnection>> {
        let mut state = self.lock();
        state.retired.remove(&connection.id());
        state.live.insert(connection.id(), connection)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<LogicalConnection>> {
        self.lock().live.get(&id).cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().live.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }

    /// Ids of the live connections, ascending.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.lock().live.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remove without closing.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<LogicalConnection>> {
        self.lock().live.remove(&id)
    }

    /// Remove `id` and close its endpoint.
    ///
    /// Returns whether an entry was removed.
    pub fn teardown(&self, id: ConnectionId) -> bool {
        let removed = self.remove(id);
        Self::close_removed(id, removed)
    }

    /// Tear down a connection this side is closing.
    ///
    /// Unless the far side already closed it, the id stays retired until
    /// [`close_remote`](Self::close_remote) sees the far side's close.
    pub fn retire(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut state = self.lock();
            let removed = state.live.remove(&id);
            if removed
                .as_ref()
                .is_some_and(|connection| !connection.is_remote_closed())
            {
                state.retired.insert(id);
            }
            removed
        };
        Self::close_removed(id, removed)
    }

    /// Retire an id that never got a connection.
    pub fn refuse(&self, id: ConnectionId) {
        self.lock().retired.insert(id);
    }

    /// Whether frames for `id` are stale.
    pub fn is_retired(&self, id: ConnectionId) -> bool {
        self.lock().retired.contains(&id)
    }

    /// Handle the far side's close of `id`.
    ///
    /// A live connection is marked remote-closed and torn down; a retired id
    /// is forgotten. Returns whether the id was known.
    pub fn close_remote(&self, id: ConnectionId) -> bool {
        let (removed, was_retired) = {
            let mut state = self.lock();
            let removed = state.live.remove(&id);
            if let Some(connection) = &removed {
                connection.mark_remote_closed();
            }
            (removed, state.retired.remove(&id))
        };
        Self::close_removed(id, removed) || was_retired
    }

    /// Number of retired ids.
    pub fn retired_len(&self) -> usize {
        self.lock().retired.len()
    }

    /// Close and remove every connection, returning how many there were.
    pub fn drain(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            state.retired.clear();
            state.live.drain().map(|(_, connection)| connection).collect()
        };
        for connection in &drained {
            connection.close();
        }
        drained.len()
    }

    fn close_removed(id: ConnectionId, removed: Option<Arc<LogicalConnection>>) -> bool {
        match removed {
            Some(connection) => {
                connection.close();
                debug!(connection_id = id, "logical connection torn down");
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTable")
            .field("ids", &self.ids())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use portmux_frame::FrameReader;

    use super::*;

    fn detached_pair(id: ConnectionId) -> (Arc<LogicalConnection>, UnixStream) {
        let (near, far) = UnixStream::pair().unwrap();
        (LogicalConnection::detached(id, Box::new(near)).unwrap(), far)
    }

    #[test]
    fn write_reaches_endpoint() {
        let (connection, mut far) = detached_pair(1);
        connection.write(b"payload").unwrap();

        let mut buf = [0u8; 7];
        far.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn close_is_idempotent_and_stops_writes() {
        let (connection, mut far) = detached_pair(2);
        connection.close();
        connection.close();

        assert!(connection.is_closed());
        assert!(connection.write(b"late").is_err());
        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn table_teardown_closes_and_removes() {
        let table = ConnectionTable::new();
        let (first, _far1) = detached_pair(1);
        let (second, _far2) = detached_pair(2);
        table.insert(Arc::clone(&first));
        table.insert(second);

        assert_eq!(table.ids(), vec![1, 2]);
        assert!(table.teardown(1));
        assert!(!table.teardown(1));
        assert!(first.is_closed());
        assert!(!table.contains(1));
        assert_eq!(table.len(), 1);

        assert_eq!(table.drain(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn started_connection_frames_endpoint_reads() {
        let table = ConnectionTable::new();
        let (near, mut far) = UnixStream::pair().unwrap();
        let (sink_w, sink_r) = UnixStream::pair().unwrap();
        let sink = SharedFrameWriter::new(sink_w);

        let connection =
            LogicalConnection::start(9, Box::new(near), sink, table.clone(), 1024).unwrap();
        assert!(table.contains(9));

        std::io::Write::write_all(&mut far, b"up").unwrap();
        drop(far);

        let mut reader = FrameReader::new(sink_r);
        let data = reader.read_frame().unwrap().unwrap();
        assert_eq!((data.connection_id, data.payload.as_ref()), (9, b"up".as_ref()));
        let close = reader.read_frame().unwrap().unwrap();
        assert!(close.is_close());
        assert_eq!(close.connection_id, 9);

        wait_until(|| !table.contains(9));
        assert!(connection.is_closed());
    }

    #[test]
    fn remote_closed_connection_sends_no_close_frame() {
        let table = ConnectionTable::new();
        let (near, _far) = UnixStream::pair().unwrap();
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = SharedFrameWriter::new(Capture(Arc::clone(&captured)));

        let connection =
            LogicalConnection::start(4, Box::new(near), sink, table.clone(), 1024).unwrap();
        connection.mark_remote_closed();
        table.teardown(4);

        std::thread::sleep(Duration::from_millis(100));
        assert!(captured.lock().unwrap().is_empty());
    }

    #[test]
    fn retired_ids_stay_known_until_remote_close() {
        let table = ConnectionTable::new();
        let (first, _far1) = detached_pair(1);
        table.insert(Arc::clone(&first));

        assert!(table.retire(1));
        assert!(first.is_closed());
        assert!(!table.contains(1));
        assert!(table.is_retired(1));

        assert!(table.close_remote(1));
        assert!(!table.is_retired(1));
        assert!(!table.close_remote(1));
    }

    #[test]
    fn remote_closed_connection_is_not_retired() {
        let table = ConnectionTable::new();
        let (first, _far1) = detached_pair(1);
        table.insert(Arc::clone(&first));

        assert!(table.close_remote(1));
        assert!(first.is_remote_closed());
        assert!(!table.retire(1));
        assert!(!table.is_retired(1));

        let (second, _far2) = detached_pair(2);
        table.insert(second);
        table.refuse(3);
        assert_eq!(table.retired_len(), 1);
        assert_eq!(table.drain(), 1);
        assert_eq!(table.retired_len(), 0);
    }

    fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
