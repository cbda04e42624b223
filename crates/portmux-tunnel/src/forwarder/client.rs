use std::net::IpAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use portmux_frame::{write_target_preamble, ConnectionTarget};
use portmux_transport::{Duplex, EndpointListener, EndpointStream, TcpEndpoint};
use tracing::{debug, info, warn};

use crate::admission::Firewall;
use crate::error::{Result, TunnelError};
use crate::forwarder::{spawn_accept_loop, DEFAULT_POLL_INTERVAL};
use crate::pump::CorrelateOnly;
use crate::session::{Session, SessionConfig};

/// Connect and preamble timeout a client uses unless told otherwise.
pub const DEFAULT_CARRIER_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens carriers to a server agent.
pub trait CarrierConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Duplex>>;

    /// Where carriers go, for logs.
    fn describe(&self) -> String;
}

/// Carrier over a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpCarrierConnector {
    address: String,
    timeout: Option<Duration>,
}

impl TcpCarrierConnector {
    /// Connects with [`DEFAULT_CARRIER_TIMEOUT`].
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Some(DEFAULT_CARRIER_TIMEOUT),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait as long as the OS allows.
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }
}

impl CarrierConnector for TcpCarrierConnector {
    fn connect(&self) -> Result<Box<dyn Duplex>> {
        let stream = match self.timeout {
            Some(timeout) => TcpEndpoint::connect_timeout(&self.address, timeout)?,
            None => TcpEndpoint::connect(&self.address)?,
        };
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp:{}", self.address)
    }
}

/// Carrier over a local pipe.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct PipeCarrierConnector {
    dir: PathBuf,
    name: String,
}

#[cfg(unix)]
impl PipeCarrierConnector {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }
}

#[cfg(unix)]
impl CarrierConnector for PipeCarrierConnector {
    fn connect(&self) -> Result<Box<dyn Duplex>> {
        let stream = portmux_transport::PipeListener::connect(&self.dir, &self.name)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("pipe:{}", self.name)
    }
}

/// Client agent configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The target every tunnelled connection goes to on the server side.
    pub remote: ConnectionTarget,
    /// Sources allowed to connect locally. Empty allows all.
    pub firewall: Firewall,
    pub session: SessionConfig,
    /// Write timeout for the target preamble on a fresh carrier.
    pub preamble_timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl ClientConfig {
    /// Defaults for `remote`: loopback sources only, and the session
    /// throttle of the remote's transport.
    pub fn new(remote: ConnectionTarget) -> Self {
        let session = match remote {
            ConnectionTarget::Tcp(_) => SessionConfig::for_tcp(),
            ConnectionTarget::Pipe(_) => SessionConfig::for_pipes(),
        };
        Self {
            remote,
            firewall: Firewall::loopback(),
            session,
            preamble_timeout: Some(DEFAULT_CARRIER_TIMEOUT),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_firewall(mut self, firewall: Firewall) -> Self {
        self.firewall = firewall;
        self
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_preamble_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.preamble_timeout = timeout;
        self
    }
}

struct ClientShared {
    connector: Box<dyn CarrierConnector>,
    config: ClientConfig,
    session: Mutex<Option<Session>>,
    /// Held while a carrier is being connected, so concurrent accepts share
    /// one carrier without blocking readers of `session`.
    connecting: Mutex<()>,
    stop: Arc<AtomicBool>,
    carriers: AtomicU64,
}

impl ClientShared {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_session(&self) -> Option<Session> {
        self.lock_session()
            .as_ref()
            .filter(|session| !session.is_closed())
            .cloned()
    }

    /// The live session, connecting a new carrier if there is none.
    fn ensure_session(&self) -> Result<Session> {
        if let Some(session) = self.live_session() {
            return Ok(session);
        }
        let _connecting = self
            .connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = self.live_session() {
            return Ok(session);
        }

        let session = self.connect_session()?;
        let mut slot = self.lock_session();
        if self.stop.load(Ordering::SeqCst) {
            drop(slot);
            session.close();
            return Err(TunnelError::ForwarderClosed);
        }
        *slot = Some(session.clone());
        Ok(session)
    }

    fn connect_session(&self) -> Result<Session> {
        let mut carrier = self.connector.connect()?;
        carrier.set_write_timeout(self.config.preamble_timeout)?;
        write_target_preamble(&mut carrier, &self.config.remote)?;
        let carrier_number = self.carriers.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Session::start(
            format!("client-{carrier_number}"),
            carrier,
            Arc::new(CorrelateOnly),
            self.config.session.clone(),
        )?;
        info!(
            carrier = %self.connector.describe(),
            target = %self.config.remote,
            session = session.name(),
            "carrier connected"
        );
        Ok(session)
    }

    fn accept(&self, stream: EndpointStream, source: Option<IpAddr>) {
        if let Some(ip) = source {
            if !self.config.firewall.is_source_allowed(ip) {
                warn!(peer = %ip, "local connection source not permitted");
                drop_stream(&stream);
                return;
            }
        }

        let session = match self.ensure_session() {
            Ok(session) => session,
            Err(err) => {
                warn!(carrier = %self.connector.describe(), error = %err, "carrier unavailable");
                drop_stream(&stream);
                return;
            }
        };
        match session.open_connection(Box::new(stream)) {
            Ok(id) => debug!(session = session.name(), connection_id = id, "local connection tunnelled"),
            Err(err) => warn!(session = session.name(), error = %err, "could not tunnel local connection"),
        }
    }
}

fn drop_stream(stream: &EndpointStream) {
    if let Err(err) = stream.close() {
        debug!(error = %err, "local connection already closed");
    }
}

/// Accepts local connections and tunnels them to one remote target over a
/// lazily connected carrier.
///
/// A carrier that dies is replaced on the next accepted connection.
pub struct ClientForwarder {
    description: String,
    stop: Arc<AtomicBool>,
    closed: AtomicBool,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<ClientShared>,
}

impl ClientForwarder {
    /// Start accepting local connections on `listener`.
    pub fn start<C>(listener: EndpointListener, connector: C, config: ClientConfig) -> Result<Self>
    where
        C: CarrierConnector + 'static,
    {
        let description = format!("{} -> {}", listener.describe(), config.remote);
        let stop = Arc::new(AtomicBool::new(false));
        let poll_interval = config.poll_interval;
        let shared = Arc::new(ClientShared {
            connector: Box::new(connector),
            config,
            session: Mutex::new(None),
            connecting: Mutex::new(()),
            stop: Arc::clone(&stop),
            carriers: AtomicU64::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_thread = spawn_accept_loop(
            "client-accept".to_string(),
            listener,
            Arc::clone(&stop),
            poll_interval,
            move |stream, source| accept_shared.accept(stream, source),
        )?;

        info!(forward = %description, "client forwarder started");
        Ok(Self {
            description,
            stop,
            closed: AtomicBool::new(false),
            accept_thread: Mutex::new(Some(accept_thread)),
            shared,
        })
    }

    /// `<local endpoint> -> <remote target>`.
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn remote(&self) -> &ConnectionTarget {
        &self.shared.config.remote
    }

    /// The live session, if a carrier is connected.
    pub fn session(&self) -> Option<Session> {
        self.shared.live_session()
    }

    /// Connect the carrier now instead of on the first local connection.
    pub fn connect(&self) -> Result<Session> {
        if self.is_closed() {
            return Err(TunnelError::ForwarderClosed);
        }
        self.shared.ensure_session()
    }

    pub fn connection_count(&self) -> usize {
        self.session().map_or(0, |session| session.connection_count())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting and close the carrier. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_accepting();
        if let Some(session) = self.shared.lock_session().take() {
            session.close();
        }
        info!(forward = %self.description, "client forwarder closed");
    }
}

impl ClientForwarder {
    /// Stop accepting, flush the carrier and give the server up to `grace`
    /// to close it, then close.
    pub fn shutdown(&self, grace: Duration) {
        if self.is_closed() {
            return;
        }
        self.stop_accepting();
        if let Some(session) = self.session() {
            session.finish();
            if !session.wait(Some(grace)) {
                debug!(session = session.name(), "carrier not closed by peer in time");
            }
        }
        self.close();
    }

    fn stop_accepting(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self
            .accept_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(forward = %self.description, "accept loop panicked");
            }
        }
    }
}

impl Drop for ClientForwarder {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ClientForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientForwarder")
            .field("description", &self.description)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
