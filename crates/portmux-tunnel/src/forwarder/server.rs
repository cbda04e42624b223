use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use portmux_frame::{read_target_preamble, ConnectionId, ConnectionTarget};
use portmux_transport::{Duplex, EndpointListener, EndpointStream, TcpEndpoint};
use tracing::{debug, info, warn};

use crate::admission::{Admission, AdmissionControl};
use crate::error::Result;
use crate::forwarder::{spawn_accept_loop, DEFAULT_POLL_INTERVAL};
use crate::pump::ConnectionFactory;
use crate::session::{Session, SessionConfig};

/// Server agent configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host that admitted TCP targets are dialed on.
    pub target_host: String,
    pub admission: AdmissionControl,
    /// Directory holding the sockets of local pipe targets.
    pub pipe_dir: PathBuf,
    /// How long a new carrier may take to send its target preamble.
    pub preamble_timeout: Option<Duration>,
    /// Timeout for dialing a TCP target.
    pub connect_timeout: Duration,
    /// Session settings for carriers forwarding to TCP targets.
    pub tcp_session: SessionConfig,
    /// Session settings for carriers forwarding to pipe targets.
    pub pipe_session: SessionConfig,
    pub poll_interval: Duration,
}

impl ServerConfig {
    pub fn new(admission: AdmissionControl) -> Self {
        Self {
            admission,
            ..Self::default()
        }
    }

    pub fn with_target_host(mut self, host: impl Into<String>) -> Self {
        self.target_host = host.into();
        self
    }

    pub fn with_pipe_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipe_dir = dir.into();
        self
    }

    pub fn with_preamble_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.preamble_timeout = timeout;
        self
    }

    pub fn session_for(&self, target: &ConnectionTarget) -> SessionConfig {
        match target {
            ConnectionTarget::Tcp(_) => self.tcp_session.clone(),
            ConnectionTarget::Pipe(_) => self.pipe_session.clone(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            target_host: "127.0.0.1".to_string(),
            admission: AdmissionControl::default(),
            pipe_dir: default_pipe_dir(),
            preamble_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            tcp_session: SessionConfig::for_tcp(),
            pipe_session: SessionConfig::for_pipes(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[cfg(unix)]
fn default_pipe_dir() -> PathBuf {
    portmux_transport::default_pipe_dir()
}

#[cfg(not(unix))]
fn default_pipe_dir() -> PathBuf {
    std::env::temp_dir().join("portmux-pipes")
}

/// Dials the admitted target of a carrier once per logical connection.
#[derive(Debug, Clone)]
pub struct TargetDialer {
    target: ConnectionTarget,
    host: String,
    pipe_dir: PathBuf,
    connect_timeout: Duration,
}

impl TargetDialer {
    pub fn new(target: ConnectionTarget, config: &ServerConfig) -> Self {
        Self {
            target,
            host: config.target_host.clone(),
            pipe_dir: config.pipe_dir.clone(),
            connect_timeout: config.connect_timeout,
        }
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Connect to the target.
    pub fn dial(&self) -> Result<EndpointStream> {
        match &self.target {
            ConnectionTarget::Tcp(port) => {
                let address = host_port(&self.host, *port);
                Ok(TcpEndpoint::connect_timeout(&address, self.connect_timeout)?)
            }
            ConnectionTarget::Pipe(name) => self.dial_pipe(name),
        }
    }

    #[cfg(unix)]
    fn dial_pipe(&self, name: &str) -> Result<EndpointStream> {
        Ok(portmux_transport::PipeListener::connect(&self.pipe_dir, name)?)
    }

    #[cfg(not(unix))]
    fn dial_pipe(&self, _name: &str) -> Result<EndpointStream> {
        Err(portmux_transport::TransportError::Unsupported("local pipes").into())
    }
}

impl ConnectionFactory for TargetDialer {
    fn open(&self, id: ConnectionId) -> Result<Option<Box<dyn Duplex>>> {
        let stream = self.dial()?;
        debug!(connection_id = id, target = %self.target, "dialed target");
        Ok(Some(Box::new(stream)))
    }
}

fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Accepts carriers and forwards their logical connections to the target
/// each carrier names.
pub struct ServerForwarder {
    description: String,
    stop: Arc<AtomicBool>,
    closed: AtomicBool,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    sessions: Arc<Mutex<Vec<Session>>>,
}

impl ServerForwarder {
    /// Start accepting carriers on `listener`.
    pub fn start(listener: EndpointListener, config: ServerConfig) -> Result<Self> {
        let description = listener.describe();
        let stop = Arc::new(AtomicBool::new(false));
        let sessions: Arc<Mutex<Vec<Session>>> = Arc::default();
        let config = Arc::new(config);

        let accept_stop = Arc::clone(&stop);
        let accept_sessions = Arc::clone(&sessions);
        let poll_interval = config.poll_interval;
        let mut accepted: u64 = 0;
        let accept_thread = spawn_accept_loop(
            "server-accept".to_string(),
            listener,
            Arc::clone(&stop),
            poll_interval,
            move |stream, source| {
                accepted += 1;
                let handler = CarrierHandler {
                    name: format!("carrier-{accepted}"),
                    config: Arc::clone(&config),
                    sessions: Arc::clone(&accept_sessions),
                    stop: Arc::clone(&accept_stop),
                };
                let spawned = std::thread::Builder::new()
                    .name(handler.name.clone())
                    .spawn(move || handler.run(stream, source));
                if let Err(err) = spawned {
                    warn!(error = %err, "failed to spawn carrier handler");
                }
            },
        )?;

        info!(listen = %description, "server forwarder started");
        Ok(Self {
            description,
            stop,
            closed: AtomicBool::new(false),
            accept_thread: Mutex::new(Some(accept_thread)),
            sessions,
        })
    }

    /// Where carriers are accepted.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Live sessions.
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions = lock_sessions(&self.sessions);
        sessions.retain(|session| !session.is_closed());
        sessions.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting and close every session. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        let handle = self
            .accept_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(listen = %self.description, "accept loop panicked");
            }
        }
        let sessions: Vec<Session> = lock_sessions(&self.sessions).drain(..).collect();
        for session in &sessions {
            session.close();
        }
        info!(listen = %self.description, sessions = sessions.len(), "server forwarder closed");
    }
}

impl Drop for ServerForwarder {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ServerForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerForwarder")
            .field("description", &self.description)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn lock_sessions(sessions: &Mutex<Vec<Session>>) -> MutexGuard<'_, Vec<Session>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

struct CarrierHandler {
    name: String,
    config: Arc<ServerConfig>,
    sessions: Arc<Mutex<Vec<Session>>>,
    stop: Arc<AtomicBool>,
}

impl CarrierHandler {
    fn run(self, mut carrier: EndpointStream, source: Option<IpAddr>) {
        let peer = source.map_or_else(|| "local".to_string(), |ip| ip.to_string());
        if let Some(ip) = source {
            if !self.config.admission.is_source_allowed(ip) {
                warn!(%peer, "carrier source not permitted");
                reject(&carrier);
                return;
            }
        }

        if let Err(err) = carrier.set_read_timeout(self.config.preamble_timeout) {
            warn!(%peer, error = %err, "could not arm preamble timeout");
            reject(&carrier);
            return;
        }
        let requested = match read_target_preamble(&mut carrier) {
            Ok(target) => target,
            Err(err) => {
                warn!(%peer, error = %err, "invalid carrier preamble");
                reject(&carrier);
                return;
            }
        };

        let target = match self.config.admission.admit(&requested) {
            Admission::Admitted(target) => target,
            Admission::Rejected(reason) => {
                warn!(%peer, target = %requested, %reason, "carrier target rejected");
                reject(&carrier);
                return;
            }
        };

        let dialer = TargetDialer::new(target.clone(), &self.config);
        let session = match Session::start(
            self.name.clone(),
            Box::new(carrier),
            Arc::new(dialer),
            self.config.session_for(&target),
        ) {
            Ok(session) => session,
            Err(err) => {
                warn!(%peer, %target, error = %err, "failed to start session");
                return;
            }
        };
        info!(session = %self.name, %peer, %target, "carrier admitted");

        {
            let mut sessions = lock_sessions(&self.sessions);
            sessions.retain(|session| !session.is_closed());
            sessions.push(session.clone());
        }
        // The forwarder may have closed while this carrier was handshaking.
        if self.stop.load(Ordering::SeqCst) {
            session.close();
        }
    }
}

fn reject(carrier: &EndpointStream) {
    if let Err(err) = carrier.close() {
        debug!(error = %err, "carrier already closed");
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use portmux_frame::{write_target_preamble, FrameReader, FrameWriter};

    use super::*;
    use crate::admission::AllowList;

    const WAIT: Duration = Duration::from_secs(5);

    fn echo_target() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                std::thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    while let Ok(n) = stream.read(&mut buf) {
                        if n == 0 || stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    fn start_server(allowed: AllowList) -> (ServerForwarder, String) {
        let endpoint = TcpEndpoint::bind("127.0.0.1:0").unwrap();
        let address = endpoint.local_addr().to_string();
        let config = ServerConfig::new(AdmissionControl::new(allowed, Default::default()));
        let server = ServerForwarder::start(endpoint.into(), config).unwrap();
        (server, address)
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = std::time::Instant::now() + WAIT;
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn host_port_brackets_ipv6() {
        assert_eq!(host_port("127.0.0.1", 80), "127.0.0.1:80");
        assert_eq!(host_port("::1", 80), "[::1]:80");
        assert_eq!(host_port("[::1]", 80), "[::1]:80");
        assert_eq!(host_port("db.internal", 5432), "db.internal:5432");
    }

    #[test]
    fn admitted_carrier_reaches_target() {
        let port = echo_target();
        let (server, address) = start_server(AllowList::default().with_port(port));

        let mut carrier = TcpEndpoint::connect(&address).unwrap();
        write_target_preamble(&mut carrier, &ConnectionTarget::Tcp(port)).unwrap();
        let mut writer = FrameWriter::new(carrier.try_clone().unwrap());
        let mut reader = FrameReader::new(carrier);

        writer.send(1, b"through the tunnel").unwrap();
        let mut echoed = Vec::new();
        while echoed.len() < 18 {
            let frame = reader.read_frame().unwrap().unwrap();
            assert_eq!(frame.connection_id, 1);
            echoed.extend_from_slice(&frame.payload);
        }
        assert_eq!(echoed, b"through the tunnel");
        assert!(wait_until(|| server.session_count() == 1));

        server.close();
        assert!(reader.read_frame().map(|f| f.is_none()).unwrap_or(true));
    }

    #[test]
    fn rejected_target_closes_carrier() {
        let port = echo_target();
        let (server, address) = start_server(AllowList::default());

        let mut carrier = TcpEndpoint::connect(&address).unwrap();
        write_target_preamble(&mut carrier, &ConnectionTarget::Tcp(port)).unwrap();
        carrier.set_read_timeout(Some(WAIT)).unwrap();

        let mut buf = [0u8; 1];
        let read = carrier.read(&mut buf);
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn failed_dial_is_reported_as_close() {
        // Bind then drop to get a port with nothing listening.
        let dead_port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let (server, address) = start_server(AllowList::allow_all());

        let mut carrier = TcpEndpoint::connect(&address).unwrap();
        write_target_preamble(&mut carrier, &ConnectionTarget::Tcp(dead_port)).unwrap();
        let mut writer = FrameWriter::new(carrier.try_clone().unwrap());
        let mut reader = FrameReader::new(carrier);

        writer.send(3, b"anyone?").unwrap();
        let frame = reader.read_frame().unwrap().unwrap();
        assert_eq!(frame.connection_id, 3);
        assert!(frame.is_close());
        assert!(wait_until(|| server.session_count() == 1));
    }

    #[test]
    fn close_is_idempotent() {
        let (server, _address) = start_server(AllowList::allow_all());
        server.close();
        server.close();
        assert!(server.is_closed());
        assert_eq!(server.session_count(), 0);
    }
}
