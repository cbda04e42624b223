use std::path::PathBuf;
use std::time::Duration;

use portmux_transport::{Duplex, EndpointListener, TcpEndpoint};
use portmux_tunnel::{
    CarrierConnector, ClientConfig, ClientForwarder, ConnectionTarget, Firewall,
    TcpCarrierConnector,
};
use serde::Serialize;
use tracing::info;

use crate::cmd::{parse_duration, parse_firewall, wait_for_shutdown_signal, ClientArgs};
use crate::exit::{transport_error, tunnel_error, CliError, CliResult, SUCCESS};
use crate::output::{join_or_dash, print_report, OutputFormat, Report};

/// How long the server gets to close a flushed carrier on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// One local listener and the remote target it forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Forward {
    Tcp { local: u16, remote: u16 },
    Pipe { local: String, remote: String },
}

impl Forward {
    fn remote(&self) -> ConnectionTarget {
        match self {
            Self::Tcp { remote, .. } => ConnectionTarget::Tcp(*remote),
            Self::Pipe { remote, .. } => ConnectionTarget::Pipe(remote.clone()),
        }
    }
}

pub(crate) fn parse_tcp_forward(mapping: &str) -> CliResult<Forward> {
    let invalid = || {
        CliError::usage(format!(
            "invalid tcp forward '{mapping}' (expected LOCAL:REMOTE)"
        ))
    };
    let (local, remote) = mapping.split_once(':').ok_or_else(invalid)?;
    Ok(Forward::Tcp {
        local: local.trim().parse().map_err(|_| invalid())?,
        remote: remote.trim().parse().map_err(|_| invalid())?,
    })
}

pub(crate) fn parse_pipe_forward(mapping: &str) -> CliResult<Forward> {
    let invalid = || {
        CliError::usage(format!(
            "invalid pipe forward '{mapping}' (expected LOCAL=REMOTE)"
        ))
    };
    let (local, remote) = mapping.split_once('=').ok_or_else(invalid)?;
    let (local, remote) = (local.trim(), remote.trim());
    if local.is_empty() || remote.is_empty() {
        return Err(invalid());
    }
    Ok(Forward::Pipe {
        local: local.to_string(),
        remote: remote.to_string(),
    })
}

/// The carrier transport chosen on the command line.
#[derive(Clone)]
enum Carrier {
    Tcp(TcpCarrierConnector),
    #[cfg(unix)]
    Pipe(portmux_tunnel::PipeCarrierConnector),
}

impl CarrierConnector for Carrier {
    fn connect(&self) -> portmux_tunnel::Result<Box<dyn Duplex>> {
        match self {
            Self::Tcp(connector) => connector.connect(),
            #[cfg(unix)]
            Self::Pipe(connector) => connector.connect(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Tcp(connector) => connector.describe(),
            #[cfg(unix)]
            Self::Pipe(connector) => connector.describe(),
        }
    }
}

#[derive(Serialize)]
struct ClientStarted {
    event: &'static str,
    carrier: String,
    forwards: Vec<String>,
    allowed_sources: Vec<String>,
}

impl Report for ClientStarted {
    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("event", self.event.to_string()),
            ("carrier", self.carrier.clone()),
            ("forwards", join_or_dash(&self.forwards)),
            ("allowed_sources", join_or_dash(&self.allowed_sources)),
        ]
    }
}

pub fn run(args: ClientArgs, format: OutputFormat) -> CliResult<i32> {
    let mut forwards = Vec::new();
    for mapping in &args.tcp {
        forwards.push(parse_tcp_forward(mapping)?);
    }
    for mapping in &args.pipe {
        forwards.push(parse_pipe_forward(mapping)?);
    }
    if forwards.is_empty() {
        return Err(CliError::usage("nothing to forward (use --tcp or --pipe)"));
    }

    let pipe_dir = args.pipe_dir.clone().unwrap_or_else(default_pipe_dir);
    let carrier = carrier_connector(&args, &pipe_dir)?;
    let firewall = if args.allow_any_source {
        Firewall::allow_all()
    } else if args.allow_sources.is_empty() {
        Firewall::loopback()
    } else {
        parse_firewall(&args.allow_sources)?
    };
    let nagle = args.nagle.as_deref().map(parse_duration).transpose()?;

    let mut forwarders = Vec::with_capacity(forwards.len());
    for forward in &forwards {
        let mut config = ClientConfig::new(forward.remote()).with_firewall(firewall.clone());
        if let Some(throttle) = args.throttle {
            config.session = config.session.with_throttle_capacity(throttle);
        }
        config.session = config.session.with_nagle_delay(nagle);

        let listener = bind_local(forward, &args.bind_to, &pipe_dir)?;
        let forwarder = ClientForwarder::start(listener, carrier.clone(), config)
            .map_err(|err| tunnel_error("start failed", err))?;
        forwarders.push(forwarder);
    }

    print_report(
        &ClientStarted {
            event: "client-started",
            carrier: carrier.describe(),
            forwards: forwarders
                .iter()
                .map(|forwarder| forwarder.description().to_string())
                .collect(),
            allowed_sources: firewall.ranges().iter().map(ToString::to_string).collect(),
        },
        format,
    );

    wait_for_shutdown_signal()?;
    info!(forwards = forwarders.len(), "shutting down");
    for forwarder in &forwarders {
        forwarder.shutdown(SHUTDOWN_GRACE);
    }
    Ok(SUCCESS)
}

fn carrier_connector(args: &ClientArgs, pipe_dir: &std::path::Path) -> CliResult<Carrier> {
    let timeout: Duration = parse_duration(&args.connect_timeout)?;
    if let Some(address) = &args.carrier {
        return Ok(Carrier::Tcp(
            TcpCarrierConnector::new(address.clone()).with_timeout(timeout),
        ));
    }
    let name = args.carrier_pipe.clone().unwrap_or_default();
    pipe_carrier(pipe_dir, name)
}

#[cfg(unix)]
fn pipe_carrier(pipe_dir: &std::path::Path, name: String) -> CliResult<Carrier> {
    Ok(Carrier::Pipe(portmux_tunnel::PipeCarrierConnector::new(
        pipe_dir, name,
    )))
}

#[cfg(not(unix))]
fn pipe_carrier(_pipe_dir: &std::path::Path, _name: String) -> CliResult<Carrier> {
    Err(transport_error(
        "carrier",
        portmux_transport::TransportError::Unsupported("local pipes"),
    ))
}

fn bind_local(
    forward: &Forward,
    bind_to: &str,
    pipe_dir: &std::path::Path,
) -> CliResult<EndpointListener> {
    match forward {
        Forward::Tcp { local, .. } => {
            let address = if bind_to.contains(':') && !bind_to.starts_with('[') {
                format!("[{bind_to}]:{local}")
            } else {
                format!("{bind_to}:{local}")
            };
            let endpoint =
                TcpEndpoint::bind(&address).map_err(|err| transport_error("bind failed", err))?;
            Ok(endpoint.into())
        }
        Forward::Pipe { local, .. } => bind_local_pipe(pipe_dir, local),
    }
}

#[cfg(unix)]
fn bind_local_pipe(pipe_dir: &std::path::Path, name: &str) -> CliResult<EndpointListener> {
    let listener = portmux_transport::PipeListener::bind(pipe_dir, name)
        .map_err(|err| transport_error("bind failed", err))?;
    Ok(listener.into())
}

#[cfg(not(unix))]
fn bind_local_pipe(_pipe_dir: &std::path::Path, _name: &str) -> CliResult<EndpointListener> {
    Err(transport_error(
        "bind failed",
        portmux_transport::TransportError::Unsupported("local pipes"),
    ))
}

#[cfg(unix)]
fn default_pipe_dir() -> PathBuf {
    portmux_transport::default_pipe_dir()
}

#[cfg(not(unix))]
fn default_pipe_dir() -> PathBuf {
    std::env::temp_dir().join("portmux-pipes")
}
