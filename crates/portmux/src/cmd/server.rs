use portmux_transport::{EndpointListener, TcpEndpoint};
use portmux_tunnel::{AdmissionControl, AllowList, Firewall, ServerConfig, ServerForwarder};
use serde::Serialize;
use tracing::{info, warn};

use crate::cmd::{parse_duration, parse_firewall, wait_for_shutdown_signal, ServerArgs};
use crate::exit::{transport_error, tunnel_error, CliError, CliResult, SUCCESS};
use crate::output::{join_or_dash, print_report, OutputFormat, Report};

/// One extra carrier listener whose connections are dialed on its own host
/// with its own allow lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HostMapping {
    pub listen: String,
    pub host: String,
    pub ports: Option<String>,
    pub pipes: Option<String>,
}

/// Parse `LISTEN=HOST[;PORTS[;PIPES]]`. Omitted lists fall back to the
/// server-wide ones.
pub(crate) fn parse_host_mapping(mapping: &str) -> CliResult<HostMapping> {
    let invalid = || {
        CliError::usage(format!(
            "invalid host mapping '{mapping}' (expected LISTEN=HOST[;PORTS[;PIPES]])"
        ))
    };
    let (listen, rest) = mapping.split_once('=').ok_or_else(invalid)?;
    let mut fields = rest.split(';').map(str::trim);
    let host = fields.next().unwrap_or_default();
    let (listen, host) = (listen.trim(), host);
    if listen.is_empty() || host.is_empty() {
        return Err(invalid());
    }
    let ports = fields.next().map(str::to_string);
    let pipes = fields.next().map(str::to_string);
    if fields.next().is_some() {
        return Err(invalid());
    }
    Ok(HostMapping {
        listen: listen.to_string(),
        host: host.to_string(),
        ports,
        pipes,
    })
}

#[derive(Serialize)]
struct ForwarderStarted {
    listen: String,
    target_host: String,
    allowed_ports: String,
    allowed_pipes: String,
}

impl ForwarderStarted {
    fn describe(&self) -> String {
        format!(
            "{} -> {} (ports: {}, pipes: {})",
            self.listen,
            self.target_host,
            dash_if_empty(&self.allowed_ports),
            dash_if_empty(&self.allowed_pipes)
        )
    }
}

#[derive(Serialize)]
struct ServerStarted {
    event: &'static str,
    forwarders: Vec<ForwarderStarted>,
    allowed_sources: Vec<String>,
    pipe_dir: String,
}

impl Report for ServerStarted {
    fn rows(&self) -> Vec<(&'static str, String)> {
        let forwarders: Vec<String> = self.forwarders.iter().map(ForwarderStarted::describe).collect();
        vec![
            ("event", self.event.to_string()),
            ("forwarders", join_or_dash(&forwarders)),
            ("allowed_sources", join_or_dash(&self.allowed_sources)),
            ("pipe_dir", self.pipe_dir.clone()),
        ]
    }
}

fn dash_if_empty(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

pub fn run(args: ServerArgs, format: OutputFormat) -> CliResult<i32> {
    let mappings = args
        .maps
        .iter()
        .map(|mapping| parse_host_mapping(mapping))
        .collect::<CliResult<Vec<_>>>()?;
    let firewall = parse_firewall(&args.allow_sources)?;

    let mut base = ServerConfig::new(AdmissionControl::default())
        .with_preamble_timeout(Some(parse_duration(&args.preamble_timeout)?));
    base.connect_timeout = parse_duration(&args.connect_timeout)?;
    if let Some(dir) = &args.pipe_dir {
        base = base.with_pipe_dir(dir);
    }

    let mut planned = Vec::with_capacity(mappings.len() + 1);
    if args.listen.is_some() || args.listen_pipe.is_some() {
        let config = host_config(
            &base,
            &firewall,
            &args.target_host,
            &args.allowed_ports,
            &args.allowed_pipes,
        )?;
        planned.push((bind_listener(&args, &config)?, config));
    }
    for mapping in &mappings {
        let config = host_config(
            &base,
            &firewall,
            &mapping.host,
            mapping.ports.as_deref().unwrap_or(&args.allowed_ports),
            mapping.pipes.as_deref().unwrap_or(&args.allowed_pipes),
        )?;
        let endpoint = TcpEndpoint::bind(&mapping.listen)
            .map_err(|err| transport_error("bind failed", err))?;
        planned.push((endpoint.into(), config));
    }

    let mut report = ServerStarted {
        event: "server-started",
        forwarders: Vec::with_capacity(planned.len()),
        allowed_sources: firewall.ranges().iter().map(ToString::to_string).collect(),
        pipe_dir: base.pipe_dir.display().to_string(),
    };
    let mut forwarders = Vec::with_capacity(planned.len());
    for (listener, config) in planned {
        let started = ForwarderStarted {
            listen: listener.describe(),
            target_host: config.target_host.clone(),
            allowed_ports: config.admission.allow_list.describe_ports(),
            allowed_pipes: config.admission.allow_list.describe_pipes(),
        };
        if started.allowed_ports.is_empty() && started.allowed_pipes.is_empty() {
            warn!(listen = %started.listen, "allow list is empty; every carrier will be rejected");
        }
        let forwarder = ServerForwarder::start(listener, config)
            .map_err(|err| tunnel_error("start failed", err))?;
        report.forwarders.push(started);
        forwarders.push(forwarder);
    }
    print_report(&report, format);

    wait_for_shutdown_signal()?;
    let sessions: usize = forwarders.iter().map(ServerForwarder::session_count).sum();
    info!(forwarders = forwarders.len(), sessions, "shutting down");
    for forwarder in &forwarders {
        forwarder.close();
    }
    Ok(SUCCESS)
}

fn host_config(
    base: &ServerConfig,
    firewall: &Firewall,
    host: &str,
    ports: &str,
    pipes: &str,
) -> CliResult<ServerConfig> {
    let allow_list =
        AllowList::parse(ports, pipes).map_err(|err| tunnel_error("invalid allow list", err))?;
    let mut config = base.clone().with_target_host(host);
    config.admission = AdmissionControl::new(allow_list, firewall.clone());
    Ok(config)
}

fn bind_listener(args: &ServerArgs, config: &ServerConfig) -> CliResult<EndpointListener> {
    if let Some(address) = &args.listen {
        let endpoint =
            TcpEndpoint::bind(address).map_err(|err| transport_error("bind failed", err))?;
        return Ok(endpoint.into());
    }
    let name = args.listen_pipe.as_deref().unwrap_or_default();
    bind_pipe(config, name)
}

#[cfg(unix)]
fn bind_pipe(config: &ServerConfig, name: &str) -> CliResult<EndpointListener> {
    let listener = portmux_transport::PipeListener::bind(&config.pipe_dir, name)
        .map_err(|err| transport_error("bind failed", err))?;
    Ok(listener.into())
}

#[cfg(not(unix))]
fn bind_pipe(_config: &ServerConfig, _name: &str) -> CliResult<EndpointListener> {
    Err(transport_error(
        "bind failed",
        portmux_transport::TransportError::Unsupported("local pipes"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::USAGE;

    #[test]
    fn host_mappings_parse() {
        assert_eq!(
            parse_host_mapping("0.0.0.0:9351=db01;1433,5432;sqlquery").unwrap(),
            HostMapping {
                listen: "0.0.0.0:9351".into(),
                host: "db01".into(),
                ports: Some("1433,5432".into()),
                pipes: Some("sqlquery".into()),
            }
        );
        let bare = parse_host_mapping("127.0.0.1:9352 = web").unwrap();
        assert_eq!(bare.host, "web");
        assert_eq!(bare.ports, None);
        assert_eq!(bare.pipes, None);
        assert_eq!(
            parse_host_mapping("127.0.0.1:9353=files;").unwrap().ports,
            Some(String::new())
        );
    }

    #[test]
    fn bad_host_mappings_are_usage_errors() {
        for bad in ["db01", "=db01", "127.0.0.1:9351=", "a=b;1;p;extra"] {
            assert_eq!(parse_host_mapping(bad).unwrap_err().code, USAGE, "{bad:?}");
        }
    }

    #[test]
    fn mapping_lists_override_server_wide_lists() {
        let base = ServerConfig::default();
        let firewall = Firewall::default();
        let config = host_config(&base, &firewall, "db01", "1433", "").unwrap();
        assert_eq!(config.target_host, "db01");
        assert_eq!(config.admission.allow_list.describe_ports(), "1433");
        assert!(config.admission.allow_list.describe_pipes().is_empty());
        assert!(host_config(&base, &firewall, "db01", "nope", "").is_err());
    }
}
