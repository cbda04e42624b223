use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use clap::{Args, Subcommand};
use portmux_tunnel::{Firewall, IpRange};

use crate::exit::{tunnel_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod check;
pub mod client;
pub mod server;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept carriers and forward their connections to admitted targets.
    Server(ServerArgs),
    /// Forward local ports or pipes to a server agent over one carrier each.
    Client(ClientArgs),
    /// Evaluate admission control for a target without starting anything.
    Check(CheckArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Server(args) => server::run(args, format),
        Command::Client(args) => client::run(args, format),
        Command::Check(args) => check::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// TCP address to accept carriers on (e.g. 0.0.0.0:9350).
    #[arg(
        long,
        value_name = "ADDR",
        required_unless_present_any = ["listen_pipe", "maps"]
    )]
    pub listen: Option<String>,
    /// Accept carriers on a local pipe instead of TCP.
    #[arg(long, value_name = "NAME", conflicts_with = "listen")]
    pub listen_pipe: Option<String>,
    /// Host that admitted TCP targets are dialed on.
    #[arg(long, value_name = "HOST", default_value = "127.0.0.1")]
    pub target_host: String,
    /// Ports carriers may target: `*` or a comma-separated list.
    #[arg(long, value_name = "PORTS", env = "PORTMUX_ALLOWED_PORTS", default_value = "")]
    pub allowed_ports: String,
    /// Pipes carriers may target: `*` or a comma-separated list.
    #[arg(long, value_name = "PIPES", env = "PORTMUX_ALLOWED_PIPES", default_value = "")]
    pub allowed_pipes: String,
    /// Extra TCP carrier listener for another target host, with its own
    /// allow lists (LISTEN=HOST[;PORTS[;PIPES]]). Repeatable.
    #[arg(long = "map", value_name = "MAPPING")]
    pub maps: Vec<String>,
    /// Carrier source range (a.b.c.d or a.b.c.d-e.f.g.h). Repeatable; none
    /// allows every source.
    #[arg(long = "allow-source", value_name = "RANGE")]
    pub allow_sources: Vec<String>,
    /// Directory of local pipe sockets.
    #[arg(long, value_name = "DIR", env = "PORTMUX_PIPE_DIR")]
    pub pipe_dir: Option<PathBuf>,
    /// Time a carrier has to name its target (e.g. 30s, 500ms).
    #[arg(long, default_value = "30s")]
    pub preamble_timeout: String,
    /// Timeout for dialing a TCP target.
    #[arg(long, default_value = "10s")]
    pub connect_timeout: String,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// TCP address of the server agent.
    #[arg(long, value_name = "ADDR", required_unless_present = "carrier_pipe")]
    pub carrier: Option<String>,
    /// Reach the server agent over a local pipe instead of TCP.
    #[arg(long, value_name = "NAME", conflicts_with = "carrier")]
    pub carrier_pipe: Option<String>,
    /// Forward a local TCP port to a remote port (LOCAL:REMOTE). Repeatable.
    #[arg(long = "tcp", value_name = "LOCAL:REMOTE")]
    pub tcp: Vec<String>,
    /// Forward a local pipe to a remote pipe (LOCAL=REMOTE). Repeatable.
    #[arg(long = "pipe", value_name = "LOCAL=REMOTE")]
    pub pipe: Vec<String>,
    /// Address local TCP ports are bound on.
    #[arg(long, value_name = "IP", default_value = "127.0.0.1")]
    pub bind_to: String,
    /// Local source range. Repeatable; defaults to loopback only.
    #[arg(long = "allow-source", value_name = "RANGE", conflicts_with = "allow_any_source")]
    pub allow_sources: Vec<String>,
    /// Accept local connections from any source.
    #[arg(long)]
    pub allow_any_source: bool,
    /// Outbound chunks a carrier may queue before connections wait.
    #[arg(long, value_name = "N")]
    pub throttle: Option<usize>,
    /// Coalesce outbound chunks arriving within this delay (e.g. 5ms).
    #[arg(long, value_name = "DURATION")]
    pub nagle: Option<String>,
    /// Directory of local pipe sockets.
    #[arg(long, value_name = "DIR", env = "PORTMUX_PIPE_DIR")]
    pub pipe_dir: Option<PathBuf>,
    /// Timeout for connecting the carrier.
    #[arg(long, default_value = "10s")]
    pub connect_timeout: String,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Target to evaluate: tcp:<port> or np:<pipe>.
    pub target: String,
    /// Ports to allow: `*` or a comma-separated list.
    #[arg(long, value_name = "PORTS", env = "PORTMUX_ALLOWED_PORTS", default_value = "")]
    pub allowed_ports: String,
    /// Pipes to allow: `*` or a comma-separated list.
    #[arg(long, value_name = "PIPES", env = "PORTMUX_ALLOWED_PIPES", default_value = "")]
    pub allowed_pipes: String,
    /// Source range. Repeatable.
    #[arg(long = "allow-source", value_name = "RANGE")]
    pub allow_sources: Vec<String>,
    /// Source address to evaluate against the ranges.
    #[arg(long, value_name = "IP")]
    pub source: Option<std::net::IpAddr>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_firewall(ranges: &[String]) -> CliResult<Firewall> {
    ranges
        .iter()
        .map(|range| IpRange::parse(range))
        .collect::<Result<Vec<_>, _>>()
        .map(Firewall::new)
        .map_err(|err| tunnel_error("invalid source range", err))
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else if let Some(num) = input.strip_suffix('m') {
        (num, "m")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}

/// Block until Ctrl-C (or SIGTERM where supported).
pub(crate) fn wait_for_shutdown_signal() -> CliResult<()> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))?;
    rx.recv()
        .map_err(|err| CliError::new(INTERNAL, format!("signal channel closed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration(" 7 ").unwrap(), Duration::from_secs(7));
    }

    #[test]
    fn bad_durations_are_usage_errors() {
        for bad in ["", "0s", "fast", "-1s", "1h"] {
            let err = parse_duration(bad).unwrap_err();
            assert_eq!(err.code, USAGE, "{bad:?}");
        }
    }

    #[test]
    fn firewall_ranges_parse() {
        let firewall =
            parse_firewall(&["10.0.0.1-10.0.0.10".to_string(), "192.168.1.1".to_string()])
                .unwrap();
        assert_eq!(firewall.ranges().len(), 2);
        assert!(parse_firewall(&[]).unwrap().is_empty());
        assert_eq!(parse_firewall(&["nope".to_string()]).unwrap_err().code, USAGE);
    }
}
