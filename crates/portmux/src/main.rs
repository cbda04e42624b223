mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "portmux",
    version,
    about = "Forward TCP ports and local pipes over one multiplexed carrier"
)]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_subcommand() {
        let cli = Cli::try_parse_from([
            "portmux",
            "server",
            "--listen",
            "127.0.0.1:9350",
            "--allowed-ports",
            "80,443",
            "--allow-source",
            "10.0.0.1-10.0.0.9",
        ])
        .expect("server args should parse");

        match cli.command {
            Command::Server(args) => {
                assert_eq!(args.listen.as_deref(), Some("127.0.0.1:9350"));
                assert_eq!(args.allowed_ports, "80,443");
                assert_eq!(args.allow_sources, vec!["10.0.0.1-10.0.0.9".to_string()]);
                assert_eq!(args.target_host, "127.0.0.1");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn server_needs_a_listener() {
        let err = Cli::try_parse_from(["portmux", "server"])
            .expect_err("missing listener should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn host_mappings_stand_in_for_a_listener() {
        let cli = Cli::try_parse_from([
            "portmux",
            "server",
            "--map",
            "0.0.0.0:9351=db01;1433",
            "--map",
            "0.0.0.0:9352=files;;share",
        ])
        .expect("mapped server args should parse");

        match cli.command {
            Command::Server(args) => {
                assert_eq!(args.listen, None);
                assert_eq!(args.maps.len(), 2);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_client_forwards() {
        let cli = Cli::try_parse_from([
            "portmux",
            "client",
            "--carrier",
            "10.1.1.1:9350",
            "--tcp",
            "8080:80",
            "--tcp",
            "2222:22",
            "--pipe",
            "sql=sqlquery",
            "--throttle",
            "8",
        ])
        .expect("client args should parse");

        match cli.command {
            Command::Client(args) => {
                assert_eq!(args.tcp.len(), 2);
                assert_eq!(args.pipe, vec!["sql=sqlquery".to_string()]);
                assert_eq!(args.throttle, Some(8));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_conflicting_source_args() {
        let err = Cli::try_parse_from([
            "portmux",
            "client",
            "--carrier",
            "127.0.0.1:9350",
            "--tcp",
            "8080:80",
            "--allow-source",
            "10.0.0.1",
            "--allow-any-source",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_check_subcommand() {
        let cli = Cli::try_parse_from([
            "portmux",
            "check",
            "np:sqlquery",
            "--allowed-pipes",
            "*",
            "--format",
            "json",
        ])
        .expect("check args should parse");
        assert!(matches!(cli.command, Command::Check(_)));
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
    }
}
