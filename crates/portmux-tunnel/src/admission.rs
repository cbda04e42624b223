//! Admission control: which targets a server will dial and which sources a
//! forwarder will accept. Everything here is pure.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use portmux_frame::ConnectionTarget;

use crate::error::{Result, TunnelError};

const PIPE_PREFIX: &str = r"\\.\pipe\";

/// Normalize a pipe name for comparison and dialing.
///
/// A leading `\\.\pipe\` is stripped (case-insensitively) and the result is
/// lower-cased. Any other `\\` path (remote pipes, devices) is refused.
pub fn normalize_pipe_name(name: &str) -> Option<String> {
    let name = name.trim();
    let bare = match name.get(..PIPE_PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(PIPE_PREFIX) => &name[PIPE_PREFIX.len()..],
        _ if name.starts_with(r"\\") => return None,
        _ => name,
    };
    if bare.is_empty() {
        return None;
    }
    Some(bare.to_ascii_lowercase())
}

/// Ports and pipe names a server is willing to forward to.
///
/// The default list permits nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    any_port: bool,
    ports: BTreeSet<u16>,
    any_pipe: bool,
    pipes: BTreeSet<String>,
}

impl AllowList {
    /// Permit every port and every pipe.
    pub fn allow_all() -> Self {
        Self {
            any_port: true,
            any_pipe: true,
            ..Self::default()
        }
    }

    /// Parse port and pipe lists: `*` for any, or comma-separated entries.
    ///
    /// Empty strings permit nothing.
    pub fn parse(ports: &str, pipes: &str) -> Result<Self> {
        let mut list = Self::default();
        for entry in split_list(ports) {
            if entry == "*" {
                list.any_port = true;
                continue;
            }
            let port = entry.parse::<u16>().map_err(|_| {
                TunnelError::InvalidConfig(format!("invalid port '{entry}' in allow list"))
            })?;
            list.ports.insert(port);
        }
        for entry in split_list(pipes) {
            if entry == "*" {
                list.any_pipe = true;
                continue;
            }
            let name = normalize_pipe_name(entry).ok_or_else(|| {
                TunnelError::InvalidConfig(format!("invalid pipe name '{entry}' in allow list"))
            })?;
            list.pipes.insert(name);
        }
        Ok(list)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.insert(port);
        self
    }

    /// Add a pipe name. Names that do not normalize are ignored.
    pub fn with_pipe(mut self, name: &str) -> Self {
        if let Some(name) = normalize_pipe_name(name) {
            self.pipes.insert(name);
        }
        self
    }

    pub fn is_port_allowed(&self, port: u16) -> bool {
        self.any_port || self.ports.contains(&port)
    }

    pub fn is_pipe_allowed(&self, name: &str) -> bool {
        match normalize_pipe_name(name) {
            Some(name) => self.any_pipe || self.pipes.contains(&name),
            None => false,
        }
    }

    /// Ports rendered as they would be parsed.
    pub fn describe_ports(&self) -> String {
        describe(self.any_port, self.ports.iter().map(u16::to_string))
    }

    /// Pipe names rendered as they would be parsed.
    pub fn describe_pipes(&self) -> String {
        describe(self.any_pipe, self.pipes.iter().cloned())
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|entry| !entry.is_empty())
}

fn describe(any: bool, entries: impl Iterator<Item = String>) -> String {
    if any {
        return "*".to_string();
    }
    entries.collect::<Vec<_>>().join(",")
}

/// Inclusive range of IPv4 addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    begin: u32,
    end: u32,
}

impl IpRange {
    /// Range from `begin` to `end`, both inclusive.
    pub fn new(begin: Ipv4Addr, end: Ipv4Addr) -> Self {
        Self {
            begin: u32::from(begin),
            end: u32::from(end),
        }
    }

    /// Range holding a single address.
    pub fn single(addr: Ipv4Addr) -> Self {
        Self::new(addr, addr)
    }

    /// Parse `a.b.c.d` or `a.b.c.d-e.f.g.h`.
    pub fn parse(s: &str) -> Result<Self> {
        let parse_addr = |text: &str| {
            text.trim().parse::<Ipv4Addr>().map_err(|_| {
                TunnelError::InvalidConfig(format!("invalid IPv4 address '{text}' in range '{s}'"))
            })
        };
        match s.split_once('-') {
            Some((begin, end)) => {
                let range = Self::new(parse_addr(begin)?, parse_addr(end)?);
                if range.begin > range.end {
                    return Err(TunnelError::InvalidConfig(format!(
                        "range '{s}' ends before it begins"
                    )));
                }
                Ok(range)
            }
            None => Ok(Self::single(parse_addr(s)?)),
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let value = u32::from(addr);
        self.begin <= value && value <= self.end
    }

    pub fn begin(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.begin)
    }

    pub fn end(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.end)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.begin == self.end {
            write!(f, "{}", self.begin())
        } else {
            write!(f, "{}-{}", self.begin(), self.end())
        }
    }
}

impl FromStr for IpRange {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Source address filter for accepted connections.
///
/// An empty firewall permits every source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Firewall {
    ranges: Vec<IpRange>,
}

impl Firewall {
    pub fn new(ranges: Vec<IpRange>) -> Self {
        Self { ranges }
    }

    /// Permit every source.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Permit `127.0.0.0/8` only.
    pub fn loopback() -> Self {
        Self::new(vec![IpRange::new(
            Ipv4Addr::new(127, 0, 0, 0),
            Ipv4Addr::new(127, 255, 255, 255),
        )])
    }

    pub fn with_range(mut self, range: IpRange) -> Self {
        self.ranges.push(range);
        self
    }

    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// IPv4 sources (including v4-mapped IPv6) must fall inside a range;
    /// other IPv6 sources are refused unless the firewall is empty.
    pub fn is_source_allowed(&self, addr: IpAddr) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        let v4 = match addr {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4,
                None => return false,
            },
        };
        self.ranges.iter().any(|range| range.contains(v4))
    }
}

/// Outcome of checking a requested target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Permitted; pipe names are normalized.
    Admitted(ConnectionTarget),
    /// Refused, with the reason for the log line.
    Rejected(String),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }
}

/// Allow list plus firewall.
#[derive(Debug, Clone, Default)]
pub struct AdmissionControl {
    pub allow_list: AllowList,
    pub firewall: Firewall,
}

impl AdmissionControl {
    pub fn new(allow_list: AllowList, firewall: Firewall) -> Self {
        Self {
            allow_list,
            firewall,
        }
    }

    pub fn is_port_allowed(&self, port: u16) -> bool {
        self.allow_list.is_port_allowed(port)
    }

    pub fn is_pipe_allowed(&self, name: &str) -> bool {
        self.allow_list.is_pipe_allowed(name)
    }

    pub fn is_source_allowed(&self, addr: IpAddr) -> bool {
        self.firewall.is_source_allowed(addr)
    }

    /// Check a target from a carrier preamble.
    pub fn admit(&self, target: &ConnectionTarget) -> Admission {
        match target {
            ConnectionTarget::Tcp(port) if self.is_port_allowed(*port) => {
                Admission::Admitted(target.clone())
            }
            ConnectionTarget::Tcp(port) => {
                Admission::Rejected(format!("port {port} is not in the allow list"))
            }
            ConnectionTarget::Pipe(name) => match normalize_pipe_name(name) {
                None => Admission::Rejected(format!("pipe name '{name}' is not a local pipe")),
                Some(normalized) if self.allow_list.any_pipe
                    || self.allow_list.pipes.contains(&normalized) =>
                {
                    Admission::Admitted(ConnectionTarget::Pipe(normalized))
                }
                Some(_) => Admission::Rejected(format!("pipe '{name}' is not in the allow list")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_ports_are_exact() {
        let list = AllowList::parse("80, 443", "").expect("lists should parse");
        assert!(list.is_port_allowed(80));
        assert!(list.is_port_allowed(443));
        assert!(!list.is_port_allowed(79));
        assert!(!list.is_port_allowed(81));
        assert!(!list.is_port_allowed(8080));
        assert_eq!(list.describe_ports(), "80,443");
    }

    #[test]
    fn wildcard_ports_allow_everything() {
        let list = AllowList::parse("*", "").expect("lists should parse");
        for port in [0, 1, 80, 65535] {
            assert!(list.is_port_allowed(port));
        }
        assert!(!list.is_pipe_allowed("anything"));
    }

    #[test]
    fn default_list_permits_nothing() {
        let list = AllowList::default();
        assert!(!list.is_port_allowed(80));
        assert!(!list.is_pipe_allowed("sql"));
    }

    #[test]
    fn invalid_port_entries_are_errors() {
        assert!(AllowList::parse("80,http", "").is_err());
        assert!(AllowList::parse("70000", "").is_err());
    }

    #[test]
    fn pipe_names_compare_case_insensitively() {
        let list = AllowList::parse("", r"\\.\pipe\SqlQuery, logs").expect("lists should parse");
        assert!(list.is_pipe_allowed("sqlquery"));
        assert!(list.is_pipe_allowed(r"\\.\PIPE\SQLQUERY"));
        assert!(list.is_pipe_allowed("Logs"));
        assert!(!list.is_pipe_allowed("other"));
        assert_eq!(list.describe_pipes(), "logs,sqlquery");
    }

    #[test]
    fn remote_pipe_paths_are_rejected() {
        assert!(AllowList::parse("", r"\\server\pipe\x").is_err());
        assert_eq!(normalize_pipe_name(r"\\server\pipe\x"), None);
        assert_eq!(normalize_pipe_name(r"\\.\pipe\"), None);
        assert_eq!(normalize_pipe_name(" Name "), Some("name".to_string()));
        assert!(!AllowList::allow_all().is_pipe_allowed(r"\\server\pipe\x"));
    }

    #[test]
    fn ip_range_is_inclusive() {
        let range = IpRange::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 10));
        assert!(range.contains(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(range.contains(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(range.contains(Ipv4Addr::new(10, 0, 0, 10)));
        assert!(!range.contains(Ipv4Addr::new(9, 255, 255, 255)));
        assert!(!range.contains(Ipv4Addr::new(10, 0, 0, 11)));
    }

    #[test]
    fn ip_range_compares_big_endian() {
        // 10.0.1.0 is above 10.0.0.255 only under network byte order.
        let range = IpRange::new(Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 0, 0, 255));
        assert!(!range.contains(Ipv4Addr::new(10, 0, 1, 0)));
        assert!(!range.contains(Ipv4Addr::new(11, 0, 0, 0)));
    }

    #[test]
    fn ip_range_parse_and_display() {
        let range = IpRange::parse("10.0.0.1 - 10.0.0.10").expect("range should parse");
        assert_eq!(range.to_string(), "10.0.0.1-10.0.0.10");
        let single: IpRange = "192.168.1.7".parse().expect("single address should parse");
        assert_eq!(single.to_string(), "192.168.1.7");
        assert!(IpRange::parse("10.0.0.10-10.0.0.1").is_err());
        assert!(IpRange::parse("not-an-ip").is_err());
        assert!(IpRange::parse("::1").is_err());
    }

    #[test]
    fn empty_firewall_allows_everything() {
        let firewall = Firewall::allow_all();
        assert!(firewall.is_source_allowed(IpAddr::from([203, 0, 113, 9])));
        assert!(firewall.is_source_allowed("2001:db8::1".parse().expect("ipv6")));
    }

    #[test]
    fn firewall_checks_every_range() {
        let firewall = Firewall::default()
            .with_range(IpRange::single(Ipv4Addr::new(192, 168, 0, 1)))
            .with_range(IpRange::new(
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 10),
            ));
        assert!(firewall.is_source_allowed(IpAddr::from([192, 168, 0, 1])));
        assert!(firewall.is_source_allowed(IpAddr::from([10, 0, 0, 10])));
        assert!(!firewall.is_source_allowed(IpAddr::from([9, 255, 255, 255])));
        assert!(!firewall.is_source_allowed(IpAddr::from([10, 0, 0, 11])));
    }

    #[test]
    fn firewall_handles_ipv6_sources() {
        let firewall = Firewall::loopback();
        let mapped: IpAddr = "::ffff:127.0.0.1".parse().expect("mapped address");
        let native: IpAddr = "::1".parse().expect("ipv6 loopback");
        assert!(firewall.is_source_allowed(mapped));
        assert!(!firewall.is_source_allowed(native));
    }

    #[test]
    fn admit_normalizes_pipe_targets() {
        let control = AdmissionControl::new(
            AllowList::parse("22", "SqlQuery").expect("lists should parse"),
            Firewall::allow_all(),
        );
        assert_eq!(
            control.admit(&ConnectionTarget::Pipe(r"\\.\pipe\SQLQUERY".into())),
            Admission::Admitted(ConnectionTarget::Pipe("sqlquery".into()))
        );
        assert!(control.admit(&ConnectionTarget::Tcp(22)).is_admitted());
        assert!(!control.admit(&ConnectionTarget::Tcp(23)).is_admitted());
        assert!(!control
            .admit(&ConnectionTarget::Pipe(r"\\host\pipe\sqlquery".into()))
            .is_admitted());
    }
}
