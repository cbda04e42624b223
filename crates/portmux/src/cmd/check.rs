use std::net::IpAddr;

use portmux_tunnel::{Admission, AdmissionControl, AllowList, ConnectionTarget};
use serde::Serialize;

use crate::cmd::{parse_firewall, CheckArgs};
use crate::exit::{frame_error, tunnel_error, CliResult, PERMISSION_DENIED, SUCCESS};
use crate::output::{print_report, OutputFormat, Report};

#[derive(Serialize)]
struct CheckReport {
    target: String,
    admitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    normalized: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_allowed: Option<bool>,
}

impl CheckReport {
    fn permitted(&self) -> bool {
        self.admitted && self.source_allowed.unwrap_or(true)
    }
}

impl Report for CheckReport {
    fn rows(&self) -> Vec<(&'static str, String)> {
        let mut rows = vec![
            ("target", self.target.clone()),
            ("admitted", self.admitted.to_string()),
        ];
        if let Some(normalized) = &self.normalized {
            rows.push(("normalized", normalized.clone()));
        }
        if let Some(reason) = &self.reason {
            rows.push(("reason", reason.clone()));
        }
        if let Some(source) = self.source {
            rows.push(("source", source.to_string()));
        }
        if let Some(allowed) = self.source_allowed {
            rows.push(("source_allowed", allowed.to_string()));
        }
        rows
    }
}

fn evaluate(
    control: &AdmissionControl,
    target: &ConnectionTarget,
    source: Option<IpAddr>,
) -> CheckReport {
    let (admitted, normalized, reason) = match control.admit(target) {
        Admission::Admitted(normalized) => (true, Some(normalized.to_string()), None),
        Admission::Rejected(reason) => (false, None, Some(reason)),
    };
    CheckReport {
        target: target.to_string(),
        admitted,
        normalized,
        reason,
        source,
        source_allowed: source.map(|addr| control.is_source_allowed(addr)),
    }
}

pub fn run(args: CheckArgs, format: OutputFormat) -> CliResult<i32> {
    let target: ConnectionTarget = args
        .target
        .parse()
        .map_err(|err| frame_error("invalid target", err))?;
    let allow_list = AllowList::parse(&args.allowed_ports, &args.allowed_pipes)
        .map_err(|err| tunnel_error("invalid allow list", err))?;
    let control = AdmissionControl::new(allow_list, parse_firewall(&args.allow_sources)?);

    let report = evaluate(&control, &target, args.source);
    print_report(&report, format);

    if report.permitted() {
        Ok(SUCCESS)
    } else {
        Ok(PERMISSION_DENIED)
    }
}
