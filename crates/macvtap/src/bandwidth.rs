// Copyright (c) 2023 The macvtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Traffic shaping for the created interface via the `tc` tool:
//! an htb root qdisc for the inbound direction and an ingress
//! policing filter for the outbound one.

use std::process::Command;

use scopeguard::ScopeGuard;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One direction of a shaping request. Rates are kilobytes per
/// second, burst is kilobytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthRate {
    pub average_kbytes: u64,
    #[serde(default)]
    pub peak_kbytes: Option<u64>,
    #[serde(default)]
    pub burst_kbytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bandwidth {
    #[serde(default)]
    pub inbound: Option<BandwidthRate>,
    #[serde(default)]
    pub outbound: Option<BandwidthRate>,
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// The `tc` invocations (without the leading "tc") that install the
/// requested shaping on `ifname`.
fn shaping_commands(ifname: &str, bw: &Bandwidth) -> Vec<Vec<String>> {
    let mut cmds = Vec::new();

    if let Some(rate) = &bw.inbound {
        let average = format!("{}kbps", rate.average_kbytes);
        let peak = format!("{}kbps", rate.peak_kbytes.unwrap_or(rate.average_kbytes));
        let burst = format!("{}kb", rate.burst_kbytes.unwrap_or(rate.average_kbytes));
        cmds.push(args(&[
            "qdisc", "add", "dev", ifname, "root", "handle", "1:", "htb", "default", "1",
        ]));
        cmds.push(args(&[
            "class", "add", "dev", ifname, "parent", "1:", "classid", "1:1", "htb", "rate",
            &average, "ceil", &peak, "burst", &burst,
        ]));
        cmds.push(args(&[
            "filter", "add", "dev", ifname, "parent", "1:0", "protocol", "all", "prio", "1",
            "handle", "1", "fw", "flowid", "1",
        ]));
    }

    if let Some(rate) = &bw.outbound {
        let average = format!("{}kbps", rate.average_kbytes);
        let burst = format!("{}kb", rate.burst_kbytes.unwrap_or(rate.average_kbytes));
        cmds.push(args(&["qdisc", "add", "dev", ifname, "ingress"]));
        cmds.push(args(&[
            "filter", "add", "dev", ifname, "parent", "ffff:", "protocol", "all", "u32", "match",
            "u32", "0", "0", "police", "rate", &average, "burst", &burst, "mtu", "64kb", "drop",
            "flowid", ":1",
        ]));
    }

    cmds
}

fn teardown_commands(ifname: &str) -> Vec<Vec<String>> {
    vec![
        args(&["qdisc", "del", "dev", ifname, "root"]),
        args(&["qdisc", "del", "dev", ifname, "ingress"]),
    ]
}

fn run(cmd_args: &[String]) -> Result<()> {
    let status = Command::new("tc").args(cmd_args).status()?;
    if !status.success() {
        return Err(Error::CommandFailed {
            cmd: format!("tc {}", cmd_args.join(" ")),
            status,
        });
    }
    Ok(())
}

/// Install shaping on the interface. Any partially installed rules
/// are torn down again when one of the commands fails.
pub fn enable(ifname: &str, bw: &Bandwidth) -> Result<()> {
    let cleanup = scopeguard::guard((), |_| {
        let _ = disable(ifname);
    });
    for cmd in shaping_commands(ifname, bw) {
        run(&cmd)?;
    }
    ScopeGuard::into_inner(cleanup);
    Ok(())
}

/// Remove any shaping from the interface. Rules that were never
/// installed make `tc` complain, so failures are only logged.
pub fn disable(ifname: &str) -> Result<()> {
    for cmd in teardown_commands(ifname) {
        if let Err(e) = run(&cmd) {
            debug!(sl!(), "shaping teardown on {}: {}", ifname, e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_commands() {
        let bw = Bandwidth {
            inbound: Some(BandwidthRate {
                average_kbytes: 1000,
                peak_kbytes: Some(4000),
                burst_kbytes: Some(512),
            }),
            outbound: None,
        };
        let cmds = shaping_commands("macvtap0", &bw);
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0][..2], ["qdisc", "add"]);
        assert!(cmds[1].contains(&"1000kbps".to_string()));
        assert!(cmds[1].contains(&"4000kbps".to_string()));
        assert!(cmds[1].contains(&"512kb".to_string()));
        assert_eq!(cmds[2][0], "filter");
    }

    #[test]
    fn test_outbound_burst_defaults_to_average() {
        let bw = Bandwidth {
            inbound: None,
            outbound: Some(BandwidthRate {
                average_kbytes: 2000,
                peak_kbytes: None,
                burst_kbytes: None,
            }),
        };
        let cmds = shaping_commands("macvtap0", &bw);
        assert_eq!(cmds.len(), 2);
        assert!(cmds[0].contains(&"ingress".to_string()));
        assert!(cmds[1].contains(&"2000kbps".to_string()));
        assert!(cmds[1].contains(&"2000kb".to_string()));
    }

    #[test]
    fn test_empty_request_builds_nothing() {
        assert!(shaping_commands("macvtap0", &Bandwidth::default()).is_empty());
    }

    #[test]
    fn test_teardown_covers_both_directions() {
        let cmds = teardown_commands("macvtap0");
        assert_eq!(cmds.len(), 2);
        assert!(cmds[0].contains(&"root".to_string()));
        assert!(cmds[1].contains(&"ingress".to_string()));
    }

    #[test]
    fn test_bandwidth_deserializes_with_defaults() {
        let bw: Bandwidth =
            serde_json::from_str(r#"{"inbound": {"average_kbytes": 100}}"#).unwrap();
        assert_eq!(bw.inbound.unwrap().average_kbytes, 100);
        assert!(bw.outbound.is_none());
    }
}
