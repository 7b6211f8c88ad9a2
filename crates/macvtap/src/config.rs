// Copyright (c) 2023 The macvtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for interface naming, negotiation polling and the
/// external paths this crate depends on. `Default` carries the
/// values the kernel/lldpad deployments expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prefix of auto-generated interface names ("macvtap" yields
    /// macvtap0, macvtap1, ...).
    pub if_prefix: String,
    /// Upper bound on auto-generated name candidates per creation.
    pub max_name_candidates: u32,
    /// Budget for retryable link-creation failures.
    pub create_retries: u32,
    /// Retries while waiting for udev to create the tap device node.
    pub tap_open_retries: u32,
    pub tap_open_wait_ms: u64,
    /// Total port-profile negotiation deadline.
    pub status_poll_timeout_ms: u64,
    /// Interval between port-profile status polls.
    pub status_poll_interval_ms: u64,
    pub lldpad_pid_path: PathBuf,
    pub sysfs_net_root: PathBuf,
    pub dev_root: PathBuf,
    pub machine_id_path: PathBuf,
    /// Where original uplink MAC addresses are saved for passthrough
    /// mode restoration.
    pub state_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            if_prefix: "macvtap".to_string(),
            max_name_candidates: 8192,
            create_retries: 5,
            tap_open_retries: 10,
            tap_open_wait_ms: 20,
            status_poll_timeout_ms: 10_000,
            status_poll_interval_ms: 125,
            lldpad_pid_path: PathBuf::from("/var/run/lldpad.pid"),
            sysfs_net_root: PathBuf::from("/sys/class/net"),
            dev_root: PathBuf::from("/dev"),
            machine_id_path: PathBuf::from("/etc/machine-id"),
            state_dir: PathBuf::from("/var/run/macvtap"),
        }
    }
}

impl Config {
    pub fn status_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.status_poll_timeout_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn tap_open_wait(&self) -> Duration {
        Duration::from_millis(self.tap_open_wait_ms)
    }

    /// Bounded number of status polls derived from deadline and
    /// interval, always at least one.
    pub fn status_poll_budget(&self) -> u64 {
        std::cmp::max(
            1,
            self.status_poll_timeout_ms / std::cmp::max(1, self.status_poll_interval_ms),
        )
    }
}
