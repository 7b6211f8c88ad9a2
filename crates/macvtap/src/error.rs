// Copyright (c) 2023 The macvtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The netlink message could not be delivered at all.
    #[error("netlink transport failure: {0}")]
    Transport(#[source] std::io::Error),

    /// The response buffer was truncated, had the wrong message type,
    /// or lacked a required attribute.
    #[error("malformed netlink response: {0}")]
    MalformedResponse(&'static str),

    /// A VF ports list contained no entry matching the request's
    /// instance UUID and VF index.
    #[error("could not find netlink response with expected parameters")]
    NoMatchingResponse,

    /// The lldpad PID file is missing, unreadable, empty or does not
    /// hold a bare non-zero decimal integer.
    #[error("lldpad agent unavailable: {0}")]
    AgentUnavailable(String),

    #[error("interface {0} already exists")]
    NameInUse(String),

    #[error("cannot create interface {name}: {errno}")]
    DeviceCreateFailed {
        name: String,
        errno: Errno,
        retryable: bool,
    },

    /// The tap character device never materialized within the retry
    /// budget.
    #[error("tap device node {0} did not appear")]
    DeviceNodeNotReady(String),

    /// Internal only: the kernel does not support a requested tap
    /// feature. Callers treat this as a non-fatal branch.
    #[error("tap feature not supported by kernel")]
    UnsupportedFeature,

    #[error("error {code} during port-profile setlink on interface {ifname} ({ifindex})")]
    NegotiationFailed {
        code: u16,
        ifname: String,
        ifindex: u32,
    },

    #[error("port-profile setlink timed out")]
    NegotiationTimedOut,

    #[error("operation type {0} not supported for this port profile")]
    UnsupportedOperation(&'static str),

    #[error("netlink {op} failed for {name}: {errno}")]
    LinkOp {
        op: &'static str,
        name: String,
        errno: Errno,
    },

    #[error("command {cmd} exited with {status}")]
    CommandFailed {
        cmd: String,
        status: std::process::ExitStatus,
    },

    #[error("cannot configure tap device: {0}")]
    TapSetup(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
