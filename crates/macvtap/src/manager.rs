// Copyright (c) 2023 The macvtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Attachment lifecycle: name selection, device creation, profile
//! association, tap setup and the compensating teardown that runs
//! when any later step fails.

use std::fmt;
use std::fs::File;
use std::str::FromStr;

use uuid::Uuid;

use crate::bandwidth::{self, Bandwidth};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::link;
use crate::netlink::{RouteSocket, Transport};
use crate::tap;
use crate::utils::MacAddr;
use crate::vport::{self, VirtualPortProfile, VmOperation};

/// Forwarding mode of the created interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacvtapMode {
    Vepa,
    Private,
    Bridge,
    Passthrough,
}

impl MacvtapMode {
    fn kernel_mode(self) -> u32 {
        match self {
            MacvtapMode::Vepa => crate::netlink::msg::MACVLAN_MODE_VEPA,
            MacvtapMode::Private => crate::netlink::msg::MACVLAN_MODE_PRIVATE,
            MacvtapMode::Bridge => crate::netlink::msg::MACVLAN_MODE_BRIDGE,
            MacvtapMode::Passthrough => crate::netlink::msg::MACVLAN_MODE_PASSTHRU,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            MacvtapMode::Vepa => "vepa",
            MacvtapMode::Private => "private",
            MacvtapMode::Bridge => "bridge",
            MacvtapMode::Passthrough => "passthrough",
        }
    }
}

impl fmt::Display for MacvtapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MacvtapMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "vepa" => Ok(MacvtapMode::Vepa),
            "private" => Ok(MacvtapMode::Private),
            "bridge" => Ok(MacvtapMode::Bridge),
            "passthrough" => Ok(MacvtapMode::Passthrough),
            other => Err(format!("unknown macvtap mode {:?}", other)),
        }
    }
}

/// Everything needed to attach one virtual NIC.
#[derive(Debug, Clone)]
pub struct AttachRequest {
    /// Requested interface name; `None` picks the first free
    /// generated one.
    pub ifname: Option<String>,
    pub mac: MacAddr,
    /// Physical device (or VLAN on top of one) to bind to.
    pub uplink: String,
    pub mode: MacvtapMode,
    pub vnet_hdr: bool,
    pub vm_uuid: Uuid,
    pub profile: VirtualPortProfile,
    pub vm_op: VmOperation,
    pub bandwidth: Option<Bandwidth>,
}

#[derive(Debug, Clone)]
pub struct DetachRequest {
    pub ifname: String,
    pub mac: MacAddr,
    pub uplink: String,
    pub mode: MacvtapMode,
    pub profile: VirtualPortProfile,
    pub vm_op: VmOperation,
}

/// A successfully attached interface together with its opened tap.
#[derive(Debug)]
pub struct VirtualInterface {
    pub name: String,
    pub index: u32,
    pub mode: MacvtapMode,
    pub vnet_hdr: bool,
    pub tap: File,
}

/// The side effects the lifecycle touches, behind a seam so the
/// ordering logic can be exercised without a kernel.
pub(crate) trait DeviceOps {
    fn index_of(&mut self, name: &str) -> Result<Option<u32>>;
    fn create_macvtap(&mut self, name: &str, req: &AttachRequest) -> Result<()>;
    fn delete_link(&mut self, name: &str) -> Result<()>;
    fn set_link_up(&mut self, name: &str) -> Result<()>;
    fn replace_mac(&mut self, uplink: &str, mac: &MacAddr) -> Result<()>;
    fn restore_mac(&mut self, uplink: &str) -> Result<()>;
    fn associate(&mut self, ifname: &str, req: &AttachRequest) -> Result<()>;
    fn disassociate(
        &mut self,
        ifname: &str,
        mac: &MacAddr,
        uplink: &str,
        profile: &VirtualPortProfile,
        vm_op: VmOperation,
    ) -> Result<()>;
    fn open_tap(&mut self, ifname: &str) -> Result<(u32, File)>;
    fn configure_tap(&mut self, tap: &File, ifname: &str, vnet_hdr: bool) -> Result<()>;
    fn apply_bandwidth(&mut self, ifname: &str, bw: &Bandwidth) -> Result<()>;
    fn remove_bandwidth(&mut self, ifname: &str) -> Result<()>;
}

pub(crate) struct SysDeviceOps<'a, T: Transport> {
    tr: &'a mut T,
    cfg: &'a Config,
}

impl<'a, T: Transport> SysDeviceOps<'a, T> {
    pub(crate) fn new(tr: &'a mut T, cfg: &'a Config) -> Self {
        SysDeviceOps { tr, cfg }
    }
}

impl<'a, T: Transport> DeviceOps for SysDeviceOps<'a, T> {
    fn index_of(&mut self, name: &str) -> Result<Option<u32>> {
        link::index_of(name)
    }

    fn create_macvtap(&mut self, name: &str, req: &AttachRequest) -> Result<()> {
        let uplink_index = link::index_of(&req.uplink)?.ok_or_else(|| Error::LinkOp {
            op: "ifindex",
            name: req.uplink.clone(),
            errno: nix::errno::Errno::ENODEV,
        })?;
        link::add_macvtap(self.tr, name, uplink_index, &req.mac, req.mode.kernel_mode())
    }

    fn delete_link(&mut self, name: &str) -> Result<()> {
        link::del_link(self.tr, name)
    }

    fn set_link_up(&mut self, name: &str) -> Result<()> {
        link::set_up(self.tr, name)
    }

    fn replace_mac(&mut self, uplink: &str, mac: &MacAddr) -> Result<()> {
        link::replace_mac(self.tr, self.cfg, uplink, mac)
    }

    fn restore_mac(&mut self, uplink: &str) -> Result<()> {
        link::restore_mac(self.tr, self.cfg, uplink)
    }

    fn associate(&mut self, ifname: &str, req: &AttachRequest) -> Result<()> {
        vport::associate(
            self.tr,
            self.cfg,
            ifname,
            &req.mac,
            &req.uplink,
            &req.profile,
            &req.vm_uuid,
            req.vm_op,
        )
    }

    fn disassociate(
        &mut self,
        ifname: &str,
        mac: &MacAddr,
        uplink: &str,
        profile: &VirtualPortProfile,
        vm_op: VmOperation,
    ) -> Result<()> {
        vport::disassociate(self.tr, self.cfg, ifname, mac, uplink, profile, vm_op)
    }

    fn open_tap(&mut self, ifname: &str) -> Result<(u32, File)> {
        tap::open_tap(self.cfg, ifname)
    }

    fn configure_tap(&mut self, tap: &File, ifname: &str, vnet_hdr: bool) -> Result<()> {
        tap::configure_tap(tap, ifname, vnet_hdr)
    }

    fn apply_bandwidth(&mut self, ifname: &str, bw: &Bandwidth) -> Result<()> {
        bandwidth::enable(ifname, bw)
    }

    fn remove_bandwidth(&mut self, ifname: &str) -> Result<()> {
        bandwidth::disable(ifname)
    }
}

/// Create the device under the requested name, or pick the first free
/// generated name. A name that exists but carries the generated
/// prefix belongs to a previous incarnation, so the request falls
/// through to auto-generation instead of failing.
fn create_interface<O: DeviceOps>(
    ops: &mut O,
    cfg: &Config,
    req: &AttachRequest,
) -> Result<String> {
    if let Some(name) = &req.ifname {
        if ops.index_of(name)?.is_none() {
            ops.create_macvtap(name, req)?;
            return Ok(name.clone());
        }
        if !name.starts_with(&cfg.if_prefix) {
            return Err(Error::NameInUse(name.clone()));
        }
        debug!(sl!(), "{} already exists, picking a generated name", name);
    }

    let mut retries = cfg.create_retries;
    for i in 0..cfg.max_name_candidates {
        let name = format!("{}{}", cfg.if_prefix, i);
        // names already taken cost nothing; only the kernel turning
        // down a create consumes the retry budget
        if ops.index_of(&name)?.is_some() {
            continue;
        }
        match ops.create_macvtap(&name, req) {
            Ok(()) => return Ok(name),
            Err(e @ Error::DeviceCreateFailed { retryable: true, .. }) => {
                retries -= 1;
                if retries == 0 {
                    return Err(e);
                }
                debug!(sl!(), "lost the race for {}, trying the next name", name);
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::NameInUse(format!(
        "{}0..{}",
        cfg.if_prefix, cfg.max_name_candidates
    )))
}

enum Compensation {
    RestoreMac,
    DeleteLink(String),
    Disassociate(String),
}

fn unwind<O: DeviceOps>(ops: &mut O, req: &AttachRequest, comps: Vec<Compensation>) {
    for comp in comps.into_iter().rev() {
        let outcome = match &comp {
            Compensation::Disassociate(name) => ops.disassociate(
                name,
                &req.mac,
                &req.uplink,
                &req.profile,
                VmOperation::Destroy,
            ),
            Compensation::DeleteLink(name) => ops.delete_link(name),
            Compensation::RestoreMac => ops.restore_mac(&req.uplink),
        };
        if let Err(e) = outcome {
            warn!(sl!(), "cleanup of failed attach: {}", e);
        }
    }
}

pub(crate) fn attach<O: DeviceOps>(
    ops: &mut O,
    cfg: &Config,
    req: &AttachRequest,
) -> Result<VirtualInterface> {
    let mut comps = Vec::new();
    match try_attach(ops, cfg, req, &mut comps) {
        Ok(vif) => Ok(vif),
        Err(e) => {
            unwind(ops, req, comps);
            Err(e)
        }
    }
}

fn try_attach<O: DeviceOps>(
    ops: &mut O,
    cfg: &Config,
    req: &AttachRequest,
    comps: &mut Vec<Compensation>,
) -> Result<VirtualInterface> {
    if req.mode == MacvtapMode::Passthrough {
        // in passthrough mode the guest MAC lives on the uplink itself
        ops.replace_mac(&req.uplink, &req.mac)?;
        comps.push(Compensation::RestoreMac);
    }

    let name = create_interface(ops, cfg, req)?;
    comps.push(Compensation::DeleteLink(name.clone()));

    ops.associate(&name, req)?;
    comps.push(Compensation::Disassociate(name.clone()));

    ops.set_link_up(&name)?;
    let (index, tap) = ops.open_tap(&name)?;
    ops.configure_tap(&tap, &name, req.vnet_hdr)?;
    if let Some(bw) = &req.bandwidth {
        ops.apply_bandwidth(&name, bw)?;
    }

    info!(
        sl!(),
        "attached {} (index {}, mode {}) on {}", name, index, req.mode, req.uplink
    );
    Ok(VirtualInterface {
        name,
        index,
        mode: req.mode,
        vnet_hdr: req.vnet_hdr,
        tap,
    })
}

/// Tear the interface down. Every step is attempted even when an
/// earlier one fails; the first failure is the one reported.
pub(crate) fn detach<O: DeviceOps>(ops: &mut O, req: &DetachRequest) -> Result<()> {
    let mut first_err = None;

    // shaping may or may not be installed; removal is best-effort
    if let Err(e) = ops.remove_bandwidth(&req.ifname) {
        debug!(sl!(), "removing shaping from {}: {}", req.ifname, e);
    }
    if req.mode == MacvtapMode::Passthrough {
        if let Err(e) = ops.restore_mac(&req.uplink) {
            warn!(sl!(), "restoring {} hardware address: {}", req.uplink, e);
            first_err.get_or_insert(e);
        }
    }
    if let Err(e) = ops.disassociate(&req.ifname, &req.mac, &req.uplink, &req.profile, req.vm_op) {
        warn!(sl!(), "disassociating {}: {}", req.ifname, e);
        first_err.get_or_insert(e);
    }
    if let Err(e) = ops.delete_link(&req.ifname) {
        warn!(sl!(), "deleting {}: {}", req.ifname, e);
        first_err.get_or_insert(e);
    }

    match first_err {
        None => {
            info!(sl!(), "detached {}", req.ifname);
            Ok(())
        }
        Some(e) => Err(e),
    }
}

/// Create a macvtap interface per the request and hand back its
/// opened tap device.
pub fn open_macvtap(cfg: &Config, req: &AttachRequest) -> Result<VirtualInterface> {
    let mut tr = RouteSocket::new(cfg)?;
    let mut ops = SysDeviceOps::new(&mut tr, cfg);
    attach(&mut ops, cfg, req)
}

/// Remove a macvtap interface created by [`open_macvtap`].
pub fn del_macvtap(cfg: &Config, req: &DetachRequest) -> Result<()> {
    let mut tr = RouteSocket::new(cfg)?;
    let mut ops = SysDeviceOps::new(&mut tr, cfg);
    detach(&mut ops, req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use std::collections::HashSet;

    /// Scripted stand-in recording every call in order.
    #[derive(Default)]
    struct MockOps {
        existing: HashSet<String>,
        create_failures: Vec<Error>,
        fail_set_up: bool,
        fail_associate: bool,
        fail_open_tap: bool,
        calls: Vec<String>,
    }

    impl MockOps {
        fn retryable_failure() -> Error {
            Error::DeviceCreateFailed {
                name: "x".to_string(),
                errno: Errno::EEXIST,
                retryable: true,
            }
        }
    }

    impl DeviceOps for MockOps {
        fn index_of(&mut self, name: &str) -> Result<Option<u32>> {
            self.calls.push(format!("index_of {}", name));
            Ok(if self.existing.contains(name) {
                Some(1)
            } else {
                None
            })
        }

        fn create_macvtap(&mut self, name: &str, _req: &AttachRequest) -> Result<()> {
            self.calls.push(format!("create {}", name));
            match self.create_failures.pop() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn delete_link(&mut self, name: &str) -> Result<()> {
            self.calls.push(format!("delete {}", name));
            Ok(())
        }

        fn set_link_up(&mut self, name: &str) -> Result<()> {
            self.calls.push(format!("set_up {}", name));
            if self.fail_set_up {
                return Err(Error::LinkOp {
                    op: "setlink flags",
                    name: name.to_string(),
                    errno: Errno::EPERM,
                });
            }
            Ok(())
        }

        fn replace_mac(&mut self, uplink: &str, _mac: &MacAddr) -> Result<()> {
            self.calls.push(format!("replace_mac {}", uplink));
            Ok(())
        }

        fn restore_mac(&mut self, uplink: &str) -> Result<()> {
            self.calls.push(format!("restore_mac {}", uplink));
            Ok(())
        }

        fn associate(&mut self, ifname: &str, _req: &AttachRequest) -> Result<()> {
            self.calls.push(format!("associate {}", ifname));
            if self.fail_associate {
                return Err(Error::NegotiationTimedOut);
            }
            Ok(())
        }

        fn disassociate(
            &mut self,
            ifname: &str,
            _mac: &MacAddr,
            _uplink: &str,
            _profile: &VirtualPortProfile,
            _vm_op: VmOperation,
        ) -> Result<()> {
            self.calls.push(format!("disassociate {}", ifname));
            Ok(())
        }

        fn open_tap(&mut self, ifname: &str) -> Result<(u32, File)> {
            self.calls.push(format!("open_tap {}", ifname));
            if self.fail_open_tap {
                return Err(Error::DeviceNodeNotReady("/dev/tap1".to_string()));
            }
            Ok((7, tempfile::tempfile()?))
        }

        fn configure_tap(&mut self, _tap: &File, ifname: &str, _vnet_hdr: bool) -> Result<()> {
            self.calls.push(format!("configure_tap {}", ifname));
            Ok(())
        }

        fn apply_bandwidth(&mut self, ifname: &str, _bw: &Bandwidth) -> Result<()> {
            self.calls.push(format!("bandwidth {}", ifname));
            Ok(())
        }

        fn remove_bandwidth(&mut self, ifname: &str) -> Result<()> {
            self.calls.push(format!("remove_bandwidth {}", ifname));
            Ok(())
        }
    }

    fn test_request() -> AttachRequest {
        AttachRequest {
            ifname: None,
            mac: MacAddr::parse("52:54:00:aa:bb:cc").unwrap(),
            uplink: "eth0".to_string(),
            mode: MacvtapMode::Vepa,
            vnet_hdr: false,
            vm_uuid: Uuid::new_v4(),
            profile: VirtualPortProfile::None,
            vm_op: VmOperation::Create,
            bandwidth: None,
        }
    }

    #[test]
    fn test_attach_happy_path() {
        crate::init_test_logger();
        let mut ops = MockOps::default();
        let vif = attach(&mut ops, &Config::default(), &test_request()).unwrap();
        assert_eq!(vif.name, "macvtap0");
        assert_eq!(vif.index, 7);
        assert_eq!(
            ops.calls,
            vec![
                "index_of macvtap0",
                "create macvtap0",
                "associate macvtap0",
                "set_up macvtap0",
                "open_tap macvtap0",
                "configure_tap macvtap0",
            ]
        );
    }

    #[test]
    fn test_generated_name_skips_occupied() {
        crate::init_test_logger();
        let cfg = Config {
            if_prefix: "probe".to_string(),
            ..Default::default()
        };
        let mut ops = MockOps {
            existing: ["probe0", "probe1", "probe2"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ..Default::default()
        };
        let name = create_interface(&mut ops, &cfg, &test_request()).unwrap();
        assert_eq!(name, "probe3");
        // occupied names never reach the kernel or the retry budget
        assert_eq!(ops.calls.iter().filter(|c| c.starts_with("create")).count(), 1);
    }

    #[test]
    fn test_create_retry_budget() {
        crate::init_test_logger();
        let cfg = Config::default();
        let mut ops = MockOps {
            create_failures: (0..5).map(|_| MockOps::retryable_failure()).collect(),
            ..Default::default()
        };
        let err = create_interface(&mut ops, &cfg, &test_request()).unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceCreateFailed { retryable: true, .. }
        ));
        assert_eq!(
            ops.calls.iter().filter(|c| c.starts_with("create")).count(),
            cfg.create_retries as usize
        );

        // one fewer failure and the next candidate succeeds
        let mut ops = MockOps {
            create_failures: (0..4).map(|_| MockOps::retryable_failure()).collect(),
            ..Default::default()
        };
        assert_eq!(
            create_interface(&mut ops, &cfg, &test_request()).unwrap(),
            "macvtap4"
        );
    }

    #[test]
    fn test_non_retryable_create_fails_immediately() {
        crate::init_test_logger();
        let mut ops = MockOps {
            create_failures: vec![Error::DeviceCreateFailed {
                name: "macvtap0".to_string(),
                errno: Errno::EPERM,
                retryable: false,
            }],
            ..Default::default()
        };
        let err = create_interface(&mut ops, &Config::default(), &test_request()).unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceCreateFailed {
                errno: Errno::EPERM,
                ..
            }
        ));
        assert_eq!(ops.calls.iter().filter(|c| c.starts_with("create")).count(), 1);
    }

    #[test]
    fn test_requested_name_in_use() {
        crate::init_test_logger();
        let mut req = test_request();
        req.ifname = Some("ens3".to_string());
        let mut ops = MockOps {
            existing: ["ens3"].iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let err = create_interface(&mut ops, &Config::default(), &req).unwrap_err();
        assert!(matches!(err, Error::NameInUse(name) if name == "ens3"));

        // a stale generated name falls through to auto-generation
        let mut req = test_request();
        req.ifname = Some("macvtap0".to_string());
        let mut ops = MockOps {
            existing: ["macvtap0"].iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        assert_eq!(
            create_interface(&mut ops, &Config::default(), &req).unwrap(),
            "macvtap1"
        );
    }

    #[test]
    fn test_set_up_failure_unwinds_in_reverse() {
        crate::init_test_logger();
        let mut ops = MockOps {
            fail_set_up: true,
            ..Default::default()
        };
        let err = attach(&mut ops, &Config::default(), &test_request()).unwrap_err();
        assert!(matches!(err, Error::LinkOp { .. }));
        assert_eq!(
            ops.calls[3..],
            ["set_up macvtap0", "disassociate macvtap0", "delete macvtap0"]
        );
    }

    #[test]
    fn test_associate_failure_deletes_but_never_disassociates() {
        crate::init_test_logger();
        let mut ops = MockOps {
            fail_associate: true,
            ..Default::default()
        };
        let err = attach(&mut ops, &Config::default(), &test_request()).unwrap_err();
        assert!(matches!(err, Error::NegotiationTimedOut));
        assert_eq!(ops.calls[2..], ["associate macvtap0", "delete macvtap0"]);
    }

    #[test]
    fn test_tap_failure_disassociates_and_deletes() {
        crate::init_test_logger();
        let mut ops = MockOps {
            fail_open_tap: true,
            ..Default::default()
        };
        let err = attach(&mut ops, &Config::default(), &test_request()).unwrap_err();
        assert!(matches!(err, Error::DeviceNodeNotReady(_)));
        assert_eq!(
            ops.calls[4..],
            ["open_tap macvtap0", "disassociate macvtap0", "delete macvtap0"]
        );
    }

    #[test]
    fn test_passthrough_restores_mac_on_failed_create() {
        crate::init_test_logger();
        let mut req = test_request();
        req.mode = MacvtapMode::Passthrough;
        let mut ops = MockOps {
            create_failures: vec![Error::DeviceCreateFailed {
                name: "macvtap0".to_string(),
                errno: Errno::EPERM,
                retryable: false,
            }],
            ..Default::default()
        };
        attach(&mut ops, &Config::default(), &req).unwrap_err();
        assert_eq!(ops.calls[0], "replace_mac eth0");
        assert_eq!(ops.calls.last().unwrap(), "restore_mac eth0");
        // no link existed yet, so nothing to disassociate or delete
        assert!(!ops.calls.iter().any(|c| c.starts_with("disassociate")));
        assert!(!ops.calls.iter().any(|c| c.starts_with("delete")));
    }

    #[test]
    fn test_bandwidth_applied_after_tap_setup() {
        crate::init_test_logger();
        let mut req = test_request();
        req.bandwidth = Some(Bandwidth::default());
        let mut ops = MockOps::default();
        attach(&mut ops, &Config::default(), &req).unwrap();
        assert_eq!(ops.calls.last().unwrap(), "bandwidth macvtap0");
    }

    #[test]
    fn test_detach_attempts_every_step() {
        crate::init_test_logger();

        struct FailingOps {
            calls: Vec<String>,
        }

        impl DeviceOps for FailingOps {
            fn index_of(&mut self, _name: &str) -> Result<Option<u32>> {
                Ok(None)
            }
            fn create_macvtap(&mut self, _name: &str, _req: &AttachRequest) -> Result<()> {
                Ok(())
            }
            fn delete_link(&mut self, name: &str) -> Result<()> {
                self.calls.push(format!("delete {}", name));
                Ok(())
            }
            fn set_link_up(&mut self, _name: &str) -> Result<()> {
                Ok(())
            }
            fn replace_mac(&mut self, _uplink: &str, _mac: &MacAddr) -> Result<()> {
                Ok(())
            }
            fn restore_mac(&mut self, uplink: &str) -> Result<()> {
                self.calls.push(format!("restore_mac {}", uplink));
                Err(Error::LinkOp {
                    op: "setlink address",
                    name: uplink.to_string(),
                    errno: Errno::EPERM,
                })
            }
            fn associate(&mut self, _ifname: &str, _req: &AttachRequest) -> Result<()> {
                Ok(())
            }
            fn disassociate(
                &mut self,
                ifname: &str,
                _mac: &MacAddr,
                _uplink: &str,
                _profile: &VirtualPortProfile,
                _vm_op: VmOperation,
            ) -> Result<()> {
                self.calls.push(format!("disassociate {}", ifname));
                Err(Error::NegotiationTimedOut)
            }
            fn open_tap(&mut self, _ifname: &str) -> Result<(u32, File)> {
                Ok((0, tempfile::tempfile()?))
            }
            fn configure_tap(&mut self, _tap: &File, _ifname: &str, _vnet: bool) -> Result<()> {
                Ok(())
            }
            fn apply_bandwidth(&mut self, _ifname: &str, _bw: &Bandwidth) -> Result<()> {
                Ok(())
            }
            fn remove_bandwidth(&mut self, ifname: &str) -> Result<()> {
                use std::os::unix::process::ExitStatusExt;
                self.calls.push(format!("remove_bandwidth {}", ifname));
                Err(Error::CommandFailed {
                    cmd: "tc qdisc del".to_string(),
                    status: std::process::ExitStatus::from_raw(256),
                })
            }
        }

        let req = DetachRequest {
            ifname: "macvtap0".to_string(),
            mac: MacAddr::parse("52:54:00:aa:bb:cc").unwrap(),
            uplink: "eth0".to_string(),
            mode: MacvtapMode::Passthrough,
            profile: VirtualPortProfile::None,
            vm_op: VmOperation::Destroy,
        };
        let mut ops = FailingOps { calls: Vec::new() };
        let err = detach(&mut ops, &req).unwrap_err();
        // the first non-shaping failure wins, later steps still run,
        // and a failed shaping removal stays below the error surface
        assert!(matches!(err, Error::LinkOp { .. }));
        assert_eq!(
            ops.calls,
            vec![
                "remove_bandwidth macvtap0",
                "restore_mac eth0",
                "disassociate macvtap0",
                "delete macvtap0"
            ]
        );
    }

    #[test]
    fn test_detach_removes_bandwidth() {
        crate::init_test_logger();
        let req = DetachRequest {
            ifname: "macvtap0".to_string(),
            mac: MacAddr::parse("52:54:00:aa:bb:cc").unwrap(),
            uplink: "eth0".to_string(),
            mode: MacvtapMode::Vepa,
            profile: VirtualPortProfile::None,
            vm_op: VmOperation::Destroy,
        };
        let mut ops = MockOps::default();
        detach(&mut ops, &req).unwrap();
        assert_eq!(
            ops.calls,
            vec![
                "remove_bandwidth macvtap0",
                "disassociate macvtap0",
                "delete macvtap0"
            ]
        );
    }

    #[test]
    fn test_mode_strings() {
        for mode in [
            MacvtapMode::Vepa,
            MacvtapMode::Private,
            MacvtapMode::Bridge,
            MacvtapMode::Passthrough,
        ] {
            assert_eq!(mode.to_string().parse::<MacvtapMode>().unwrap(), mode);
        }
        assert!("taxi".parse::<MacvtapMode>().is_err());
    }
}
