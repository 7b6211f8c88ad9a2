// Copyright (c) 2023 The macvtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Port-profile negotiation with the switch: building the
//! associate/disassociate setlink requests for the 802.1Qbg (VSI
//! descriptor via lldpad) and 802.1Qbh (profile id via the kernel)
//! protocols, and polling the link for the switch's response status
//! until success, failure or deadline.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::thread;

use byteorder::{ByteOrder, NativeEndian};
use netlink_packet_core::NLM_F_REQUEST;
use nix::errno::Errno;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::link;
use crate::netlink::msg::{self, MessageBuilder};
use crate::netlink::{Destination, Transport};
use crate::physdev;
use crate::utils::MacAddr;

/// Target function of a port-profile request: either the device
/// itself or one SR-IOV virtual function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfTarget {
    SelfPort,
    Vf(u32),
}

impl VfTarget {
    pub(crate) fn wire(self) -> u32 {
        match self {
            VfTarget::SelfPort => msg::PORT_SELF_VF,
            VfTarget::Vf(index) => index,
        }
    }
}

/// Port profile parameters supplied by the interface definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualPortProfile {
    None,
    /// 802.1Qbg: VSI descriptor, negotiated through lldpad.
    Vsi8021Qbg {
        manager_id: u8,
        /// 24-bit VSI type identifier.
        type_id: u32,
        type_id_version: u8,
        instance_id: Uuid,
    },
    /// 802.1Qbh: named profile, negotiated through the kernel driver.
    Profile8021Qbh { profile_id: String },
}

/// The VM lifecycle operation an attachment happens on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmOperation {
    Create,
    Save,
    Restore,
    Destroy,
    MigrateOut,
    MigrateInStart,
    MigrateInFinish,
    NoOp,
}

impl VmOperation {
    fn as_str(self) -> &'static str {
        match self {
            VmOperation::Create => "create",
            VmOperation::Save => "save",
            VmOperation::Restore => "restore",
            VmOperation::Destroy => "destroy",
            VmOperation::MigrateOut => "migrate out",
            VmOperation::MigrateInStart => "migrate in start",
            VmOperation::MigrateInFinish => "migrate in finish",
            VmOperation::NoOp => "no-op",
        }
    }
}

impl fmt::Display for VmOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmOperation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(VmOperation::Create),
            "save" => Ok(VmOperation::Save),
            "restore" => Ok(VmOperation::Restore),
            "destroy" => Ok(VmOperation::Destroy),
            "migrate out" => Ok(VmOperation::MigrateOut),
            "migrate in start" => Ok(VmOperation::MigrateInStart),
            "migrate in finish" => Ok(VmOperation::MigrateInFinish),
            "no-op" => Ok(VmOperation::NoOp),
            other => Err(format!("unknown vm operation {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortOp {
    Preassociate,
    PreassociateRr,
    Associate,
    Disassociate,
}

impl PortOp {
    fn wire(self) -> u8 {
        match self {
            PortOp::Preassociate => msg::PORT_REQUEST_PREASSOCIATE,
            PortOp::PreassociateRr => msg::PORT_REQUEST_PREASSOCIATE_RR,
            PortOp::Associate => msg::PORT_REQUEST_ASSOCIATE,
            PortOp::Disassociate => msg::PORT_REQUEST_DISASSOCIATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProfileProto {
    Qbg,
    Qbh,
}

/// Switch response to a port-profile request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    InProgress,
    Failure(u16),
}

fn classify(code: u16) -> ResponseStatus {
    match code {
        msg::PORT_VDP_RESPONSE_SUCCESS | msg::PORT_PROFILE_RESPONSE_SUCCESS => {
            ResponseStatus::Success
        }
        msg::PORT_PROFILE_RESPONSE_INPROGRESS => ResponseStatus::InProgress,
        other => ResponseStatus::Failure(other),
    }
}

/// VSI descriptor as carried in IFLA_PORT_VSI_TYPE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Vsi {
    manager_id: u8,
    type_id: u32,
    type_id_version: u8,
}

impl Vsi {
    fn encode(&self) -> [u8; 8] {
        let mut data = [0u8; 8];
        data[0] = self.manager_id;
        data[1] = self.type_id as u8;
        data[2] = (self.type_id >> 8) as u8;
        data[3] = (self.type_id >> 16) as u8;
        data[4] = self.type_id_version;
        data
    }
}

#[derive(Debug, Clone, Default)]
struct PortPayload<'a> {
    profile_id: Option<&'a str>,
    vsi: Option<Vsi>,
    instance_id: Option<Uuid>,
    host_id: Option<Uuid>,
}

fn build_setlink(
    ifname: Option<&str>,
    ifindex: u32,
    mac: Option<&MacAddr>,
    vlan: Option<u16>,
    payload: &PortPayload<'_>,
    vf: VfTarget,
    dest: Destination,
    op: PortOp,
) -> Vec<u8> {
    let mut m = MessageBuilder::new(msg::RTM_SETLINK, NLM_F_REQUEST);
    m.append_ifinfo(ifindex, 0, 0);
    if let Some(name) = ifname {
        m.append_str(msg::IFLA_IFNAME, name);
    }

    if mac.is_some() || vlan.is_some() {
        let list = m.nest_start(msg::IFLA_VFINFO_LIST);
        let info = m.nest_start(msg::IFLA_VF_INFO);
        if let Some(mac) = mac {
            // struct ifla_vf_mac: u32 vf, u8 mac[32]
            let mut data = [0u8; 36];
            NativeEndian::write_u32(&mut data[0..4], vf.wire());
            data[4..10].copy_from_slice(mac.as_bytes());
            m.append(msg::IFLA_VF_MAC, &data);
        }
        if let Some(vlan) = vlan {
            // struct ifla_vf_vlan: u32 vf, u32 vlan, u32 qos
            let mut data = [0u8; 12];
            NativeEndian::write_u32(&mut data[0..4], vf.wire());
            NativeEndian::write_u32(&mut data[4..8], u32::from(vlan));
            m.append(msg::IFLA_VF_VLAN, &data);
        }
        m.nest_end(info);
        m.nest_end(list);
    }

    let (list, port) = if vf == VfTarget::SelfPort && dest == Destination::Kernel {
        (None, m.nest_start(msg::IFLA_PORT_SELF))
    } else {
        let list = m.nest_start(msg::IFLA_VF_PORTS);
        (Some(list), m.nest_start(msg::IFLA_VF_PORT))
    };
    if let Some(profile_id) = payload.profile_id {
        m.append_str(msg::IFLA_PORT_PROFILE, profile_id);
    }
    if let Some(vsi) = &payload.vsi {
        m.append(msg::IFLA_PORT_VSI_TYPE, &vsi.encode());
    }
    if let Some(id) = &payload.instance_id {
        m.append(msg::IFLA_PORT_INSTANCE_UUID, id.as_bytes());
    }
    if let Some(id) = &payload.host_id {
        m.append(msg::IFLA_PORT_HOST_UUID, id.as_bytes());
    }
    if let VfTarget::Vf(_) = vf {
        m.append_u32(msg::IFLA_PORT_VF, vf.wire());
    }
    // some consumers require the operation code to be the final
    // attribute of the port block
    m.append_u8(msg::IFLA_PORT_REQUEST, op.wire());
    m.nest_end(port);
    if let Some(list) = list {
        m.nest_end(list);
    }
    m.finish()
}

fn send_request<T: Transport>(
    tr: &mut T,
    dest: Destination,
    request: &[u8],
    ifindex: u32,
    ifname: Option<&str>,
) -> Result<()> {
    let resp = tr.request(request, dest)?;
    match msg::ack(&resp)? {
        None => Ok(()),
        Some(errno) => Err(Error::LinkOp {
            op: "port-profile setlink",
            name: ifname
                .map(str::to_string)
                .unwrap_or_else(|| format!("ifindex {}", ifindex)),
            errno,
        }),
    }
}

fn block_status(port_attrs: &[msg::Attr<'_>], proto: ProfileProto) -> Result<ResponseStatus> {
    match msg::get_u16(port_attrs, msg::IFLA_PORT_RESPONSE) {
        Some(code) => Ok(classify(code)),
        // 802.1Qbg responses legitimately omit the status attribute
        // while the switch is still working; not a parse error
        None if proto == ProfileProto::Qbg => Ok(ResponseStatus::InProgress),
        None => Err(Error::MalformedResponse(
            "no IFLA_PORT_RESPONSE found in netlink message",
        )),
    }
}

fn port_status(
    attrs_buf: &[u8],
    vf: VfTarget,
    instance_id: Option<&Uuid>,
    dest: Destination,
    proto: ProfileProto,
) -> Result<ResponseStatus> {
    let attrs = msg::parse_attrs(attrs_buf)?;

    if vf == VfTarget::SelfPort && dest == Destination::Kernel {
        let block = msg::get(&attrs, msg::IFLA_PORT_SELF)
            .ok_or(Error::MalformedResponse("IFLA_PORT_SELF is missing"))?;
        return block_status(&msg::parse_attrs(block)?, proto);
    }

    let list = msg::get(&attrs, msg::IFLA_VF_PORTS)
        .ok_or(Error::MalformedResponse("IFLA_VF_PORTS is missing"))?;
    for entry in msg::parse_attrs(list)? {
        if entry.ty != msg::IFLA_VF_PORT {
            return Err(Error::MalformedResponse(
                "unexpected entry in IFLA_VF_PORTS",
            ));
        }
        let port = msg::parse_attrs(entry.data)?;
        let matched = match instance_id {
            Some(id) => {
                msg::get(&port, msg::IFLA_PORT_INSTANCE_UUID) == Some(&id.as_bytes()[..])
                    && msg::get_u32(&port, msg::IFLA_PORT_VF) == Some(vf.wire())
            }
            None => false,
        };
        if matched {
            return block_status(&port, proto);
        }
    }
    Err(Error::NoMatchingResponse)
}

fn poll_status<T: Transport>(
    tr: &mut T,
    cfg: &Config,
    dest: Destination,
    ifindex: u32,
    ifname: Option<&str>,
    vf: VfTarget,
    instance_id: Option<&Uuid>,
    proto: ProfileProto,
) -> Result<()> {
    let mut budget = cfg.status_poll_budget();
    loop {
        let dump = link::link_dump(tr, dest, ifindex, None)?;
        match port_status(&dump.attrs, vf, instance_id, dest, proto)? {
            ResponseStatus::Success => return Ok(()),
            ResponseStatus::Failure(code) => {
                return Err(Error::NegotiationFailed {
                    code,
                    ifname: ifname.unwrap_or_default().to_string(),
                    ifindex,
                })
            }
            ResponseStatus::InProgress => {
                budget -= 1;
                if budget == 0 {
                    return Err(Error::NegotiationTimedOut);
                }
                thread::sleep(cfg.status_poll_interval());
            }
        }
    }
}

/// Send one request and poll for its outcome. An association that
/// was delivered but did not end in success is balanced with one
/// best-effort disassociate so the switch is not left holding a
/// half-done association.
#[allow(clippy::too_many_arguments)]
fn negotiate<T: Transport>(
    tr: &mut T,
    cfg: &Config,
    dest: Destination,
    ifname: Option<&str>,
    ifindex: u32,
    mac: Option<&MacAddr>,
    vlan: Option<u16>,
    payload: PortPayload<'_>,
    vf: VfTarget,
    op: PortOp,
    proto: ProfileProto,
) -> Result<()> {
    let request = build_setlink(ifname, ifindex, mac, vlan, &payload, vf, dest, op);
    send_request(tr, dest, &request, ifindex, ifname)?;

    match poll_status(
        tr,
        cfg,
        dest,
        ifindex,
        ifname,
        vf,
        payload.instance_id.as_ref(),
        proto,
    ) {
        Ok(()) => Ok(()),
        Err(e) => {
            if op != PortOp::Disassociate {
                warn!(
                    sl!(),
                    "association on ifindex {} failed after send, disassociating: {}", ifindex, e
                );
                let rollback = match proto {
                    ProfileProto::Qbg => payload.clone(),
                    ProfileProto::Qbh => PortPayload::default(),
                };
                let request = build_setlink(
                    ifname,
                    ifindex,
                    None,
                    vlan,
                    &rollback,
                    vf,
                    dest,
                    PortOp::Disassociate,
                );
                if send_request(tr, dest, &request, ifindex, ifname).is_ok() {
                    let _ = poll_status(
                        tr,
                        cfg,
                        dest,
                        ifindex,
                        ifname,
                        vf,
                        rollback.instance_id.as_ref(),
                        proto,
                    );
                }
            }
            Err(e)
        }
    }
}

fn op_qbg<T: Transport>(
    tr: &mut T,
    cfg: &Config,
    ifname: &str,
    mac: &MacAddr,
    vsi: Vsi,
    instance_id: Uuid,
    op: PortOp,
) -> Result<()> {
    if op == PortOp::PreassociateRr {
        return Err(Error::UnsupportedOperation("preassociate-rr"));
    }
    let chain = physdev::resolve_chain(tr, ifname)?;
    let payload = PortPayload {
        vsi: Some(vsi),
        instance_id: Some(instance_id),
        ..Default::default()
    };
    negotiate(
        tr,
        cfg,
        Destination::Agent,
        Some(&chain.root_name),
        chain.root_index,
        Some(mac),
        Some(chain.vlan_id.unwrap_or(0)),
        payload,
        VfTarget::SelfPort,
        op,
        ProfileProto::Qbg,
    )
}

fn op_qbh<T: Transport>(
    tr: &mut T,
    cfg: &Config,
    linkdev: &str,
    mac: Option<&MacAddr>,
    profile_id: &str,
    vm_uuid: Option<&Uuid>,
    op: PortOp,
) -> Result<()> {
    let (vf, physfndev) = physdev::resolve_physical_function(&cfg.sysfs_net_root, linkdev)?;
    let ifindex = link::index_of(&physfndev)?.ok_or_else(|| Error::LinkOp {
        op: "ifindex",
        name: physfndev.clone(),
        errno: Errno::ENODEV,
    })?;

    match op {
        PortOp::Associate | PortOp::PreassociateRr => {
            let host_id = host_uuid(&cfg.machine_id_path)?;
            let payload = PortPayload {
                profile_id: Some(profile_id),
                instance_id: vm_uuid.copied(),
                host_id: Some(host_id),
                ..Default::default()
            };
            negotiate(
                tr,
                cfg,
                Destination::Kernel,
                None,
                ifindex,
                mac,
                None,
                payload,
                vf,
                op,
                ProfileProto::Qbh,
            )
        }
        PortOp::Disassociate => negotiate(
            tr,
            cfg,
            Destination::Kernel,
            None,
            ifindex,
            None,
            None,
            PortPayload::default(),
            vf,
            PortOp::Disassociate,
            ProfileProto::Qbh,
        ),
        PortOp::Preassociate => Err(Error::UnsupportedOperation("preassociate")),
    }
}

fn host_uuid(machine_id_path: &Path) -> Result<Uuid> {
    let content = fs::read_to_string(machine_id_path)?;
    Uuid::parse_str(content.trim()).map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad machine id in {}", machine_id_path.display()),
        ))
    })
}

/// Associate the interface's port with its profile. Does nothing for
/// the no-op operation context or when no profile was supplied.
#[allow(clippy::too_many_arguments)]
pub fn associate<T: Transport>(
    tr: &mut T,
    cfg: &Config,
    ifname: &str,
    mac: &MacAddr,
    uplink: &str,
    profile: &VirtualPortProfile,
    vm_uuid: &Uuid,
    vm_op: VmOperation,
) -> Result<()> {
    if vm_op == VmOperation::NoOp {
        return Ok(());
    }
    match profile {
        VirtualPortProfile::None => Ok(()),
        VirtualPortProfile::Vsi8021Qbg {
            manager_id,
            type_id,
            type_id_version,
            instance_id,
        } => {
            debug!(sl!(), "associating 802.1Qbg profile on {} ({})", ifname, vm_op);
            let op = if vm_op == VmOperation::MigrateInStart {
                PortOp::Preassociate
            } else {
                PortOp::Associate
            };
            op_qbg(
                tr,
                cfg,
                ifname,
                mac,
                Vsi {
                    manager_id: *manager_id,
                    type_id: *type_id,
                    type_id_version: *type_id_version,
                },
                *instance_id,
                op,
            )
        }
        VirtualPortProfile::Profile8021Qbh { profile_id } => {
            debug!(sl!(), "associating 802.1Qbh profile on {} ({})", uplink, vm_op);
            let op = if vm_op == VmOperation::MigrateInStart {
                PortOp::PreassociateRr
            } else {
                PortOp::Associate
            };
            op_qbh(tr, cfg, uplink, Some(mac), profile_id, Some(vm_uuid), op)?;
            if vm_op != VmOperation::MigrateInStart {
                link::set_up(tr, uplink)?;
            }
            Ok(())
        }
    }
}

/// Disassociate the interface's port from its profile. Safe to call
/// when no profile was supplied.
pub fn disassociate<T: Transport>(
    tr: &mut T,
    cfg: &Config,
    ifname: &str,
    mac: &MacAddr,
    uplink: &str,
    profile: &VirtualPortProfile,
    vm_op: VmOperation,
) -> Result<()> {
    match profile {
        VirtualPortProfile::None => Ok(()),
        VirtualPortProfile::Vsi8021Qbg {
            manager_id,
            type_id,
            type_id_version,
            instance_id,
        } => {
            debug!(sl!(), "disassociating 802.1Qbg profile on {}", ifname);
            op_qbg(
                tr,
                cfg,
                ifname,
                mac,
                Vsi {
                    manager_id: *manager_id,
                    type_id: *type_id,
                    type_id_version: *type_id_version,
                },
                *instance_id,
                PortOp::Disassociate,
            )
        }
        VirtualPortProfile::Profile8021Qbh { profile_id } => {
            // the migration target already owns the association
            if vm_op == VmOperation::MigrateInFinish {
                return Ok(());
            }
            debug!(sl!(), "disassociating 802.1Qbh profile on {}", uplink);
            if let Err(e) = link::set_down(tr, uplink) {
                warn!(sl!(), "cannot bring {} down before disassociate: {}", uplink, e);
            }
            op_qbh(tr, cfg, uplink, None, profile_id, None, PortOp::Disassociate)
        }
    }
}
