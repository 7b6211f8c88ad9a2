// Copyright (c) 2023 The macvtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Resolution of the physical device underneath a virtual interface:
//! walking the parent-link chain (keeping the innermost stacked VLAN
//! id), and mapping an SR-IOV virtual function to its physical
//! function through sysfs.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::{Error, Result};
use crate::link::{self, LinkDump};
use crate::netlink::msg;
use crate::netlink::{Destination, Transport};
use crate::vport::VfTarget;

/// Sanity bound on parent-chain length; real stacks are one or two
/// levels deep.
const MAX_CHAIN_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDeviceChain {
    pub root_index: u32,
    pub root_name: String,
    pub vlan_id: Option<u16>,
}

fn vlan_id_of(dump: &LinkDump) -> Result<Option<u16>> {
    let attrs = msg::parse_attrs(&dump.attrs)?;
    let linkinfo = match msg::get(&attrs, msg::IFLA_LINKINFO) {
        Some(data) => msg::parse_attrs(data)?,
        None => return Ok(None),
    };
    if msg::get_str(&linkinfo, msg::IFLA_INFO_KIND) != Some("vlan") {
        return Ok(None);
    }
    let data = match msg::get(&linkinfo, msg::IFLA_INFO_DATA) {
        Some(data) => msg::parse_attrs(data)?,
        None => return Ok(None),
    };
    Ok(msg::get_u16(&data, msg::IFLA_VLAN_ID))
}

/// Walk the parent-device chain of `name` up to the root physical
/// device. The first VLAN id encountered on the way is kept.
pub fn resolve_chain<T: Transport>(tr: &mut T, name: &str) -> Result<PhysicalDeviceChain> {
    let mut dump = link_by_name(tr, name)?;
    let mut vlan_id = None;

    for _ in 0..MAX_CHAIN_DEPTH {
        let attrs = msg::parse_attrs(&dump.attrs)?;
        match msg::get_u32(&attrs, msg::IFLA_LINK) {
            None => {
                let root_name = msg::get_str(&attrs, msg::IFLA_IFNAME)
                    .ok_or(Error::MalformedResponse("link dump lacks IFLA_IFNAME"))?
                    .to_string();
                return Ok(PhysicalDeviceChain {
                    root_index: dump.index,
                    root_name,
                    vlan_id,
                });
            }
            Some(parent) => {
                dump = link::link_dump(tr, Destination::Kernel, parent, None)?;
                if vlan_id.is_none() {
                    vlan_id = vlan_id_of(&dump)?;
                }
            }
        }
    }
    Err(Error::MalformedResponse("device parent chain too deep"))
}

fn link_by_name<T: Transport>(tr: &mut T, name: &str) -> Result<LinkDump> {
    link::link_dump(tr, Destination::Kernel, 0, Some(name))
}

fn not_found(what: String) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::NotFound, what))
}

fn is_virtual_function(sysfs_net_root: &Path, dev: &str) -> bool {
    sysfs_net_root.join(dev).join("device/physfn").is_dir()
}

fn physical_function_of(sysfs_net_root: &Path, dev: &str) -> Result<String> {
    let net_dir = sysfs_net_root.join(dev).join("device/physfn/net");
    for entry in fs::read_dir(&net_dir)? {
        return Ok(entry?.file_name().to_string_lossy().into_owned());
    }
    Err(not_found(format!(
        "no interface under {}",
        net_dir.display()
    )))
}

fn virtual_function_index(sysfs_net_root: &Path, pf: &str, vf: &str) -> Result<u32> {
    let target = fs::canonicalize(sysfs_net_root.join(vf).join("device"))?;
    let pf_device = sysfs_net_root.join(pf).join("device");
    let mut i = 0;
    loop {
        let virtfn = pf_device.join(format!("virtfn{}", i));
        if !virtfn.exists() {
            return Err(not_found(format!(
                "{} is not a virtual function of {}",
                vf, pf
            )));
        }
        if fs::canonicalize(&virtfn)? == target {
            return Ok(i);
        }
        i += 1;
    }
}

/// If `linkdev` is an SR-IOV virtual function, return its index and
/// the physical function's interface name; otherwise the device is
/// its own port.
pub fn resolve_physical_function(
    sysfs_net_root: &Path,
    linkdev: &str,
) -> Result<(VfTarget, String)> {
    if !is_virtual_function(sysfs_net_root, linkdev) {
        return Ok((VfTarget::SelfPort, linkdev.to_string()));
    }
    let pf = physical_function_of(sysfs_net_root, linkdev)?;
    let index = virtual_function_index(sysfs_net_root, &pf, linkdev)?;
    Ok((VfTarget::Vf(index), pf))
}
