// Copyright (c) 2023 The macvtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Opening the character device behind a macvtap interface and
//! putting the tap file descriptor into the requested mode.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::thread;

use crate::config::Config;
use crate::error::{Error, Result};

const TUNGETIFF: libc::c_ulong = 0x8004_54d2;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNGETFEATURES: libc::c_ulong = 0x8004_54cf;

const IFF_VNET_HDR: i16 = 0x4000;

#[repr(C)]
#[derive(Clone, Copy)]
struct IfReqFlags {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifru_flags: i16,
    // pad out the ifr_ifru union
    _pad: [u8; 22],
}

impl Default for IfReqFlags {
    fn default() -> Self {
        IfReqFlags {
            ifr_name: [0; libc::IFNAMSIZ],
            ifru_flags: 0,
            _pad: [0; 22],
        }
    }
}

nix::ioctl_read_bad!(tun_get_iff, TUNGETIFF, IfReqFlags);
nix::ioctl_write_ptr_bad!(tun_set_iff, TUNSETIFF, IfReqFlags);
nix::ioctl_read_bad!(tun_get_features, TUNGETFEATURES, libc::c_uint);

fn ifindex_from_sysfs(cfg: &Config, ifname: &str) -> Result<u32> {
    let path = cfg.sysfs_net_root.join(ifname).join("ifindex");
    let content = fs::read_to_string(&path)?;
    content.trim().parse::<u32>().map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad ifindex in {}", path.display()),
        ))
    })
}

/// Open the `/dev/tapN` node backing the interface. Device nodes show
/// up a moment after link creation, so the open is retried on a short
/// schedule before giving up.
pub fn open_tap(cfg: &Config, ifname: &str) -> Result<(u32, File)> {
    let ifindex = ifindex_from_sysfs(cfg, ifname)?;
    let path = cfg.dev_root.join(format!("tap{}", ifindex));

    let mut attempts = cfg.tap_open_retries;
    loop {
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => return Ok((ifindex, file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempts > 0 => {
                attempts -= 1;
                thread::sleep(cfg.tap_open_wait());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::DeviceNodeNotReady(path.display().to_string()))
            }
            Err(e) => return Err(Error::TapSetup(e)),
        }
    }
}

fn probe_vnet_hdr(tap: &File) -> Result<()> {
    let mut features: libc::c_uint = 0;
    // Shielded behind TUNGETFEATURES because old kernels reject the
    // flag outright at TUNSETIFF time. Kernels that predate the
    // feature query reject the ioctl itself, which means the same
    // thing as the flag being absent.
    if unsafe { tun_get_features(tap.as_raw_fd(), &mut features) }.is_err() {
        return Err(Error::UnsupportedFeature);
    }
    if features & (IFF_VNET_HDR as libc::c_uint) == 0 {
        return Err(Error::UnsupportedFeature);
    }
    Ok(())
}

/// Align the IFF_VNET_HDR flag on the tap descriptor with the
/// caller's request. Failing to clear the flag leaves the reader with
/// frames it cannot parse, so that error is fatal; failing to set it
/// only costs offload performance.
pub fn configure_tap(tap: &File, ifname: &str, vnet_hdr: bool) -> Result<()> {
    let mut req = IfReqFlags::default();
    unsafe { tun_get_iff(tap.as_raw_fd(), &mut req) }
        .map_err(|e| Error::TapSetup(io::Error::from_raw_os_error(e as i32)))?;

    let new_flags = if vnet_hdr {
        match probe_vnet_hdr(tap) {
            Ok(()) => req.ifru_flags | IFF_VNET_HDR,
            Err(Error::UnsupportedFeature) => {
                debug!(sl!(), "tap on {} does not support IFF_VNET_HDR", ifname);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    } else {
        req.ifru_flags & !IFF_VNET_HDR
    };
    if new_flags == req.ifru_flags {
        return Ok(());
    }

    req.ifru_flags = new_flags;
    if let Err(e) = unsafe { tun_set_iff(tap.as_raw_fd(), &req) } {
        if vnet_hdr {
            warn!(
                sl!(),
                "cannot enable IFF_VNET_HDR on {}, continuing without it: {}", ifname, e
            );
            return Ok(());
        }
        return Err(Error::TapSetup(io::Error::from_raw_os_error(e as i32)));
    }
    Ok(())
}
