// Copyright (c) 2023 The macvtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Link-level operations over the netlink transport: index lookup,
//! macvtap link creation/deletion, administrative state, hardware
//! address replacement with state-dir persistence, and targeted link
//! dumps used by the resolver and the port-profile negotiator.

use std::fs;
use std::io;
use std::path::Path;

use byteorder::{ByteOrder, NativeEndian};
use netlink_packet_core::{NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST};
use nix::errno::Errno;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::netlink::msg::{self, MessageBuilder};
use crate::netlink::{Destination, Transport};
use crate::utils::MacAddr;

/// Kernel interface index for `name`, or `None` if no such device
/// exists.
pub fn index_of(name: &str) -> Result<Option<u32>> {
    match nix::net::if_::if_nametoindex(name) {
        Ok(idx) => Ok(Some(idx)),
        Err(Errno::ENODEV) | Err(Errno::ENXIO) => Ok(None),
        Err(errno) => Err(Error::LinkOp {
            op: "ifindex",
            name: name.to_string(),
            errno,
        }),
    }
}

fn expect_ack(resp: &[u8], op: &'static str, name: &str) -> Result<()> {
    match msg::ack(resp)? {
        None => Ok(()),
        Some(errno) => Err(Error::LinkOp {
            op,
            name: name.to_string(),
            errno,
        }),
    }
}

/// Create a macvtap link named `name` over `uplink_index`.
///
/// An EEXIST reply means another creation raced us on the same name
/// and is reported as retryable; everything else aborts.
pub fn add_macvtap<T: Transport>(
    tr: &mut T,
    name: &str,
    uplink_index: u32,
    mac: &MacAddr,
    macvlan_mode: u32,
) -> Result<()> {
    let mut m = MessageBuilder::new(
        msg::RTM_NEWLINK,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
    );
    m.append_ifinfo(0, 0, 0);
    m.append_u32(msg::IFLA_LINK, uplink_index);
    m.append(msg::IFLA_ADDRESS, mac.as_bytes());
    m.append_str(msg::IFLA_IFNAME, name);
    let linkinfo = m.nest_start(msg::IFLA_LINKINFO);
    m.append_str(msg::IFLA_INFO_KIND, "macvtap");
    let data = m.nest_start(msg::IFLA_INFO_DATA);
    m.append_u32(msg::IFLA_MACVLAN_MODE, macvlan_mode);
    m.nest_end(data);
    m.nest_end(linkinfo);

    let resp = tr.request(&m.finish(), Destination::Kernel)?;
    match msg::ack(&resp)? {
        None => Ok(()),
        Some(errno) => Err(Error::DeviceCreateFailed {
            name: name.to_string(),
            errno,
            retryable: errno == Errno::EEXIST,
        }),
    }
}

pub fn del_link<T: Transport>(tr: &mut T, name: &str) -> Result<()> {
    let mut m = MessageBuilder::new(msg::RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK);
    m.append_ifinfo(0, 0, 0);
    m.append_str(msg::IFLA_IFNAME, name);
    let resp = tr.request(&m.finish(), Destination::Kernel)?;
    expect_ack(&resp, "dellink", name)
}

fn set_flags<T: Transport>(tr: &mut T, name: &str, if_flags: u32, change: u32) -> Result<()> {
    let mut m = MessageBuilder::new(msg::RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK);
    m.append_ifinfo(0, if_flags, change);
    m.append_str(msg::IFLA_IFNAME, name);
    let resp = tr.request(&m.finish(), Destination::Kernel)?;
    expect_ack(&resp, "setlink flags", name)
}

pub fn set_up<T: Transport>(tr: &mut T, name: &str) -> Result<()> {
    set_flags(tr, name, msg::IFF_UP, msg::IFF_UP)
}

pub fn set_down<T: Transport>(tr: &mut T, name: &str) -> Result<()> {
    set_flags(tr, name, 0, msg::IFF_UP)
}

pub fn set_mac<T: Transport>(tr: &mut T, name: &str, mac: &MacAddr) -> Result<()> {
    let mut m = MessageBuilder::new(msg::RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK);
    m.append_ifinfo(0, 0, 0);
    m.append_str(msg::IFLA_IFNAME, name);
    m.append(msg::IFLA_ADDRESS, mac.as_bytes());
    let resp = tr.request(&m.finish(), Destination::Kernel)?;
    expect_ack(&resp, "setlink address", name)
}

/// Current hardware address as exposed through sysfs.
pub fn current_mac(sysfs_net_root: &Path, name: &str) -> Result<MacAddr> {
    let path = sysfs_net_root.join(name).join("address");
    let content = fs::read_to_string(&path)?;
    MacAddr::parse(content.trim()).ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad hardware address in {}", path.display()),
        ))
    })
}

/// Overwrite the uplink's hardware address with `target`, saving the
/// original to the state directory so it can be restored after the
/// device goes away.
pub fn replace_mac<T: Transport>(
    tr: &mut T,
    cfg: &Config,
    uplink: &str,
    target: &MacAddr,
) -> Result<()> {
    let original = current_mac(&cfg.sysfs_net_root, uplink)?;
    fs::create_dir_all(&cfg.state_dir)?;
    fs::write(cfg.state_dir.join(uplink), format!("{}\n", original))?;
    debug!(sl!(), "replacing mac {} with {} on {}", original, target, uplink);
    set_mac(tr, uplink, target)
}

/// Restore the saved hardware address, if any. A missing state file
/// means there is nothing to restore and is not an error.
pub fn restore_mac<T: Transport>(tr: &mut T, cfg: &Config, uplink: &str) -> Result<()> {
    let path = cfg.state_dir.join(uplink);
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mac = MacAddr::parse(content.trim()).ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad saved hardware address in {}", path.display()),
        ))
    })?;
    set_mac(tr, uplink, &mac)?;
    fs::remove_file(&path)?;
    Ok(())
}

/// A targeted RTM_GETLINK reply: the interface index from the
/// ifinfomsg header plus the raw attribute region.
#[derive(Debug)]
pub struct LinkDump {
    pub index: u32,
    pub attrs: Vec<u8>,
}

pub fn link_dump<T: Transport>(
    tr: &mut T,
    dest: Destination,
    ifindex: u32,
    ifname: Option<&str>,
) -> Result<LinkDump> {
    let mut m = MessageBuilder::new(msg::RTM_GETLINK, NLM_F_REQUEST);
    m.append_ifinfo(ifindex, 0, 0);
    if let Some(name) = ifname {
        m.append_str(msg::IFLA_IFNAME, name);
    }
    let resp = tr.request(&m.finish(), dest)?;
    let msgs = msg::messages(&resp)?;
    let first = msgs
        .first()
        .ok_or(Error::MalformedResponse("empty netlink response"))?;
    match first.msg_type {
        msg::RTM_NEWLINK => {
            if first.payload.len() < msg::IFINFOMSG_LEN {
                return Err(Error::MalformedResponse("truncated ifinfomsg"));
            }
            Ok(LinkDump {
                index: NativeEndian::read_u32(&first.payload[4..8]),
                attrs: first.payload[msg::IFINFOMSG_LEN..].to_vec(),
            })
        }
        netlink_packet_core::NLMSG_ERROR => {
            let errno = match msg::ack(&resp)? {
                Some(errno) => errno,
                None => return Err(Error::MalformedResponse("link dump carried no link")),
            };
            Err(Error::LinkOp {
                op: "getlink",
                name: ifname
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("ifindex {}", ifindex)),
                errno,
            })
        }
        _ => Err(Error::MalformedResponse("unexpected response message type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::test_support::{ack_err, ack_ok, newlink_response, MockTransport};

    #[test]
    fn test_add_macvtap_request_shape() {
        let mut tr = MockTransport::new(vec![ack_ok()]);
        let mac = MacAddr::parse("52:54:00:aa:bb:cc").unwrap();
        add_macvtap(&mut tr, "macvtap0", 3, &mac, msg::MACVLAN_MODE_VEPA).unwrap();

        let (sent, dest) = &tr.sent[0];
        assert_eq!(*dest, Destination::Kernel);
        let attrs = msg::parse_attrs(&sent[msg::NLMSG_HDRLEN + msg::IFINFOMSG_LEN..]).unwrap();
        assert_eq!(msg::get_u32(&attrs, msg::IFLA_LINK), Some(3));
        assert_eq!(msg::get_str(&attrs, msg::IFLA_IFNAME), Some("macvtap0"));
        assert_eq!(msg::get(&attrs, msg::IFLA_ADDRESS), Some(mac.as_bytes()));
        let info = msg::parse_attrs(msg::get(&attrs, msg::IFLA_LINKINFO).unwrap()).unwrap();
        assert_eq!(msg::get_str(&info, msg::IFLA_INFO_KIND), Some("macvtap"));
        let data = msg::parse_attrs(msg::get(&info, msg::IFLA_INFO_DATA).unwrap()).unwrap();
        assert_eq!(
            msg::get_u32(&data, msg::IFLA_MACVLAN_MODE),
            Some(msg::MACVLAN_MODE_VEPA)
        );
    }

    #[test]
    fn test_add_macvtap_eexist_is_retryable() {
        let mut tr = MockTransport::new(vec![ack_err(libc::EEXIST)]);
        let mac = MacAddr::parse("52:54:00:aa:bb:cc").unwrap();
        let err = add_macvtap(&mut tr, "macvtap0", 3, &mac, msg::MACVLAN_MODE_VEPA).unwrap_err();
        match err {
            Error::DeviceCreateFailed {
                retryable, errno, ..
            } => {
                assert!(retryable);
                assert_eq!(errno, Errno::EEXIST);
            }
            other => panic!("unexpected error {:?}", other),
        }

        let mut tr = MockTransport::new(vec![ack_err(libc::EPERM)]);
        let err = add_macvtap(&mut tr, "macvtap0", 3, &mac, msg::MACVLAN_MODE_VEPA).unwrap_err();
        match err {
            Error::DeviceCreateFailed { retryable, .. } => assert!(!retryable),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_link_dump_parses_index_and_attrs() {
        let resp = newlink_response(7, |m| {
            m.append_str(msg::IFLA_IFNAME, "eth0");
        });
        let mut tr = MockTransport::new(vec![resp]);
        let dump = link_dump(&mut tr, Destination::Kernel, 0, Some("eth0")).unwrap();
        assert_eq!(dump.index, 7);
        let attrs = msg::parse_attrs(&dump.attrs).unwrap();
        assert_eq!(msg::get_str(&attrs, msg::IFLA_IFNAME), Some("eth0"));
    }

    #[test]
    fn test_link_dump_error_reply() {
        let mut tr = MockTransport::new(vec![ack_err(libc::ENODEV)]);
        let err = link_dump(&mut tr, Destination::Kernel, 9, None).unwrap_err();
        assert!(matches!(err, Error::LinkOp { op: "getlink", .. }));
    }

    #[test]
    fn test_replace_and_restore_mac() {
        crate::init_test_logger();
        let dir = tempfile::tempdir().unwrap();
        let sysfs = dir.path().join("net");
        fs::create_dir_all(sysfs.join("eth0")).unwrap();
        fs::write(sysfs.join("eth0/address"), "00:11:22:33:44:55\n").unwrap();

        let cfg = Config {
            sysfs_net_root: sysfs,
            state_dir: dir.path().join("state"),
            ..Default::default()
        };
        let target = MacAddr::parse("52:54:00:aa:bb:cc").unwrap();

        let mut tr = MockTransport::new(vec![ack_ok(), ack_ok()]);
        replace_mac(&mut tr, &cfg, "eth0", &target).unwrap();
        let saved = fs::read_to_string(cfg.state_dir.join("eth0")).unwrap();
        assert_eq!(saved.trim(), "00:11:22:33:44:55");

        restore_mac(&mut tr, &cfg, "eth0").unwrap();
        assert!(!cfg.state_dir.join("eth0").exists());
        assert_eq!(tr.sent.len(), 2);

        // nothing left to restore: no further netlink traffic
        restore_mac(&mut tr, &cfg, "eth0").unwrap();
        assert_eq!(tr.sent.len(), 2);
    }
}
