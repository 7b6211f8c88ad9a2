// Copyright (c) 2023 The macvtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Hand-built rtnetlink messages: nlmsghdr/ifinfomsg framing and the
//! nested type-length-value attribute trees used for link creation
//! and port-profile requests. The typed netlink crates do not model
//! the IFLA_VF_PORTS / IFLA_PORT_* attribute families, so this
//! module encodes and parses them directly.

use byteorder::{ByteOrder, NativeEndian};
use netlink_packet_core::{NLMSG_DONE, NLMSG_ERROR};
use nix::errno::Errno;

use crate::error::{Error, Result};

pub const NLMSG_HDRLEN: usize = 16;
pub const IFINFOMSG_LEN: usize = 16;
pub const NLA_HDRLEN: usize = 4;

const NLA_F_NESTED: u16 = 0x8000;
const NLA_TYPE_MASK: u16 = 0x3fff;

// rtnetlink message types
pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_GETLINK: u16 = 18;
pub const RTM_SETLINK: u16 = 19;

// link-level attributes (linux/if_link.h)
pub const IFLA_ADDRESS: u16 = 1;
pub const IFLA_IFNAME: u16 = 3;
pub const IFLA_LINK: u16 = 5;
pub const IFLA_LINKINFO: u16 = 18;
pub const IFLA_VFINFO_LIST: u16 = 22;
pub const IFLA_VF_PORTS: u16 = 24;
pub const IFLA_PORT_SELF: u16 = 25;

pub const IFLA_INFO_KIND: u16 = 1;
pub const IFLA_INFO_DATA: u16 = 2;

pub const IFLA_VF_INFO: u16 = 1;
pub const IFLA_VF_MAC: u16 = 1;
pub const IFLA_VF_VLAN: u16 = 2;

pub const IFLA_VF_PORT: u16 = 1;

pub const IFLA_PORT_VF: u16 = 1;
pub const IFLA_PORT_PROFILE: u16 = 2;
pub const IFLA_PORT_VSI_TYPE: u16 = 3;
pub const IFLA_PORT_INSTANCE_UUID: u16 = 4;
pub const IFLA_PORT_HOST_UUID: u16 = 5;
pub const IFLA_PORT_REQUEST: u16 = 6;
pub const IFLA_PORT_RESPONSE: u16 = 7;

pub const IFLA_VLAN_ID: u16 = 1;
pub const IFLA_MACVLAN_MODE: u16 = 1;

pub const MACVLAN_MODE_PRIVATE: u32 = 1;
pub const MACVLAN_MODE_VEPA: u32 = 2;
pub const MACVLAN_MODE_BRIDGE: u32 = 4;
pub const MACVLAN_MODE_PASSTHRU: u32 = 8;

// port-profile request and response codes (linux/if_link.h)
pub const PORT_REQUEST_PREASSOCIATE: u8 = 0;
pub const PORT_REQUEST_PREASSOCIATE_RR: u8 = 1;
pub const PORT_REQUEST_ASSOCIATE: u8 = 2;
pub const PORT_REQUEST_DISASSOCIATE: u8 = 3;

pub const PORT_VDP_RESPONSE_SUCCESS: u16 = 0;
pub const PORT_PROFILE_RESPONSE_SUCCESS: u16 = 0x100;
pub const PORT_PROFILE_RESPONSE_INPROGRESS: u16 = 0x101;

/// Wire encoding of "the device itself, not an SR-IOV function".
pub const PORT_SELF_VF: u32 = u32::MAX;

pub const IFF_UP: u32 = 1;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Outbound request builder. The nlmsghdr length field is patched by
/// [`MessageBuilder::finish`]; nested attribute lengths by
/// [`MessageBuilder::nest_end`].
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        NativeEndian::write_u16(&mut buf[4..6], msg_type);
        NativeEndian::write_u16(&mut buf[6..8], flags);
        MessageBuilder { buf }
    }

    /// Append the fixed ifinfomsg payload header.
    pub fn append_ifinfo(&mut self, ifindex: u32, if_flags: u32, change: u32) -> &mut Self {
        let start = self.buf.len();
        self.buf.resize(start + IFINFOMSG_LEN, 0);
        // ifi_family, pad and ifi_type stay zero
        NativeEndian::write_u32(&mut self.buf[start + 4..start + 8], ifindex);
        NativeEndian::write_u32(&mut self.buf[start + 8..start + 12], if_flags);
        NativeEndian::write_u32(&mut self.buf[start + 12..start + 16], change);
        self
    }

    pub fn append(&mut self, ty: u16, data: &[u8]) -> &mut Self {
        let len = NLA_HDRLEN + data.len();
        let start = self.buf.len();
        self.buf.resize(start + align4(len), 0);
        NativeEndian::write_u16(&mut self.buf[start..start + 2], len as u16);
        NativeEndian::write_u16(&mut self.buf[start + 2..start + 4], ty);
        self.buf[start + NLA_HDRLEN..start + len].copy_from_slice(data);
        self
    }

    /// String attribute including the terminating NUL byte.
    pub fn append_str(&mut self, ty: u16, s: &str) -> &mut Self {
        let mut data = Vec::with_capacity(s.len() + 1);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
        self.append(ty, &data)
    }

    pub fn append_u8(&mut self, ty: u16, value: u8) -> &mut Self {
        self.append(ty, &[value])
    }

    pub fn append_u32(&mut self, ty: u16, value: u32) -> &mut Self {
        let mut data = [0u8; 4];
        NativeEndian::write_u32(&mut data, value);
        self.append(ty, &data)
    }

    /// Open a nested attribute; returns a cookie for [`Self::nest_end`].
    pub fn nest_start(&mut self, ty: u16) -> usize {
        let start = self.buf.len();
        self.buf.resize(start + NLA_HDRLEN, 0);
        NativeEndian::write_u16(&mut self.buf[start + 2..start + 4], ty | NLA_F_NESTED);
        start
    }

    pub fn nest_end(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u16;
        NativeEndian::write_u16(&mut self.buf[start..start + 2], len);
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        NativeEndian::write_u32(&mut self.buf[0..4], len);
        self.buf
    }
}

/// One message split out of a (possibly multi-part) response buffer.
pub struct ResponseMessage<'a> {
    pub msg_type: u16,
    pub flags: u16,
    pub payload: &'a [u8],
}

pub fn messages(buf: &[u8]) -> Result<Vec<ResponseMessage<'_>>> {
    let mut rest = buf;
    let mut out = Vec::new();
    while !rest.is_empty() {
        if rest.len() < NLMSG_HDRLEN {
            return Err(Error::MalformedResponse("truncated netlink header"));
        }
        let len = NativeEndian::read_u32(&rest[0..4]) as usize;
        if len < NLMSG_HDRLEN || len > rest.len() {
            return Err(Error::MalformedResponse("bad netlink message length"));
        }
        out.push(ResponseMessage {
            msg_type: NativeEndian::read_u16(&rest[4..6]),
            flags: NativeEndian::read_u16(&rest[6..8]),
            payload: &rest[NLMSG_HDRLEN..len],
        });
        let advance = std::cmp::min(align4(len), rest.len());
        rest = &rest[advance..];
    }
    Ok(out)
}

/// Interpret an acknowledgement-style response: `Ok(None)` on
/// success, `Ok(Some(errno))` when the kernel or agent reported an
/// error code.
pub fn ack(buf: &[u8]) -> Result<Option<Errno>> {
    let msgs = messages(buf)?;
    let first = msgs
        .first()
        .ok_or(Error::MalformedResponse("empty netlink response"))?;
    match first.msg_type {
        NLMSG_ERROR => {
            if first.payload.len() < 4 {
                return Err(Error::MalformedResponse("truncated error message"));
            }
            let code = NativeEndian::read_i32(&first.payload[..4]);
            if code == 0 {
                Ok(None)
            } else {
                Ok(Some(Errno::from_i32(-code)))
            }
        }
        NLMSG_DONE => Ok(None),
        _ => Err(Error::MalformedResponse("unexpected response message type")),
    }
}

/// A parsed attribute. `ty` has the NLA flag bits stripped.
#[derive(Debug, Clone, Copy)]
pub struct Attr<'a> {
    pub ty: u16,
    pub data: &'a [u8],
}

pub fn parse_attrs(mut buf: &[u8]) -> Result<Vec<Attr<'_>>> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        if buf.len() < NLA_HDRLEN {
            return Err(Error::MalformedResponse("truncated attribute header"));
        }
        let len = NativeEndian::read_u16(&buf[0..2]) as usize;
        if len < NLA_HDRLEN || len > buf.len() {
            return Err(Error::MalformedResponse("bad attribute length"));
        }
        out.push(Attr {
            ty: NativeEndian::read_u16(&buf[2..4]) & NLA_TYPE_MASK,
            data: &buf[NLA_HDRLEN..len],
        });
        let advance = std::cmp::min(align4(len), buf.len());
        buf = &buf[advance..];
    }
    Ok(out)
}

pub fn get<'a>(attrs: &[Attr<'a>], ty: u16) -> Option<&'a [u8]> {
    attrs.iter().find(|a| a.ty == ty).map(|a| a.data)
}

pub fn get_u16(attrs: &[Attr<'_>], ty: u16) -> Option<u16> {
    get(attrs, ty).filter(|d| d.len() >= 2).map(NativeEndian::read_u16)
}

pub fn get_u32(attrs: &[Attr<'_>], ty: u16) -> Option<u32> {
    get(attrs, ty).filter(|d| d.len() >= 4).map(NativeEndian::read_u32)
}

pub fn get_str<'a>(attrs: &[Attr<'a>], ty: u16) -> Option<&'a str> {
    get(attrs, ty).and_then(|d| {
        let end = d.iter().position(|&b| b == 0).unwrap_or(d.len());
        std::str::from_utf8(&d[..end]).ok()
    })
}
