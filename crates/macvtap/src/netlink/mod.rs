// Copyright (c) 2023 The macvtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Control-channel transport: one blocking request/response round
//! trip over a NETLINK_ROUTE socket, addressed either to the kernel
//! or to the lldpad agent. The transport does not interpret message
//! contents beyond the framing needed to collect a complete reply.

pub mod msg;

use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use byteorder::{ByteOrder, NativeEndian};
use netlink_packet_core::{NLMSG_DONE, NLM_F_MULTIPART};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};

use crate::config::Config;
use crate::error::{Error, Result};

const RECV_BUF_LEN: usize = 32768;

/// Where a request is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Kernel,
    /// The lldpad process, addressed by the PID found in its PID file.
    Agent,
}

pub trait Transport {
    /// Send one request and collect the complete response buffer.
    fn request(&mut self, payload: &[u8], dest: Destination) -> Result<Vec<u8>>;
}

/// Read the lldpad PID file: a bare non-zero decimal integer,
/// optionally followed by whitespace.
pub fn lldpad_pid(path: &Path) -> Result<u32> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::AgentUnavailable(format!("cannot read {}: {}", path.display(), e)))?;
    let token = content.trim_end();
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::AgentUnavailable(format!(
            "error parsing pid of lldpad from {}",
            path.display()
        )));
    }
    match token.parse::<u32>() {
        Ok(pid) if pid != 0 => Ok(pid),
        _ => Err(Error::AgentUnavailable(format!(
            "error parsing pid of lldpad from {}",
            path.display()
        ))),
    }
}

pub struct RouteSocket {
    socket: Socket,
    seq: u32,
    lldpad_pid_path: std::path::PathBuf,
}

impl RouteSocket {
    pub fn new(cfg: &Config) -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE).map_err(Error::Transport)?;
        socket.bind_auto().map_err(Error::Transport)?;
        Ok(RouteSocket {
            socket,
            seq: 0,
            lldpad_pid_path: cfg.lldpad_pid_path.clone(),
        })
    }

    fn recv_chunk(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let n = unsafe {
            libc::recv(
                self.socket.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(Error::Transport(std::io::Error::last_os_error()));
        }
        buf.truncate(n as usize);
        Ok(buf)
    }
}

impl Transport for RouteSocket {
    fn request(&mut self, payload: &[u8], dest: Destination) -> Result<Vec<u8>> {
        let pid = match dest {
            Destination::Kernel => 0,
            Destination::Agent => lldpad_pid(&self.lldpad_pid_path)?,
        };

        self.seq = self.seq.wrapping_add(1);
        let mut out = payload.to_vec();
        if out.len() >= msg::NLMSG_HDRLEN {
            NativeEndian::write_u32(&mut out[8..12], self.seq);
            NativeEndian::write_u32(&mut out[12..16], 0);
        }

        self.socket
            .send_to(&out, &SocketAddr::new(pid, 0), 0)
            .map_err(Error::Transport)?;

        let mut response = Vec::new();
        loop {
            let chunk = self.recv_chunk()?;
            let parsed = msg::messages(&chunk)?;
            let finished = parsed.iter().any(|m| m.msg_type == NLMSG_DONE)
                || parsed
                    .first()
                    .map(|m| m.flags & NLM_F_MULTIPART == 0)
                    .unwrap_or(true);
            response.extend_from_slice(&chunk);
            if finished {
                break;
            }
        }
        Ok(response)
    }
}
