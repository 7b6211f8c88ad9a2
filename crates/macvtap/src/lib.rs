// Copyright (c) 2023 The macvtap Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Creation and teardown of macvtap interfaces bound to a physical
//! uplink, including 802.1Qbg / 802.1Qbh port profile negotiation
//! with the switch over rtnetlink.

#[macro_use]
extern crate slog;

// Convenience macro to obtain the scoped logger
#[macro_export]
macro_rules! sl {
    () => {
        slog_scope::logger()
    };
}

pub mod bandwidth;
pub mod config;
pub mod error;
pub mod link;
pub mod manager;
pub mod netlink;
pub mod physdev;
pub mod tap;
pub mod utils;
pub mod vport;

pub use config::Config;
pub use error::{Error, Result};
pub use manager::{
    del_macvtap, open_macvtap, AttachRequest, DetachRequest, MacvtapMode, VirtualInterface,
};
pub use vport::{VirtualPortProfile, VmOperation};

#[cfg(test)]
pub(crate) fn init_test_logger() {
    use std::sync::Once;

    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let guard = slog_scope::set_global_logger(slog::Logger::root(slog::Discard, o!()));
        // The discard logger stays installed for the whole test run.
        std::mem::forget(guard);
    });
}
