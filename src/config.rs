// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime configuration and protocol constants.
//!
//! All tunables live here. **NEVER hardcode elsewhere!**

use std::ffi::CString;
use std::time::Duration;

// =======================================================================
// DSO transport (RFC 8490 session over TCP)
// =======================================================================

/// Well-known DNS-over-TLS / DSO port the listener binds and the SRPL
/// service advertises.
pub const DSO_LISTEN_PORT: u16 = 853;

/// Listen backlog for the DSO listener socket.
pub const DSO_LISTEN_BACKLOG: i32 = 10;

// =======================================================================
// SRP replication service (DNS-SD)
// =======================================================================

/// Service type advertised and browsed for SRP replication peers.
pub const SRPL_SERVICE_TYPE: &str = "_srpl-tls._tcp";

/// Base instance name; a random `(1..=0xFFFF)` suffix is appended.
pub const SRPL_INSTANCE_BASE_NAME: &str = "srpl";

// =======================================================================
// mDNS / DNS-SD
// =======================================================================

/// mDNS domain appended to instance and host names.
pub const LOCAL_DOMAIN: &str = "local";

/// Maximum size of one encoded TXT entry (`len(name) + 1 + len(value)`),
/// per RFC 6763 character-string limits.
pub const MAX_TXT_ENTRY_SIZE: usize = 255;

/// TTL reported for discovered records when the backend does not provide
/// one (conventional DNS-SD TTL).
pub const DEFAULT_DISCOVERY_TTL: u32 = 4500;

/// How long a resolved instance may wait for its first address before the
/// subscriber emits with an empty address list.
pub const ADDRESS_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Cadence at which the embedded mDNS daemon's channels are drained while
/// registrations or subscriptions are outstanding.
pub const DAEMON_DRAIN_INTERVAL: Duration = Duration::from_millis(50);

// =======================================================================
// Mainloop
// =======================================================================

/// Upper bound for one mainloop poll when no participant asks for an
/// earlier wakeup.
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration for the advertisement and transport agents.
///
/// `Default` yields production values with no infrastructure interface
/// bound, which is also what tests want (loopback, ephemeral ports).
#[derive(Clone, Debug)]
pub struct Config {
    /// Infrastructure network interface name. Empty leaves sockets and the
    /// mDNS daemon unbound from any particular interface.
    pub infra_ifname: String,

    /// Port the DSO listener binds. `0` picks an ephemeral port.
    pub dso_listen_port: u16,

    /// Listen backlog for the DSO listener.
    pub dso_listen_backlog: i32,

    /// Port advertised by the SRPL service.
    pub srpl_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            infra_ifname: String::new(),
            dso_listen_port: DSO_LISTEN_PORT,
            dso_listen_backlog: DSO_LISTEN_BACKLOG,
            srpl_port: DSO_LISTEN_PORT,
        }
    }
}

impl Config {
    /// Production configuration bound to the given infrastructure
    /// interface.
    pub fn new(infra_ifname: &str) -> Self {
        Self {
            infra_ifname: infra_ifname.to_string(),
            ..Self::default()
        }
    }

    /// Resolve the infrastructure interface name to its index.
    ///
    /// Returns 0 when no interface is configured or the lookup fails.
    pub fn infra_netif_index(&self) -> u32 {
        if self.infra_ifname.is_empty() {
            return 0;
        }

        let Ok(name) = CString::new(self.infra_ifname.as_str()) else {
            return 0;
        };

        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            log::warn!(
                "[CFG] failed to resolve interface index for {:?}",
                self.infra_ifname
            );
        }
        index
    }
}
