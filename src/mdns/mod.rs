// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mDNS service advertisement and discovery.
//!
//! The [`Publisher`] is the unified front: it registers services and hosts
//! on the local link through a pluggable [`backend::Backend`] and
//! subscribes to service-type browses and host resolutions, fanning
//! discoveries out to registered callbacks.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                         Publisher                            |
//! |  +--------------------+      +----------------------------+  |
//! |  | Registration table |      | Subscription state machines|  |
//! |  | (dedup, rename,    |      | (browse -> resolve ->      |  |
//! |  |  coalescing)       |      |  addresses, batching)      |  |
//! |  +---------+----------+      +-------------+--------------+  |
//! |            |                               |                 |
//! |            v                               v                 |
//! |  +--------------------------------------------------------+  |
//! |  |                  Backend (seam)                        |  |
//! |  |   DaemonBackend (mdns-sd)  |  MockBackend (tests)      |  |
//! |  +--------------------------------------------------------+  |
//! +--------------------------------------------------------------+
//! ```

pub mod backend;
pub mod daemon;
pub mod mock;
pub mod publisher;
mod subscriber;

pub use backend::{Backend, BackendEvent, BackendHandle, HostPublication, ServicePublication};
pub use daemon::DaemonBackend;
pub use mock::{MockBackend, MockControl};
pub use publisher::{HostRegistration, Publisher, ServiceRegistration};

use std::net::Ipv6Addr;

use crate::config::MAX_TXT_ENTRY_SIZE;
use crate::error::{Error, Result};

// ============================================================================
// Shared types
// ============================================================================

/// Readiness of the mDNS stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Not ready to publish or subscribe.
    Idle,
    /// The backing responder is running.
    Ready,
}

/// One TXT attribute (`name=value`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxtEntry {
    pub name: String,
    pub value: Vec<u8>,
}

impl TxtEntry {
    pub fn new(name: &str, value: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_vec(),
        }
    }
}

/// TXT attribute list; compared sorted by name.
pub type TxtList = Vec<TxtEntry>;

/// Service sub-type labels; compared sorted.
pub type SubTypeList = Vec<String>;

/// Identifier returned by [`Publisher::add_subscription_callbacks`].
pub type SubscriberId = u64;

/// A discovered and resolved service instance.
#[derive(Clone, Debug, Default)]
pub struct DiscoveredInstanceInfo {
    /// Instance name (unqualified).
    pub name: String,
    /// Full host name, with trailing dot (`"host.local."`).
    pub host_name: String,
    /// Service port.
    pub port: u16,
    /// Usable (non-link-local, non-loopback) IPv6 addresses.
    pub addresses: Vec<Ipv6Addr>,
    /// Raw TXT record data (RFC 6763 encoding).
    pub txt_data: Vec<u8>,
    /// Record time-to-live, seconds.
    pub ttl: u32,
    /// Index of the interface the instance was discovered on.
    pub netif_index: u32,
    /// SRV priority.
    pub priority: u16,
    /// SRV weight.
    pub weight: u16,
    /// True when this announces the instance going away.
    pub removed: bool,
}

/// A resolved host.
#[derive(Clone, Debug, Default)]
pub struct DiscoveredHostInfo {
    /// Full host name, with trailing dot.
    pub host_name: String,
    /// Usable IPv6 addresses.
    pub addresses: Vec<Ipv6Addr>,
    /// Record time-to-live, seconds.
    pub ttl: u32,
    /// True when this announces the host going away.
    pub removed: bool,
}

/// Single-shot completion callback for publish operations.
pub type ResultCallback = Box<dyn FnOnce(Result<()>)>;

/// Observer of [`State`] transitions.
pub type StateCallback = Box<dyn FnMut(State)>;

/// Observer of resolved service instances: `(service_type, info)`.
pub type InstanceCallback = Box<dyn FnMut(&str, &DiscoveredInstanceInfo)>;

/// Observer of resolved hosts: `(host_name, info)`.
pub type HostCallback = Box<dyn FnMut(&str, &DiscoveredHostInfo)>;

// ============================================================================
// Names
// ============================================================================

/// `instance.type.local` without trailing dot.
pub fn make_full_service_name(name: &str, service_type: &str) -> String {
    format!("{}.{}.{}", name, service_type, crate::config::LOCAL_DOMAIN)
}

/// `host.local` without trailing dot.
pub fn make_full_host_name(name: &str) -> String {
    format!("{}.{}", name, crate::config::LOCAL_DOMAIN)
}

/// Compare service types, tolerating one trailing dot on either side.
pub fn is_service_type_equal(first: &str, second: &str) -> bool {
    let first = first.strip_suffix('.').unwrap_or(first);
    let second = second.strip_suffix('.').unwrap_or(second);
    first.eq_ignore_ascii_case(second)
}

// ============================================================================
// Sort discipline
// ============================================================================

/// Sub-type lists are compared sorted lexicographically.
pub fn sort_sub_type_list(mut sub_types: SubTypeList) -> SubTypeList {
    sub_types.sort();
    sub_types
}

/// TXT lists are compared sorted by attribute name.
pub fn sort_txt_list(mut txt: TxtList) -> TxtList {
    txt.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
    txt
}

// ============================================================================
// TXT encoding (RFC 6763)
// ============================================================================

/// Encode a TXT list into wire form: per entry,
/// `[len][name]['='][value]` with `len = |name| + 1 + |value|`.
///
/// Fails with `InvalidArgs` when an entry exceeds 255 bytes.
pub fn encode_txt_data(txt: &[TxtEntry]) -> Result<Vec<u8>> {
    let mut data = Vec::new();

    for entry in txt {
        let entry_length = entry.name.len() + 1 + entry.value.len();
        if entry_length > MAX_TXT_ENTRY_SIZE {
            return Err(Error::InvalidArgs(format!(
                "TXT entry {} is {} bytes (max {})",
                entry.name, entry_length, MAX_TXT_ENTRY_SIZE
            )));
        }

        data.push(entry_length as u8);
        data.extend_from_slice(entry.name.as_bytes());
        data.push(b'=');
        data.extend_from_slice(&entry.value);
    }

    Ok(data)
}

/// Decode wire-form TXT data into a list. Entries without `'='` become
/// name-only attributes with an empty value; zero-length entries are
/// skipped; a length prefix running past the buffer is `InvalidArgs`.
pub fn decode_txt_data(data: &[u8]) -> Result<TxtList> {
    let mut txt = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let len = data[pos] as usize;
        pos += 1;

        if len == 0 {
            continue;
        }
        if pos + len > data.len() {
            return Err(Error::InvalidArgs("truncated TXT entry".to_string()));
        }

        let entry = &data[pos..pos + len];
        pos += len;

        let (name, value) = match entry.iter().position(|&b| b == b'=') {
            Some(eq) => (&entry[..eq], &entry[eq + 1..]),
            None => (entry, &entry[entry.len()..]),
        };

        txt.push(TxtEntry {
            name: String::from_utf8_lossy(name).into_owned(),
            value: value.to_vec(),
        });
    }

    Ok(txt)
}

// ============================================================================
// Address filtering
// ============================================================================

/// True for addresses worth surfacing to consumers: not unspecified, not
/// loopback, not multicast, not link-local.
pub fn is_routable_address(address: &Ipv6Addr) -> bool {
    !address.is_unspecified()
        && !address.is_loopback()
        && !address.is_multicast()
        && (address.segments()[0] & 0xffc0) != 0xfe80
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_names() {
        assert_eq!(
            make_full_service_name("srpl(7)", "_srpl-tls._tcp"),
            "srpl(7)._srpl-tls._tcp.local"
        );
        assert_eq!(make_full_host_name("gateway"), "gateway.local");
    }

    #[test]
    fn test_service_type_comparison() {
        assert!(is_service_type_equal("_srpl-tls._tcp", "_srpl-tls._tcp."));
        assert!(is_service_type_equal("_SRPL-TLS._TCP", "_srpl-tls._tcp"));
        assert!(!is_service_type_equal("_srpl-tls._tcp", "_meshcop._udp"));
    }

    #[test]
    fn test_sort_discipline() {
        let sub_types = sort_sub_type_list(vec!["_b".into(), "_a".into(), "_c".into()]);
        assert_eq!(sub_types, vec!["_a", "_b", "_c"]);

        let txt = sort_txt_list(vec![
            TxtEntry::new("zz", b"1"),
            TxtEntry::new("aa", b"2"),
        ]);
        assert_eq!(txt[0].name, "aa");
        assert_eq!(txt[1].name, "zz");
    }

    #[test]
    fn test_txt_encode_wire_format() {
        let data = encode_txt_data(&[TxtEntry::new("k", b"v")]).unwrap();
        assert_eq!(data, vec![3, b'k', b'=', b'v']);
    }

    #[test]
    fn test_txt_encode_rejects_oversized_entry() {
        let entry = TxtEntry::new("name", &[0u8; 255]);
        match encode_txt_data(&[entry]) {
            Err(Error::InvalidArgs(_)) => {}
            other => panic!("expected InvalidArgs, got {:?}", other),
        }
    }

    #[test]
    fn test_txt_encode_accepts_max_entry() {
        // |name| + 1 + |value| == 255 exactly.
        let entry = TxtEntry::new("abcd", &[0u8; 250]);
        let data = encode_txt_data(&[entry]).unwrap();
        assert_eq!(data.len(), 256);
        assert_eq!(data[0], 255);
    }

    #[test]
    fn test_txt_roundtrip_sorted() {
        let txt = vec![
            TxtEntry::new("xp", b"123456"),
            TxtEntry::new("dn", b"mesh"),
            TxtEntry::new("flag", b""),
        ];
        let encoded = encode_txt_data(&txt).unwrap();
        let decoded = decode_txt_data(&encoded).unwrap();

        assert_eq!(sort_txt_list(decoded), sort_txt_list(txt));
    }

    #[test]
    fn test_txt_decode_name_only_entry() {
        // Length 3, "abc" without '='.
        let decoded = decode_txt_data(&[3, b'a', b'b', b'c']).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "abc");
        assert!(decoded[0].value.is_empty());
    }

    #[test]
    fn test_txt_decode_truncated() {
        match decode_txt_data(&[5, b'a', b'b']) {
            Err(Error::InvalidArgs(_)) => {}
            other => panic!("expected InvalidArgs, got {:?}", other),
        }
    }

    #[test]
    fn test_txt_decode_skips_zero_length() {
        let decoded = decode_txt_data(&[0, 3, b'k', b'=', b'v']).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "k");
    }

    #[test]
    fn test_address_filter() {
        assert!(is_routable_address(&"fd00::1".parse().unwrap()));
        assert!(is_routable_address(&"2001:db8::1".parse().unwrap()));
        assert!(!is_routable_address(&Ipv6Addr::UNSPECIFIED));
        assert!(!is_routable_address(&Ipv6Addr::LOCALHOST));
        assert!(!is_routable_address(&"fe80::1".parse().unwrap()));
        assert!(!is_routable_address(&"ff02::fb".parse().unwrap()));
    }
}
