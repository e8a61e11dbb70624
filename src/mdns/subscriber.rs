// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Browse/resolve state machines, one per subscription.
//!
//! A service subscription without an instance name browses its type; each
//! discovered instance gets its own resolve record walking
//! `Resolving -> GettingAddresses`, so several instances resolve in
//! parallel. Emission happens when an address batch completes
//! (`more_coming == false`) or when the address-wait deadline expires with
//! nothing usable, in which case the info goes out with an empty address
//! list and the last TTL observed.
//!
//! Emissions for one subscription never reorder; distinct subscriptions
//! are independent.

use std::net::Ipv6Addr;
use std::time::Instant;

use crate::config::{ADDRESS_WAIT_TIMEOUT, DEFAULT_DISCOVERY_TTL};

use super::backend::BackendHandle;
use super::{
    is_routable_address, make_full_host_name, DiscoveredHostInfo, DiscoveredInstanceInfo,
};

/// Emission buffers filled while processing backend events; dispatched by
/// the publisher after all state mutation is done.
pub(crate) type InstanceEmissions = Vec<(String, DiscoveredInstanceInfo)>;
pub(crate) type HostEmissions = Vec<(String, DiscoveredHostInfo)>;

// ============================================================================
// Service subscription
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolveState {
    Resolving,
    GettingAddresses,
}

#[derive(Debug)]
struct InstanceResolve {
    state: ResolveState,
    info: DiscoveredInstanceInfo,
    /// Armed while waiting for resolution or addresses; disarmed after an
    /// emission until new events arrive.
    deadline: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct ServiceSubscription {
    pub service_type: String,
    pub instance_name: Option<String>,
    pub handle: BackendHandle,
    resolves: Vec<InstanceResolve>,
}

impl ServiceSubscription {
    pub fn new(service_type: &str, instance_name: Option<&str>, handle: BackendHandle) -> Self {
        Self {
            service_type: service_type.to_string(),
            instance_name: instance_name.map(str::to_string),
            handle,
            resolves: Vec::new(),
        }
    }

    pub fn matches(&self, service_type: &str, instance_name: Option<&str>) -> bool {
        self.service_type == service_type && self.instance_name.as_deref() == instance_name
    }

    fn resolve_mut(&mut self, instance_name: &str) -> Option<&mut InstanceResolve> {
        self.resolves
            .iter_mut()
            .find(|r| r.info.name == instance_name)
    }

    fn resolve_entry(&mut self, instance_name: &str, now: Instant) -> &mut InstanceResolve {
        if let Some(pos) = self
            .resolves
            .iter()
            .position(|r| r.info.name == instance_name)
        {
            return &mut self.resolves[pos];
        }

        self.resolves.push(InstanceResolve {
            state: ResolveState::Resolving,
            info: DiscoveredInstanceInfo {
                name: instance_name.to_string(),
                ..Default::default()
            },
            deadline: Some(now + ADDRESS_WAIT_TIMEOUT),
        });
        self.resolves.last_mut().unwrap()
    }

    /// A browse hit: begin (or refresh) resolution of the instance.
    pub fn handle_found(&mut self, instance_name: &str, netif_index: u32, now: Instant) {
        log::debug!(
            "[MDNS] browse {}: found instance {} on netif {}",
            self.service_type,
            instance_name,
            netif_index
        );

        let entry = self.resolve_entry(instance_name, now);
        entry.info.netif_index = netif_index;
        entry.info.removed = false;
        entry.deadline = Some(now + ADDRESS_WAIT_TIMEOUT);
    }

    /// A browsed instance went away: emit a removal immediately.
    pub fn handle_gone(&mut self, instance_name: &str, emissions: &mut InstanceEmissions) {
        log::info!(
            "[MDNS] browse {}: instance {} removed",
            self.service_type,
            instance_name
        );

        let netif_index = match self
            .resolves
            .iter()
            .position(|r| r.info.name == instance_name)
        {
            Some(pos) => self.resolves.remove(pos).info.netif_index,
            None => 0,
        };

        emissions.push((
            self.service_type.clone(),
            DiscoveredInstanceInfo {
                name: instance_name.to_string(),
                netif_index,
                removed: true,
                ..Default::default()
            },
        ));
    }

    /// SRV/TXT resolution completed; wait for addresses next.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_resolved(
        &mut self,
        instance_name: &str,
        host_name: &str,
        port: u16,
        priority: u16,
        weight: u16,
        txt_data: Vec<u8>,
        netif_index: u32,
        now: Instant,
    ) {
        let entry = self.resolve_entry(instance_name, now);
        entry.info.host_name = host_name.to_string();
        entry.info.port = port;
        entry.info.priority = priority;
        entry.info.weight = weight;
        entry.info.txt_data = txt_data;
        if netif_index != 0 {
            entry.info.netif_index = netif_index;
        }
        entry.state = ResolveState::GettingAddresses;
        entry.deadline = Some(now + ADDRESS_WAIT_TIMEOUT);
    }

    /// One address arrived for a resolving instance.
    pub fn handle_address(
        &mut self,
        instance_name: &str,
        address: Ipv6Addr,
        ttl: u32,
        more_coming: bool,
        now: Instant,
        emissions: &mut InstanceEmissions,
    ) {
        let service_type = self.service_type.clone();
        let Some(entry) = self.resolve_mut(instance_name) else {
            log::debug!(
                "[MDNS] browse {}: address for unknown instance {}",
                service_type,
                instance_name
            );
            return;
        };

        if entry.state != ResolveState::GettingAddresses {
            entry.state = ResolveState::GettingAddresses;
        }

        if is_routable_address(&address) {
            if !entry.info.addresses.contains(&address) {
                entry.info.addresses.push(address);
            }
            entry.info.ttl = ttl;
        } else {
            log::debug!("[MDNS] ignoring address {} for {}", address, instance_name);
            if entry.info.addresses.is_empty() {
                // Remember the TTL for a possible empty-batch emission.
                entry.info.ttl = ttl;
            }
        }

        if more_coming {
            entry.deadline = Some(now + ADDRESS_WAIT_TIMEOUT);
            return;
        }

        // Batch complete: emit, with or without addresses.
        entry.deadline = None;
        emissions.push((service_type, entry.info.clone()));
    }

    /// Emit anything whose address wait ran out.
    pub fn check_deadlines(&mut self, now: Instant, emissions: &mut InstanceEmissions) {
        for entry in &mut self.resolves {
            let due = entry.deadline.is_some_and(|d| d <= now);
            if !due {
                continue;
            }
            entry.deadline = None;
            if entry.info.ttl == 0 {
                entry.info.ttl = DEFAULT_DISCOVERY_TTL;
            }
            log::debug!(
                "[MDNS] browse {}: address wait for {} timed out ({} addresses)",
                self.service_type,
                entry.info.name,
                entry.info.addresses.len()
            );
            emissions.push((self.service_type.clone(), entry.info.clone()));
        }
    }

    /// Earliest armed deadline across in-flight resolves.
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.resolves.iter().filter_map(|r| r.deadline).min()
    }
}

// ============================================================================
// Host subscription
// ============================================================================

#[derive(Debug)]
pub(crate) struct HostSubscription {
    pub host_name: String,
    pub handle: BackendHandle,
    info: DiscoveredHostInfo,
}

impl HostSubscription {
    pub fn new(host_name: &str, handle: BackendHandle) -> Self {
        Self {
            host_name: host_name.to_string(),
            handle,
            info: DiscoveredHostInfo {
                host_name: format!("{}.", make_full_host_name(host_name)),
                ..Default::default()
            },
        }
    }

    /// One AAAA record arrived for the host.
    pub fn handle_address(
        &mut self,
        address: Ipv6Addr,
        ttl: u32,
        more_coming: bool,
        emissions: &mut HostEmissions,
    ) {
        if is_routable_address(&address) {
            if !self.info.addresses.contains(&address) {
                self.info.addresses.push(address);
            }
            self.info.ttl = ttl;
        } else {
            log::debug!(
                "[MDNS] ignoring address {} for host {}",
                address,
                self.host_name
            );
            if self.info.addresses.is_empty() {
                self.info.ttl = ttl;
            }
        }

        if more_coming {
            return;
        }

        self.info.removed = false;
        emissions.push((self.host_name.clone(), self.info.clone()));
    }

    /// The host went away.
    pub fn handle_gone(&mut self, emissions: &mut HostEmissions) {
        self.info.addresses.clear();
        self.info.removed = true;
        emissions.push((self.host_name.clone(), self.info.clone()));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> BackendHandle {
        BackendHandle::new(1)
    }

    #[test]
    fn test_browse_resolve_address_emits_once_per_batch() {
        let mut sub = ServiceSubscription::new("_foo._tcp", None, handle());
        let now = Instant::now();
        let mut emissions = InstanceEmissions::new();

        sub.handle_found("inst", 2, now);
        sub.handle_resolved("inst", "h.local.", 1234, 0, 0, vec![3, b'k', b'=', b'v'], 2, now);
        sub.handle_address(
            "inst",
            "fd00::1".parse().unwrap(),
            120,
            true,
            now,
            &mut emissions,
        );
        assert!(emissions.is_empty(), "batch still open");

        sub.handle_address(
            "inst",
            "fd00::2".parse().unwrap(),
            120,
            false,
            now,
            &mut emissions,
        );
        assert_eq!(emissions.len(), 1);

        let (service_type, info) = &emissions[0];
        assert_eq!(service_type, "_foo._tcp");
        assert_eq!(info.name, "inst");
        assert_eq!(info.host_name, "h.local.");
        assert_eq!(info.port, 1234);
        assert_eq!(info.netif_index, 2);
        assert_eq!(info.ttl, 120);
        assert_eq!(info.addresses.len(), 2);
        assert!(!info.removed);
    }

    #[test]
    fn test_unusable_addresses_filtered_but_batch_end_emits_empty() {
        let mut sub = ServiceSubscription::new("_foo._tcp", None, handle());
        let now = Instant::now();
        let mut emissions = InstanceEmissions::new();

        sub.handle_found("inst", 1, now);
        sub.handle_resolved("inst", "h.local.", 80, 0, 0, Vec::new(), 1, now);
        sub.handle_address(
            "inst",
            "fe80::1".parse().unwrap(),
            90,
            false,
            now,
            &mut emissions,
        );

        assert_eq!(emissions.len(), 1);
        let (_, info) = &emissions[0];
        assert!(info.addresses.is_empty());
        assert_eq!(info.ttl, 90, "last observed TTL survives");
    }

    #[test]
    fn test_duplicate_addresses_deduplicated() {
        let mut sub = ServiceSubscription::new("_foo._tcp", None, handle());
        let now = Instant::now();
        let mut emissions = InstanceEmissions::new();
        let addr: Ipv6Addr = "fd00::1".parse().unwrap();

        sub.handle_found("inst", 1, now);
        sub.handle_resolved("inst", "h.local.", 80, 0, 0, Vec::new(), 1, now);
        sub.handle_address("inst", addr, 60, false, now, &mut emissions);
        sub.handle_address("inst", addr, 60, false, now, &mut emissions);

        assert_eq!(emissions.len(), 2, "re-announcement re-emits");
        assert_eq!(emissions[1].1.addresses, vec![addr]);
    }

    #[test]
    fn test_parallel_resolves_tracked_independently() {
        let mut sub = ServiceSubscription::new("_foo._tcp", None, handle());
        let now = Instant::now();
        let mut emissions = InstanceEmissions::new();

        sub.handle_found("a", 1, now);
        sub.handle_found("b", 1, now);
        sub.handle_resolved("a", "ha.local.", 1, 0, 0, Vec::new(), 1, now);
        sub.handle_resolved("b", "hb.local.", 2, 0, 0, Vec::new(), 1, now);

        sub.handle_address("b", "fd00::b".parse().unwrap(), 60, false, now, &mut emissions);
        sub.handle_address("a", "fd00::a".parse().unwrap(), 60, false, now, &mut emissions);

        assert_eq!(emissions.len(), 2);
        assert_eq!(emissions[0].1.name, "b");
        assert_eq!(emissions[1].1.name, "a");
    }

    #[test]
    fn test_timeout_emits_with_default_ttl() {
        let mut sub = ServiceSubscription::new("_foo._tcp", None, handle());
        let now = Instant::now();
        let mut emissions = InstanceEmissions::new();

        sub.handle_found("inst", 1, now);
        assert!(sub.earliest_deadline().is_some());

        sub.check_deadlines(now + ADDRESS_WAIT_TIMEOUT, &mut emissions);
        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].1.ttl, DEFAULT_DISCOVERY_TTL);
        assert!(emissions[0].1.addresses.is_empty());

        // Deadline disarmed: no repeat emission.
        emissions.clear();
        sub.check_deadlines(now + ADDRESS_WAIT_TIMEOUT * 2, &mut emissions);
        assert!(emissions.is_empty());
    }

    #[test]
    fn test_instance_gone_emits_removed() {
        let mut sub = ServiceSubscription::new("_foo._tcp", None, handle());
        let now = Instant::now();
        let mut emissions = InstanceEmissions::new();

        sub.handle_found("inst", 7, now);
        sub.handle_gone("inst", &mut emissions);

        assert_eq!(emissions.len(), 1);
        let (_, info) = &emissions[0];
        assert!(info.removed);
        assert_eq!(info.name, "inst");
        assert_eq!(info.netif_index, 7);
        assert!(sub.earliest_deadline().is_none(), "resolve state dropped");
    }

    #[test]
    fn test_host_subscription_emits_full_name_with_dot() {
        let mut sub = HostSubscription::new("gateway", handle());
        let mut emissions = HostEmissions::new();

        sub.handle_address("fd00::5".parse().unwrap(), 100, false, &mut emissions);

        assert_eq!(emissions.len(), 1);
        let (name, info) = &emissions[0];
        assert_eq!(name, "gateway");
        assert_eq!(info.host_name, "gateway.local.");
        assert_eq!(info.addresses, vec!["fd00::5".parse::<Ipv6Addr>().unwrap()]);
        assert_eq!(info.ttl, 100);
    }

    #[test]
    fn test_host_gone() {
        let mut sub = HostSubscription::new("gateway", handle());
        let mut emissions = HostEmissions::new();

        sub.handle_address("fd00::5".parse().unwrap(), 100, false, &mut emissions);
        sub.handle_gone(&mut emissions);

        assert_eq!(emissions.len(), 2);
        assert!(emissions[1].1.removed);
        assert!(emissions[1].1.addresses.is_empty());
    }

    #[test]
    fn test_host_link_local_filtered() {
        let mut sub = HostSubscription::new("gateway", handle());
        let mut emissions = HostEmissions::new();

        sub.handle_address("fe80::9".parse().unwrap(), 100, true, &mut emissions);
        sub.handle_address("fd00::9".parse().unwrap(), 100, false, &mut emissions);

        assert_eq!(emissions.len(), 1);
        assert_eq!(emissions[0].1.addresses.len(), 1);
    }
}
