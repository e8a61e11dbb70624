// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backend seam between the publisher/subscriber core and a concrete
//! mDNS responder.
//!
//! Backends differ wildly in shape — an embedded daemon thread drained
//! over channels, a per-operation socket driver, a system service spoken
//! to over IPC — so the seam is event-sourced: operations hand back opaque
//! handles, and everything asynchronous (registration outcomes, renames,
//! browse results, resolved addresses) is lowered into [`BackendEvent`]
//! values that surface from [`Backend::process`]. Backend-specific error
//! codes are mapped into the crate taxonomy before they cross this line.

use std::net::Ipv6Addr;

use crate::error::Result;
use crate::mainloop::MainloopContext;

use super::{State, TxtList};

/// Opaque identifier for a backend-side operation (a committed
/// publication or a running browse/resolve). Minted by the backend,
/// released exactly once by the owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackendHandle(u64);

impl BackendHandle {
    pub fn new(raw: u64) -> Self {
        BackendHandle(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Everything a backend needs to announce one service instance.
#[derive(Clone, Debug)]
pub struct ServicePublication {
    /// Host the SRV record points at; empty means "this host".
    pub host_name: String,
    /// Instance name.
    pub name: String,
    /// Service type, e.g. `_srpl-tls._tcp`.
    pub service_type: String,
    /// Sorted sub-type labels.
    pub sub_types: Vec<String>,
    /// SRV port.
    pub port: u16,
    /// Sorted TXT attributes.
    pub txt: TxtList,
    /// Pre-encoded TXT record data.
    pub txt_data: Vec<u8>,
    /// Addresses of `host_name` when it names a published host; backends
    /// that synthesize host records from service registrations need them.
    pub host_addresses: Vec<Ipv6Addr>,
}

/// Everything a backend needs to announce one host (AAAA record).
#[derive(Clone, Debug)]
pub struct HostPublication {
    /// Host name (unqualified).
    pub name: String,
    /// IPv6 address of the host.
    pub address: Ipv6Addr,
}

/// Asynchronous notifications lowered from the backend.
#[derive(Debug)]
pub enum BackendEvent {
    /// The responder became ready or fell back to idle. Falling back
    /// invalidates every outstanding registration.
    StateChanged { state: State },

    /// Outcome of a service publication. `instance_name` is the name the
    /// responder actually announced — it differs from the requested name
    /// when the daemon renamed to escape a conflict.
    ServiceRegistered {
        handle: BackendHandle,
        instance_name: String,
        result: Result<()>,
    },

    /// Outcome of a host publication.
    HostRegistered {
        handle: BackendHandle,
        result: Result<()>,
    },

    /// A browse hit: an instance of the subscribed type appeared.
    InstanceFound {
        handle: BackendHandle,
        netif_index: u32,
        instance_name: String,
    },

    /// A browsed instance announced its departure.
    InstanceGone {
        handle: BackendHandle,
        instance_name: String,
    },

    /// SRV/TXT resolution for a found instance completed.
    InstanceResolved {
        handle: BackendHandle,
        instance_name: String,
        /// Full host name with trailing dot.
        host_name: String,
        port: u16,
        priority: u16,
        weight: u16,
        txt_data: Vec<u8>,
        netif_index: u32,
    },

    /// One address for a resolving instance. `more_coming` defers the
    /// consumer emission until the batch completes.
    InstanceAddress {
        handle: BackendHandle,
        instance_name: String,
        address: Ipv6Addr,
        ttl: u32,
        more_coming: bool,
    },

    /// One address for a subscribed host.
    HostAddress {
        handle: BackendHandle,
        address: Ipv6Addr,
        ttl: u32,
        more_coming: bool,
    },

    /// A subscribed host announced its departure.
    HostGone { handle: BackendHandle },

    /// A browse or resolve failed; the subscription stays installed.
    SubscribeFailed {
        handle: BackendHandle,
        error: crate::error::Error,
    },
}

/// Driver interface every concrete backend implements.
///
/// The interface is total: publisher and subscriber logic never sees
/// which backend is active.
pub trait Backend {
    /// Bring the responder up. Readiness is reported through
    /// [`Backend::is_started`] and `StateChanged` events.
    fn start(&mut self) -> Result<()>;

    /// Tear the responder down, dropping all backend-side state.
    fn stop(&mut self);

    fn is_started(&self) -> bool;

    /// Commit a service publication. The returned handle stays valid
    /// until released, even if registration later fails asynchronously.
    fn publish_service(&mut self, publication: &ServicePublication) -> Result<BackendHandle>;

    /// Withdraw a service publication and free its handle.
    fn release_service(&mut self, handle: BackendHandle);

    /// Commit a host publication.
    fn publish_host(&mut self, publication: &HostPublication) -> Result<BackendHandle>;

    /// Withdraw a host publication and free its handle.
    fn release_host(&mut self, handle: BackendHandle);

    /// Start a browse (`instance_name == None`) or a single-instance
    /// resolution of the given service type.
    fn subscribe_service(
        &mut self,
        service_type: &str,
        instance_name: Option<&str>,
    ) -> Result<BackendHandle>;

    /// Cancel a service subscription and free its handle.
    fn unsubscribe_service(&mut self, handle: BackendHandle);

    /// Start resolving a host's AAAA records.
    fn subscribe_host(&mut self, host_name: &str) -> Result<BackendHandle>;

    /// Cancel a host subscription and free its handle.
    fn unsubscribe_host(&mut self, handle: BackendHandle);

    /// Mainloop hook: contribute fd interests and wakeup deadlines.
    fn update(&mut self, ctx: &mut MainloopContext);

    /// Mainloop hook: make progress and append lowered events.
    fn process(&mut self, ctx: &MainloopContext, events: &mut Vec<BackendEvent>);
}
