// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backend over the embedded `mdns-sd` daemon.
//!
//! The daemon runs its own thread, owns its own multicast socket and
//! timers, and talks through flume channels — none of which the mainloop
//! can put into a poll set. The reconciliation: a poll-bridge timer wakes
//! the mainloop at a short cadence while channels are outstanding, and the
//! timer callback drains every channel into an event queue that
//! [`Backend::process`] hands upward. Commands in the other direction are
//! non-blocking sends, so the mainloop thread never stalls on the daemon.
//!
//! Library limitations surfaced here rather than hidden: the daemon
//! cannot announce a bare AAAA record, so host publications are recorded
//! and folded into the service registrations that reference them; sub-type
//! labels are accepted and logged but not put on the wire; conflict
//! renames happen inside the daemon without notification, so registration
//! results report the requested name.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mdns_sd::{
    DaemonEvent, HostnameResolutionEvent, IfKind, Receiver, ServiceDaemon, ServiceEvent,
    ServiceInfo,
};

use crate::config::{Config, DAEMON_DRAIN_INTERVAL, DEFAULT_DISCOVERY_TTL};
use crate::error::{Error, Result};
use crate::mainloop::poller::{Poller, TimerId};
use crate::mainloop::{MainloopContext, MainloopParticipant};

use super::backend::{Backend, BackendEvent, BackendHandle, HostPublication, ServicePublication};
use super::{encode_txt_data, sort_txt_list, State, TxtEntry, TxtList};

fn mdns_error(e: mdns_sd::Error) -> Error {
    Error::Mdns(e.to_string())
}

/// Host name reported by the kernel, for services published on "this
/// host".
fn system_host_name() -> String {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// `"inst._foo._tcp.local."` with domain `"_foo._tcp.local."` -> `"inst"`.
fn instance_from_fullname<'a>(fullname: &'a str, ty_domain: &str) -> &'a str {
    fullname
        .strip_suffix(ty_domain)
        .map(|s| s.strip_suffix('.').unwrap_or(s))
        .unwrap_or(fullname)
}

struct ServiceRecord {
    fullname: String,
}

struct HostRecord {
    name: String,
}

struct ServiceSubRecord {
    ty_domain: String,
    instance_filter: Option<String>,
    rx: Receiver<ServiceEvent>,
}

struct HostSubRecord {
    fullname: String,
    rx: Receiver<HostnameResolutionEvent>,
}

struct Inner {
    daemon: Option<ServiceDaemon>,
    monitor: Option<Receiver<DaemonEvent>>,
    next_handle: u64,
    services: HashMap<u64, ServiceRecord>,
    hosts: HashMap<u64, HostRecord>,
    service_subs: HashMap<u64, ServiceSubRecord>,
    host_subs: HashMap<u64, HostSubRecord>,
    queue: VecDeque<BackendEvent>,
    netif_index: u32,
}

impl Inner {
    fn mint(&mut self) -> BackendHandle {
        self.next_handle += 1;
        BackendHandle::new(self.next_handle)
    }

    fn has_channels(&self) -> bool {
        self.daemon.is_some()
            && (self.monitor.is_some()
                || !self.service_subs.is_empty()
                || !self.host_subs.is_empty())
    }

    /// Pull everything pending off the daemon channels and lower it into
    /// backend events.
    fn drain(&mut self) {
        if let Some(monitor) = &self.monitor {
            while let Ok(event) = monitor.try_recv() {
                log::debug!("[MDNS] daemon event: {:?}", event);
            }
        }

        let netif_index = self.netif_index;
        let mut lowered = Vec::new();

        for (&raw, record) in &self.service_subs {
            let handle = BackendHandle::new(raw);
            while let Ok(event) = record.rx.try_recv() {
                lower_service_event(
                    handle,
                    record,
                    event,
                    netif_index,
                    &mut lowered,
                );
            }
        }

        for (&raw, record) in &self.host_subs {
            let handle = BackendHandle::new(raw);
            while let Ok(event) = record.rx.try_recv() {
                lower_hostname_event(handle, record, event, &mut lowered);
            }
        }

        self.queue.extend(lowered);
    }
}

fn lower_service_event(
    handle: BackendHandle,
    record: &ServiceSubRecord,
    event: ServiceEvent,
    netif_index: u32,
    out: &mut Vec<BackendEvent>,
) {
    match event {
        ServiceEvent::SearchStarted(_) | ServiceEvent::SearchStopped(_) => {}

        ServiceEvent::ServiceFound(_, fullname) => {
            let instance = instance_from_fullname(&fullname, &record.ty_domain);
            if record
                .instance_filter
                .as_deref()
                .is_some_and(|want| want != instance)
            {
                return;
            }
            out.push(BackendEvent::InstanceFound {
                handle,
                netif_index,
                instance_name: instance.to_string(),
            });
        }

        ServiceEvent::ServiceResolved(info) => {
            let instance =
                instance_from_fullname(info.get_fullname(), &record.ty_domain).to_string();
            if record
                .instance_filter
                .as_deref()
                .is_some_and(|want| want != instance)
            {
                return;
            }

            let txt: TxtList = sort_txt_list(
                info.get_properties()
                    .iter()
                    .map(|p| TxtEntry::new(p.key(), p.val_str().as_bytes()))
                    .collect(),
            );
            let txt_data = encode_txt_data(&txt).unwrap_or_default();

            out.push(BackendEvent::InstanceResolved {
                handle,
                instance_name: instance.clone(),
                host_name: info.get_hostname().to_string(),
                port: info.get_port(),
                priority: 0,
                weight: 0,
                txt_data,
                netif_index,
            });

            let mut addresses: Vec<_> = info
                .get_addresses()
                .iter()
                .filter_map(|addr| match addr {
                    IpAddr::V6(v6) => Some(*v6),
                    IpAddr::V4(_) => None,
                })
                .collect();
            addresses.sort();

            let count = addresses.len();
            for (index, address) in addresses.into_iter().enumerate() {
                out.push(BackendEvent::InstanceAddress {
                    handle,
                    instance_name: instance.clone(),
                    address,
                    ttl: DEFAULT_DISCOVERY_TTL,
                    more_coming: index + 1 < count,
                });
            }
        }

        ServiceEvent::ServiceRemoved(_, fullname) => {
            let instance = instance_from_fullname(&fullname, &record.ty_domain);
            if record
                .instance_filter
                .as_deref()
                .is_some_and(|want| want != instance)
            {
                return;
            }
            out.push(BackendEvent::InstanceGone {
                handle,
                instance_name: instance.to_string(),
            });
        }
    }
}

fn lower_hostname_event(
    handle: BackendHandle,
    record: &HostSubRecord,
    event: HostnameResolutionEvent,
    out: &mut Vec<BackendEvent>,
) {
    match event {
        HostnameResolutionEvent::SearchStarted(_) | HostnameResolutionEvent::SearchStopped(_) => {}

        HostnameResolutionEvent::AddressesFound(_, ref addresses) => {
            let mut v6: Vec<_> = addresses
                .iter()
                .filter_map(|addr| match addr {
                    IpAddr::V6(a) => Some(*a),
                    IpAddr::V4(_) => None,
                })
                .collect();
            v6.sort();

            let count = v6.len();
            for (index, address) in v6.into_iter().enumerate() {
                out.push(BackendEvent::HostAddress {
                    handle,
                    address,
                    ttl: DEFAULT_DISCOVERY_TTL,
                    more_coming: index + 1 < count,
                });
            }
        }

        HostnameResolutionEvent::SearchTimeout(_) => {
            log::debug!("[MDNS] hostname search timeout for {}", record.fullname);
            out.push(BackendEvent::SubscribeFailed {
                handle,
                error: Error::Timeout,
            });
        }

        // Address withdrawals (and anything the library adds later) end
        // the host's presence from our point of view.
        other => {
            log::debug!("[MDNS] hostname event for {}: {:?}", record.fullname, other);
            out.push(BackendEvent::HostGone { handle });
        }
    }
}

/// Production backend over [`mdns_sd::ServiceDaemon`].
pub struct DaemonBackend {
    inner: Rc<RefCell<Inner>>,
    poller: Poller,
    drain_timer: TimerId,
    infra_ifname: String,
}

impl DaemonBackend {
    pub fn new(config: &Config) -> Self {
        let inner = Rc::new(RefCell::new(Inner {
            daemon: None,
            monitor: None,
            next_handle: 0,
            services: HashMap::new(),
            hosts: HashMap::new(),
            service_subs: HashMap::new(),
            host_subs: HashMap::new(),
            queue: VecDeque::new(),
            netif_index: config.infra_netif_index(),
        }));

        let mut poller = Poller::new();
        let timer_cell: Rc<RefCell<Option<TimerId>>> = Rc::new(RefCell::new(None));
        let cell = Rc::clone(&timer_cell);
        let drain_target = Rc::clone(&inner);
        let drain_timer = poller.add_timer(
            None,
            Some(Box::new(move |ops, now| {
                let keep = {
                    let mut inner = drain_target.borrow_mut();
                    inner.drain();
                    inner.has_channels()
                };
                let id = cell.borrow().expect("drain timer id installed");
                if keep {
                    ops.update_timer(id, Some(now + DAEMON_DRAIN_INTERVAL));
                } else {
                    ops.update_timer(id, None);
                }
            })),
        );
        *timer_cell.borrow_mut() = Some(drain_timer);

        Self {
            inner,
            poller,
            drain_timer,
            infra_ifname: config.infra_ifname.clone(),
        }
    }
}

impl Backend for DaemonBackend {
    fn start(&mut self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.daemon.is_some() {
            return Ok(());
        }

        let daemon = ServiceDaemon::new().map_err(mdns_error)?;

        if !self.infra_ifname.is_empty() {
            // Restrict the responder to the infrastructure link; every
            // discovery result is then attributable to it.
            if let Err(e) = daemon.disable_interface(IfKind::All) {
                log::warn!("[MDNS] failed to disable interfaces: {}", e);
            }
            if let Err(e) = daemon.enable_interface(self.infra_ifname.as_str()) {
                log::warn!(
                    "[MDNS] failed to enable interface {}: {}",
                    self.infra_ifname,
                    e
                );
            }
        }

        match daemon.monitor() {
            Ok(monitor) => inner.monitor = Some(monitor),
            Err(e) => log::warn!("[MDNS] failed to monitor daemon: {}", e),
        }

        log::info!("[MDNS] daemon started (netif {})", inner.netif_index);
        inner.daemon = Some(daemon);
        inner
            .queue
            .push_back(BackendEvent::StateChanged { state: State::Ready });
        Ok(())
    }

    fn stop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(daemon) = inner.daemon.take() {
            if let Err(e) = daemon.shutdown() {
                log::warn!("[MDNS] daemon shutdown failed: {}", e);
            }
        }
        inner.monitor = None;
        inner.services.clear();
        inner.hosts.clear();
        inner.service_subs.clear();
        inner.host_subs.clear();
        inner
            .queue
            .push_back(BackendEvent::StateChanged { state: State::Idle });
    }

    fn is_started(&self) -> bool {
        self.inner.borrow().daemon.is_some()
    }

    fn publish_service(&mut self, publication: &ServicePublication) -> Result<BackendHandle> {
        let mut inner = self.inner.borrow_mut();
        let Some(daemon) = inner.daemon.as_ref() else {
            return Err(Error::InvalidState("mDNS daemon is not running"));
        };

        if !publication.sub_types.is_empty() {
            log::warn!(
                "[MDNS] daemon backend cannot announce sub-types {:?} of {}.{}",
                publication.sub_types,
                publication.name,
                publication.service_type
            );
        }

        let ty_domain = format!("{}.local.", publication.service_type);
        let properties: HashMap<String, String> = publication
            .txt
            .iter()
            .map(|entry| {
                (
                    entry.name.clone(),
                    String::from_utf8_lossy(&entry.value).into_owned(),
                )
            })
            .collect();

        let info = if let Some(address) = publication.host_addresses.first() {
            let host_full = format!("{}.local.", publication.host_name);
            ServiceInfo::new(
                &ty_domain,
                &publication.name,
                &host_full,
                IpAddr::V6(*address),
                publication.port,
                properties,
            )
            .map_err(mdns_error)?
        } else {
            let host_full = format!("{}.local.", system_host_name());
            ServiceInfo::new(
                &ty_domain,
                &publication.name,
                &host_full,
                (),
                publication.port,
                properties,
            )
            .map_err(mdns_error)?
            .enable_addr_auto()
        };

        let fullname = info.get_fullname().to_string();
        daemon.register(info).map_err(mdns_error)?;

        let handle = inner.mint();
        inner.services.insert(handle.raw(), ServiceRecord { fullname });
        // The daemon resolves conflicts internally by renaming without
        // telling us; the commit itself is the success signal.
        inner.queue.push_back(BackendEvent::ServiceRegistered {
            handle,
            instance_name: publication.name.clone(),
            result: Ok(()),
        });
        Ok(handle)
    }

    fn release_service(&mut self, handle: BackendHandle) {
        let mut inner = self.inner.borrow_mut();
        if let Some(record) = inner.services.remove(&handle.raw()) {
            if let Some(daemon) = inner.daemon.as_ref() {
                // Best effort; the daemon confirms asynchronously on the
                // returned channel, which nothing needs to wait for.
                if let Err(e) = daemon.unregister(&record.fullname) {
                    log::warn!("[MDNS] failed to unregister {}: {}", record.fullname, e);
                }
            }
        }
    }

    fn publish_host(&mut self, publication: &HostPublication) -> Result<BackendHandle> {
        let mut inner = self.inner.borrow_mut();
        if inner.daemon.is_none() {
            return Err(Error::InvalidState("mDNS daemon is not running"));
        }

        // The daemon has no standalone AAAA registration; the record is
        // synthesized into the service publications that reference this
        // host (`ServicePublication::host_addresses`).
        log::debug!(
            "[MDNS] recording host {} = {}",
            publication.name,
            publication.address
        );

        let handle = inner.mint();
        inner.hosts.insert(
            handle.raw(),
            HostRecord {
                name: publication.name.clone(),
            },
        );
        inner.queue.push_back(BackendEvent::HostRegistered {
            handle,
            result: Ok(()),
        });
        Ok(handle)
    }

    fn release_host(&mut self, handle: BackendHandle) {
        if let Some(record) = self.inner.borrow_mut().hosts.remove(&handle.raw()) {
            log::debug!("[MDNS] dropping host record {}", record.name);
        }
    }

    fn subscribe_service(
        &mut self,
        service_type: &str,
        instance_name: Option<&str>,
    ) -> Result<BackendHandle> {
        let mut inner = self.inner.borrow_mut();
        let Some(daemon) = inner.daemon.as_ref() else {
            return Err(Error::InvalidState("mDNS daemon is not running"));
        };

        let ty_domain = format!("{}.local.", service_type);
        let rx = daemon.browse(&ty_domain).map_err(mdns_error)?;

        let handle = inner.mint();
        inner.service_subs.insert(
            handle.raw(),
            ServiceSubRecord {
                ty_domain,
                instance_filter: instance_name.map(str::to_string),
                rx,
            },
        );
        Ok(handle)
    }

    fn unsubscribe_service(&mut self, handle: BackendHandle) {
        let mut inner = self.inner.borrow_mut();
        if let Some(record) = inner.service_subs.remove(&handle.raw()) {
            let still_browsed = inner
                .service_subs
                .values()
                .any(|r| r.ty_domain == record.ty_domain);
            if !still_browsed {
                if let Some(daemon) = inner.daemon.as_ref() {
                    if let Err(e) = daemon.stop_browse(&record.ty_domain) {
                        log::warn!("[MDNS] failed to stop browse {}: {}", record.ty_domain, e);
                    }
                }
            }
        }
    }

    fn subscribe_host(&mut self, host_name: &str) -> Result<BackendHandle> {
        let mut inner = self.inner.borrow_mut();
        let Some(daemon) = inner.daemon.as_ref() else {
            return Err(Error::InvalidState("mDNS daemon is not running"));
        };

        let fullname = format!("{}.local.", host_name);
        let rx = daemon
            .resolve_hostname(&fullname, None)
            .map_err(mdns_error)?;

        let handle = inner.mint();
        inner
            .host_subs
            .insert(handle.raw(), HostSubRecord { fullname, rx });
        Ok(handle)
    }

    fn unsubscribe_host(&mut self, handle: BackendHandle) {
        let mut inner = self.inner.borrow_mut();
        if let Some(record) = inner.host_subs.remove(&handle.raw()) {
            let still_resolved = inner
                .host_subs
                .values()
                .any(|r| r.fullname == record.fullname);
            if !still_resolved {
                if let Some(daemon) = inner.daemon.as_ref() {
                    if let Err(e) = daemon.stop_resolve_hostname(&record.fullname) {
                        log::warn!(
                            "[MDNS] failed to stop resolving {}: {}",
                            record.fullname,
                            e
                        );
                    }
                }
            }
        }
    }

    fn update(&mut self, ctx: &mut MainloopContext) {
        // Kick the drain timer whenever channels exist but the timer went
        // quiet (its callback disarms itself once there is nothing left).
        if self.inner.borrow().has_channels()
            && self.poller.timer_deadline(self.drain_timer).is_none()
        {
            self.poller.update_timer(self.drain_timer, Some(Instant::now()));
        }

        self.poller.update(ctx);

        if !self.inner.borrow().queue.is_empty() {
            ctx.shrink_timeout(Duration::ZERO);
        }
    }

    fn process(&mut self, ctx: &MainloopContext, events: &mut Vec<BackendEvent>) {
        self.poller.process(ctx);
        events.extend(self.inner.borrow_mut().queue.drain(..));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_from_fullname() {
        assert_eq!(
            instance_from_fullname("peer._srpl-tls._tcp.local.", "_srpl-tls._tcp.local."),
            "peer"
        );
        // Unexpected shape falls back to the input.
        assert_eq!(
            instance_from_fullname("weird", "_srpl-tls._tcp.local."),
            "weird"
        );
    }

    #[test]
    fn test_system_host_name_nonempty() {
        assert!(!system_host_name().is_empty());
    }
}
