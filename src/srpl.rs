// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SRP replication glue: advertises this node's `_srpl-tls._tcp` instance
//! and browses for peers, feeding survivors to the DNS engine's partner
//! callback. Peers discovered here are the ones the DSO agent then opens
//! sessions to.
//!
//! A name collision reported by the responder is handled by renaming:
//! the result callback only flags the work, and the next [`SrplDnssd::process`]
//! tick unpublishes the losing name, draws a fresh random suffix, and
//! republishes — callbacks never re-enter the publisher.

use std::cell::RefCell;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::rc::Rc;

use rand::Rng;

use crate::config::{Config, SRPL_INSTANCE_BASE_NAME, SRPL_SERVICE_TYPE};
use crate::error::{Error, Result};
use crate::mdns::{
    decode_txt_data, is_service_type_equal, DiscoveredInstanceInfo, Publisher, SubscriberId,
    TxtList,
};

/// A replication peer handed to the DNS engine.
#[derive(Clone, Debug)]
pub struct SrplPartnerInfo {
    /// Where to open the DSO session. Meaningless when `removed`.
    pub sock_addr: SocketAddrV6,
    /// Peer's TXT record data (RFC 6763 encoding).
    pub txt_data: Vec<u8>,
    /// True when the peer withdrew its service.
    pub removed: bool,
}

/// Receives every discovered (or withdrawn) replication peer.
pub type PartnerCallback = Box<dyn FnMut(&SrplPartnerInfo)>;

fn generate_instance_name() -> String {
    let suffix = rand::rng().random_range(1..=0xFFFFu16);
    format!("{}({})", SRPL_INSTANCE_BASE_NAME, suffix)
}

struct Shared {
    instance_name: String,
    /// TXT list to keep advertised; `None` once unregistered.
    registered_txt: Option<TxtList>,
    /// Set by the publish result callback on a name collision.
    republish: bool,
}

pub struct SrplDnssd {
    shared: Rc<RefCell<Shared>>,
    partner_callback: Rc<RefCell<PartnerCallback>>,
    subscriber_id: Option<SubscriberId>,
    browsing: bool,
    srpl_port: u16,
    infra_netif_index: u32,
}

impl SrplDnssd {
    pub fn new(config: &Config, partner_callback: PartnerCallback) -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                instance_name: generate_instance_name(),
                registered_txt: None,
                republish: false,
            })),
            partner_callback: Rc::new(RefCell::new(partner_callback)),
            subscriber_id: None,
            browsing: false,
            srpl_port: config.srpl_port,
            infra_netif_index: config.infra_netif_index(),
        }
    }

    /// Instance name currently advertised (changes on collision rename).
    pub fn instance_name(&self) -> String {
        self.shared.borrow().instance_name.clone()
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }

    // ========================================================================
    // Advertisement
    // ========================================================================

    /// Advertise this node with the engine-supplied, pre-encoded TXT
    /// data.
    pub fn register_service(&mut self, publisher: &mut Publisher, txt_data: &[u8]) -> Result<()> {
        let txt = decode_txt_data(txt_data)?;
        self.shared.borrow_mut().registered_txt = Some(txt.clone());
        self.publish(publisher, txt);
        Ok(())
    }

    /// Withdraw this node's advertisement.
    pub fn unregister_service(&mut self, publisher: &mut Publisher) {
        let instance_name = {
            let mut shared = self.shared.borrow_mut();
            shared.registered_txt = None;
            shared.republish = false;
            shared.instance_name.clone()
        };

        log::info!("[SRPL] unpublishing service {}", instance_name);
        publisher.unpublish_service(
            &instance_name,
            SRPL_SERVICE_TYPE,
            Box::new({
                let instance_name = instance_name.clone();
                move |result| {
                    if let Err(e) = result {
                        log::warn!("[SRPL] failed to unpublish {}: {}", instance_name, e);
                    }
                }
            }),
        );
    }

    fn publish(&self, publisher: &mut Publisher, txt: TxtList) {
        let instance_name = self.shared.borrow().instance_name.clone();
        log::info!(
            "[SRPL] publishing {} instance {} on port {}",
            SRPL_SERVICE_TYPE,
            instance_name,
            self.srpl_port
        );

        let shared = Rc::clone(&self.shared);
        publisher.publish_service(
            "",
            &instance_name,
            SRPL_SERVICE_TYPE,
            Vec::new(),
            self.srpl_port,
            txt,
            Box::new(move |result| match result {
                Ok(()) => {
                    log::info!(
                        "[SRPL] service {} published",
                        shared.borrow().instance_name
                    );
                }
                Err(Error::Duplicated) => {
                    // Renaming happens on the next process tick; the
                    // publisher is off limits from inside its callback.
                    log::warn!(
                        "[SRPL] instance {} collided, will rename",
                        shared.borrow().instance_name
                    );
                    shared.borrow_mut().republish = true;
                }
                Err(Error::Aborted) => {
                    log::debug!("[SRPL] publication superseded");
                }
                Err(e) => {
                    log::error!("[SRPL] failed to publish service: {}", e);
                }
            }),
        );
    }

    // ========================================================================
    // Peer browse
    // ========================================================================

    /// Start browsing for replication peers.
    pub fn start_browse(&mut self, publisher: &mut Publisher) -> Result<()> {
        if self.browsing {
            return Ok(());
        }

        let shared = Rc::clone(&self.shared);
        let partner_callback = Rc::clone(&self.partner_callback);
        let infra_netif_index = self.infra_netif_index;
        let id = publisher.add_subscription_callbacks(
            Some(Box::new(move |service_type, info| {
                handle_discovered_instance(
                    &shared,
                    infra_netif_index,
                    &partner_callback,
                    service_type,
                    info,
                );
            })),
            None,
        );

        if let Err(e) = publisher.subscribe_service(SRPL_SERVICE_TYPE, None) {
            publisher.remove_subscription_callbacks(id);
            return Err(e);
        }

        self.subscriber_id = Some(id);
        self.browsing = true;
        Ok(())
    }

    /// Stop browsing for replication peers.
    pub fn stop_browse(&mut self, publisher: &mut Publisher) {
        if !self.browsing {
            return;
        }

        if let Err(e) = publisher.unsubscribe_service(SRPL_SERVICE_TYPE, None) {
            log::warn!("[SRPL] failed to unsubscribe: {}", e);
        }
        if let Some(id) = self.subscriber_id.take() {
            publisher.remove_subscription_callbacks(id);
        }
        self.browsing = false;
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Deferred work: collision renames and republish-after-restart.
    /// Call once per mainloop tick, after the publisher processed.
    pub fn process(&mut self, publisher: &mut Publisher) {
        let needs_rename = {
            let mut shared = self.shared.borrow_mut();
            std::mem::take(&mut shared.republish)
        };

        if needs_rename {
            let old_name = self.shared.borrow().instance_name.clone();
            publisher.unpublish_service(
                &old_name,
                SRPL_SERVICE_TYPE,
                Box::new({
                    let old_name = old_name.clone();
                    move |result| {
                        if let Err(e) = result {
                            log::warn!("[SRPL] failed to unpublish {}: {}", old_name, e);
                        }
                    }
                }),
            );

            let new_name = generate_instance_name();
            log::warn!("[SRPL] renamed SRPL service instance to {}", new_name);
            self.shared.borrow_mut().instance_name = new_name;

            let txt = self.shared.borrow().registered_txt.clone();
            if let Some(txt) = txt {
                self.publish(publisher, txt);
            }
            return;
        }

        // Adopt a responder-chosen rename so self-suppression keeps
        // matching what is actually on the wire.
        if let Some(registration) = publisher.find_service_registration_by_type(SRPL_SERVICE_TYPE)
        {
            let mut shared = self.shared.borrow_mut();
            if registration.name != shared.instance_name {
                log::info!(
                    "[SRPL] adopting responder-chosen instance name {}",
                    registration.name
                );
                shared.instance_name = registration.name.clone();
            }
        } else if publisher.is_started() {
            // The responder dropped our records (restart, collision
            // cascade); rebuild from the retained TXT list.
            let txt = self.shared.borrow().registered_txt.clone();
            if let Some(txt) = txt {
                log::info!("[SRPL] republishing service after responder restart");
                self.publish(publisher, txt);
            }
        }
    }
}

fn handle_discovered_instance(
    shared: &Rc<RefCell<Shared>>,
    infra_netif_index: u32,
    partner_callback: &Rc<RefCell<PartnerCallback>>,
    service_type: &str,
    info: &DiscoveredInstanceInfo,
) {
    if !is_service_type_equal(service_type, SRPL_SERVICE_TYPE) {
        return;
    }
    if info.name.eq_ignore_ascii_case(&shared.borrow().instance_name) {
        // Our own advertisement.
        return;
    }
    if info.netif_index != infra_netif_index {
        log::debug!(
            "[SRPL] ignoring peer {} on foreign netif {}",
            info.name,
            info.netif_index
        );
        return;
    }

    let partner = if info.removed {
        SrplPartnerInfo {
            sock_addr: SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0),
            txt_data: Vec::new(),
            removed: true,
        }
    } else {
        let Some(address) = info.addresses.first() else {
            // Nothing to connect to yet; a later address batch will
            // re-announce.
            return;
        };
        SrplPartnerInfo {
            sock_addr: SocketAddrV6::new(*address, info.port, 0, 0),
            txt_data: info.txt_data.clone(),
            removed: false,
        }
    };

    log::info!(
        "[SRPL] discovered peer {}{}",
        info.name,
        if partner.removed { " (removed)" } else { "" }
    );
    (partner_callback.borrow_mut())(&partner);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::Mainloop;
    use crate::mdns::mock::MockBackend;
    use crate::mdns::BackendEvent;
    use std::time::Duration;

    type Partners = Rc<RefCell<Vec<SrplPartnerInfo>>>;

    fn setup() -> (Publisher, crate::mdns::MockControl, SrplDnssd, Partners) {
        let (backend, control) = MockBackend::new();
        let mut publisher = Publisher::new(Box::new(backend), Box::new(|_| {}));
        publisher.start().unwrap();

        let partners: Partners = Rc::default();
        let sink = Rc::clone(&partners);
        let srpl = SrplDnssd::new(
            &Config::default(),
            Box::new(move |partner| sink.borrow_mut().push(partner.clone())),
        );
        (publisher, control, srpl, partners)
    }

    fn tick(publisher: &mut Publisher, srpl: &mut SrplDnssd) {
        let mut mainloop = Mainloop::with_max_poll_timeout(Duration::from_millis(10));
        mainloop.poll_once(&mut [&mut *publisher]).unwrap();
        srpl.process(publisher);
    }

    #[test]
    fn test_register_publishes_decoded_txt() {
        let (mut publisher, control, mut srpl, _partners) = setup();

        srpl.register_service(&mut publisher, &[3, b'k', b'=', b'v']).unwrap();

        let name = srpl.instance_name();
        let handle = control.find_service(&name, SRPL_SERVICE_TYPE).unwrap();
        let publication = control.service_publication(handle).unwrap();
        assert_eq!(publication.port, 853);
        assert_eq!(publication.txt_data, vec![3, b'k', b'=', b'v']);
        assert!(name.starts_with("srpl("));
    }

    #[test]
    fn test_collision_renames_and_retries() {
        let (mut publisher, control, mut srpl, _partners) = setup();

        srpl.register_service(&mut publisher, &[3, b'k', b'=', b'v']).unwrap();
        let first_name = srpl.instance_name();
        let first = control.find_service(&first_name, SRPL_SERVICE_TYPE).unwrap();

        control.complete_service(first, None, Err(Error::Duplicated));
        tick(&mut publisher, &mut srpl);

        let second_name = srpl.instance_name();
        assert_ne!(second_name, first_name, "collision must rename");

        let second = control
            .find_service(&second_name, SRPL_SERVICE_TYPE)
            .expect("republished under the new name");
        control.complete_service(second, None, Ok(()));
        tick(&mut publisher, &mut srpl);

        assert!(publisher
            .find_service_registration(&second_name, SRPL_SERVICE_TYPE)
            .unwrap()
            .is_completed());
        // Name stays stable once registration settles.
        tick(&mut publisher, &mut srpl);
        assert_eq!(srpl.instance_name(), second_name);
    }

    #[test]
    fn test_unregister_withdraws_and_stops_republishing() {
        let (mut publisher, control, mut srpl, _partners) = setup();

        srpl.register_service(&mut publisher, &[]).unwrap();
        let name = srpl.instance_name();
        let handle = control.find_service(&name, SRPL_SERVICE_TYPE).unwrap();
        control.complete_service(handle, None, Ok(()));
        tick(&mut publisher, &mut srpl);

        srpl.unregister_service(&mut publisher);
        assert!(publisher
            .find_service_registration_by_type(SRPL_SERVICE_TYPE)
            .is_none());

        // No respawn on later ticks.
        tick(&mut publisher, &mut srpl);
        assert!(control.find_service(&srpl.instance_name(), SRPL_SERVICE_TYPE).is_none());
    }

    fn push_resolved_peer(
        control: &crate::mdns::MockControl,
        handle: crate::mdns::BackendHandle,
        name: &str,
        netif_index: u32,
        address: Option<Ipv6Addr>,
    ) {
        control.push_event(BackendEvent::InstanceResolved {
            handle,
            instance_name: name.to_string(),
            host_name: format!("{}.local.", name),
            port: 853,
            priority: 0,
            weight: 0,
            txt_data: vec![3, b'i', b'=', b'1'],
            netif_index,
        });
        if let Some(address) = address {
            control.push_event(BackendEvent::InstanceAddress {
                handle,
                instance_name: name.to_string(),
                address,
                ttl: 120,
                more_coming: false,
            });
        }
    }

    #[test]
    fn test_browse_filters_and_forwards_peers() {
        let (mut publisher, control, mut srpl, partners) = setup();

        srpl.start_browse(&mut publisher).unwrap();
        assert!(srpl.is_browsing());
        let sub = control.find_service_subscription(SRPL_SERVICE_TYPE).unwrap();

        // Self-advertisement: suppressed.
        push_resolved_peer(
            &control,
            sub,
            &srpl.instance_name(),
            0,
            Some("fd00::1".parse().unwrap()),
        );
        // Foreign interface: filtered.
        push_resolved_peer(&control, sub, "peer-a", 9, Some("fd00::2".parse().unwrap()));
        // Good peer on our interface (index 0, unbound config).
        push_resolved_peer(&control, sub, "peer-b", 0, Some("fd00::3".parse().unwrap()));
        tick(&mut publisher, &mut srpl);

        let partners = partners.borrow();
        assert_eq!(partners.len(), 1);
        assert_eq!(
            partners[0].sock_addr,
            SocketAddrV6::new("fd00::3".parse().unwrap(), 853, 0, 0)
        );
        assert_eq!(partners[0].txt_data, vec![3, b'i', b'=', b'1']);
        assert!(!partners[0].removed);
    }

    #[test]
    fn test_peer_without_addresses_not_forwarded() {
        let (mut publisher, control, mut srpl, partners) = setup();

        srpl.start_browse(&mut publisher).unwrap();
        let sub = control.find_service_subscription(SRPL_SERVICE_TYPE).unwrap();

        // Resolution that never produces an address must not reach the
        // engine, whether it surfaces at batch end or on timeout.
        push_resolved_peer(&control, sub, "peer-c", 0, None);
        control.push_event(BackendEvent::InstanceAddress {
            handle: sub,
            instance_name: "peer-c".to_string(),
            address: "fe80::1".parse().unwrap(),
            ttl: 60,
            more_coming: false,
        });
        tick(&mut publisher, &mut srpl);
        assert!(partners.borrow().is_empty());
    }

    #[test]
    fn test_removed_peer_forwarded() {
        let (mut publisher, control, mut srpl, partners) = setup();

        srpl.start_browse(&mut publisher).unwrap();
        let sub = control.find_service_subscription(SRPL_SERVICE_TYPE).unwrap();

        control.push_event(BackendEvent::InstanceGone {
            handle: sub,
            instance_name: "peer-d".to_string(),
        });
        tick(&mut publisher, &mut srpl);

        let partners = partners.borrow();
        assert_eq!(partners.len(), 1);
        assert!(partners[0].removed);
    }

    #[test]
    fn test_stop_browse_silences_discoveries() {
        let (mut publisher, control, mut srpl, partners) = setup();

        srpl.start_browse(&mut publisher).unwrap();
        let sub = control.find_service_subscription(SRPL_SERVICE_TYPE).unwrap();
        srpl.stop_browse(&mut publisher);
        assert!(!srpl.is_browsing());
        assert!(control.was_released(sub));

        // Events on the dead subscription go nowhere.
        push_resolved_peer(&control, sub, "peer-e", 0, Some("fd00::9".parse().unwrap()));
        tick(&mut publisher, &mut srpl);
        assert!(partners.borrow().is_empty());
    }
}
