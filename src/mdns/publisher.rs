// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration table and the unified publish/subscribe front.
//!
//! Registrations are keyed by fully-qualified name. At most one is in
//! flight per key: re-publishing with different parameters aborts and
//! replaces the old one, re-publishing identically either completes
//! immediately (if already established) or chains onto the pending
//! completion callback. Every callback runs exactly once — with the
//! result, or with `Aborted` when its registration is torn down first.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::mainloop::{MainloopContext, MainloopParticipant};

use super::backend::{Backend, BackendEvent, BackendHandle, HostPublication, ServicePublication};
use super::subscriber::{
    HostEmissions, HostSubscription, InstanceEmissions, ServiceSubscription,
};
use super::{
    encode_txt_data, make_full_host_name, make_full_service_name, sort_sub_type_list,
    sort_txt_list, HostCallback, InstanceCallback, ResultCallback, State, StateCallback,
    SubTypeList, SubscriberId, TxtEntry, TxtList,
};

// ============================================================================
// Registrations
// ============================================================================

/// A committed service publication.
pub struct ServiceRegistration {
    /// Host the SRV record points at; empty means "this host".
    pub host_name: String,
    /// Instance name, updated if the responder renames.
    pub name: String,
    /// Service type without trailing dot.
    pub service_type: String,
    /// Sorted sub-type labels.
    pub sub_types: SubTypeList,
    pub port: u16,
    /// Sorted TXT attributes.
    pub txt: TxtList,
    handle: BackendHandle,
    callback: Option<ResultCallback>,
    completed: bool,
}

impl ServiceRegistration {
    /// A registration is outdated against new inputs iff any captured
    /// parameter differs (inputs pre-sorted).
    fn is_outdated(
        &self,
        host_name: &str,
        name: &str,
        service_type: &str,
        sub_types: &[String],
        port: u16,
        txt: &[TxtEntry],
    ) -> bool {
        !(self.host_name == host_name
            && self.name == name
            && self.service_type == service_type
            && self.sub_types == sub_types
            && self.port == port
            && self.txt == txt)
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

impl Drop for ServiceRegistration {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(Error::Aborted));
        }
    }
}

/// A committed host publication.
pub struct HostRegistration {
    pub name: String,
    pub address: Ipv6Addr,
    handle: BackendHandle,
    callback: Option<ResultCallback>,
    completed: bool,
}

impl HostRegistration {
    fn is_outdated(&self, name: &str, address: &Ipv6Addr) -> bool {
        !(self.name == name && self.address == *address)
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

impl Drop for HostRegistration {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(Error::Aborted));
        }
    }
}

fn chain_callbacks(existing: ResultCallback, new: ResultCallback) -> ResultCallback {
    Box::new(move |result: Result<()>| {
        existing(result.clone());
        new(result);
    })
}

fn strip_trailing_dot(service_type: &str) -> &str {
    service_type.strip_suffix('.').unwrap_or(service_type)
}

enum DuplicateAction {
    Fresh,
    RemoveOutdated,
    CompletedIdentical,
    ChainPending,
}

// ============================================================================
// Publisher
// ============================================================================

/// Unified mDNS front: publishes services and hosts, subscribes to
/// browses and resolutions, fans out discoveries.
pub struct Publisher {
    backend: Box<dyn Backend>,
    state: State,
    state_callback: StateCallback,
    services: HashMap<String, ServiceRegistration>,
    hosts: HashMap<String, HostRegistration>,
    service_subscriptions: Vec<ServiceSubscription>,
    host_subscriptions: Vec<HostSubscription>,
    instance_callbacks: Vec<(SubscriberId, InstanceCallback)>,
    host_callbacks: Vec<(SubscriberId, HostCallback)>,
    next_subscriber_id: SubscriberId,
}

impl Publisher {
    pub fn new(backend: Box<dyn Backend>, state_callback: StateCallback) -> Self {
        Self {
            backend,
            state: State::Idle,
            state_callback,
            services: HashMap::new(),
            hosts: HashMap::new(),
            service_subscriptions: Vec::new(),
            host_subscriptions: Vec::new(),
            instance_callbacks: Vec::new(),
            host_callbacks: Vec::new(),
            next_subscriber_id: 1,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn start(&mut self) -> Result<()> {
        if self.state == State::Ready {
            return Ok(());
        }
        self.backend.start()?;
        if self.backend.is_started() {
            self.set_state(State::Ready);
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.clear_registrations();
        self.clear_subscriptions();
        self.backend.stop();
        self.set_state(State::Idle);
    }

    pub fn is_started(&self) -> bool {
        self.state == State::Ready
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        log::info!("[MDNS] publisher state: {:?} -> {:?}", self.state, state);
        self.state = state;
        if state != State::Ready {
            // The responder lost its records; pending work is void and
            // consumers must republish once ready again.
            self.clear_registrations();
        }
        (self.state_callback)(state);
    }

    fn clear_registrations(&mut self) {
        for (_, mut registration) in self.services.drain() {
            if let Some(callback) = registration.callback.take() {
                callback(Err(Error::Aborted));
            }
            self.backend.release_service(registration.handle);
        }
        for (_, mut registration) in self.hosts.drain() {
            if let Some(callback) = registration.callback.take() {
                callback(Err(Error::Aborted));
            }
            self.backend.release_host(registration.handle);
        }
    }

    fn clear_subscriptions(&mut self) {
        for subscription in self.service_subscriptions.drain(..) {
            self.backend.unsubscribe_service(subscription.handle);
        }
        for subscription in self.host_subscriptions.drain(..) {
            self.backend.unsubscribe_host(subscription.handle);
        }
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Publish (or re-publish) a service instance. The outcome arrives
    /// through `callback`, exactly once.
    pub fn publish_service(
        &mut self,
        host_name: &str,
        name: &str,
        service_type: &str,
        sub_types: SubTypeList,
        port: u16,
        txt: TxtList,
        callback: ResultCallback,
    ) {
        let service_type = strip_trailing_dot(service_type).to_string();

        if self.state != State::Ready {
            callback(Err(Error::InvalidState("mDNS publisher is not ready")));
            return;
        }

        let mut host_addresses = Vec::new();
        if !host_name.is_empty() {
            // The referenced host must already be published.
            match self.find_host_registration(host_name) {
                Some(host) => host_addresses.push(host.address),
                None => {
                    callback(Err(Error::InvalidArgs(format!(
                        "service host {} is not published",
                        host_name
                    ))));
                    return;
                }
            }
        }

        let sub_types = sort_sub_type_list(sub_types);
        let txt = sort_txt_list(txt);

        let Some(callback) = self.handle_duplicate_service_registration(
            host_name,
            name,
            &service_type,
            &sub_types,
            port,
            &txt,
            callback,
        ) else {
            return;
        };

        let txt_data = match encode_txt_data(&txt) {
            Ok(data) => data,
            Err(error) => {
                callback(Err(error));
                return;
            }
        };

        let publication = ServicePublication {
            host_name: host_name.to_string(),
            name: name.to_string(),
            service_type: service_type.clone(),
            sub_types: sub_types.clone(),
            port,
            txt: txt.clone(),
            txt_data,
            host_addresses,
        };

        match self.backend.publish_service(&publication) {
            Ok(handle) => {
                log::info!("[MDNS] publishing service {}.{}", name, service_type);
                self.services.insert(
                    make_full_service_name(name, &service_type),
                    ServiceRegistration {
                        host_name: host_name.to_string(),
                        name: name.to_string(),
                        service_type,
                        sub_types,
                        port,
                        txt,
                        handle,
                        callback: Some(callback),
                        completed: false,
                    },
                );
            }
            Err(error) => {
                log::error!(
                    "[MDNS] failed to publish service {}.{}: {}",
                    name,
                    service_type,
                    error
                );
                callback(Err(error));
            }
        }
    }

    /// Withdraw a service instance. Completes with `Ok` even when nothing
    /// was registered.
    pub fn unpublish_service(&mut self, name: &str, service_type: &str, callback: ResultCallback) {
        let service_type = strip_trailing_dot(service_type);
        self.remove_service_registration(name, service_type);
        callback(Ok(()));
    }

    /// Publish (or re-publish) a host AAAA record.
    pub fn publish_host(&mut self, name: &str, address: Ipv6Addr, callback: ResultCallback) {
        if self.state != State::Ready {
            callback(Err(Error::InvalidState("mDNS publisher is not ready")));
            return;
        }

        let Some(callback) = self.handle_duplicate_host_registration(name, &address, callback)
        else {
            return;
        };

        let publication = HostPublication {
            name: name.to_string(),
            address,
        };

        match self.backend.publish_host(&publication) {
            Ok(handle) => {
                log::info!("[MDNS] publishing host {}", name);
                self.hosts.insert(
                    make_full_host_name(name),
                    HostRegistration {
                        name: name.to_string(),
                        address,
                        handle,
                        callback: Some(callback),
                        completed: false,
                    },
                );
            }
            Err(error) => {
                log::error!("[MDNS] failed to publish host {}: {}", name, error);
                callback(Err(error));
            }
        }
    }

    /// Withdraw a host. Completes with `Ok` even when nothing was
    /// registered.
    pub fn unpublish_host(&mut self, name: &str, callback: ResultCallback) {
        self.remove_host_registration(name);
        callback(Ok(()));
    }

    // ========================================================================
    // Duplicate reconciliation
    // ========================================================================

    fn handle_duplicate_service_registration(
        &mut self,
        host_name: &str,
        name: &str,
        service_type: &str,
        sub_types: &[String],
        port: u16,
        txt: &TxtList,
        callback: ResultCallback,
    ) -> Option<ResultCallback> {
        let key = make_full_service_name(name, service_type);

        let action = match self.services.get(&key) {
            None => DuplicateAction::Fresh,
            Some(existing)
                if existing.is_outdated(host_name, name, service_type, sub_types, port, txt) =>
            {
                DuplicateAction::RemoveOutdated
            }
            Some(existing) if existing.is_completed() => DuplicateAction::CompletedIdentical,
            Some(_) => DuplicateAction::ChainPending,
        };

        match action {
            DuplicateAction::Fresh => Some(callback),
            DuplicateAction::RemoveOutdated => {
                self.remove_service_registration(name, service_type);
                Some(callback)
            }
            DuplicateAction::CompletedIdentical => {
                // Already registered with exactly these parameters.
                callback(Ok(()));
                None
            }
            DuplicateAction::ChainPending => {
                let existing = self.services.get_mut(&key).unwrap();
                existing.callback = Some(match existing.callback.take() {
                    Some(previous) => chain_callbacks(previous, callback),
                    None => callback,
                });
                None
            }
        }
    }

    fn handle_duplicate_host_registration(
        &mut self,
        name: &str,
        address: &Ipv6Addr,
        callback: ResultCallback,
    ) -> Option<ResultCallback> {
        let key = make_full_host_name(name);

        let action = match self.hosts.get(&key) {
            None => DuplicateAction::Fresh,
            Some(existing) if existing.is_outdated(name, address) => {
                DuplicateAction::RemoveOutdated
            }
            Some(existing) if existing.is_completed() => DuplicateAction::CompletedIdentical,
            Some(_) => DuplicateAction::ChainPending,
        };

        match action {
            DuplicateAction::Fresh => Some(callback),
            DuplicateAction::RemoveOutdated => {
                self.remove_host_registration(name);
                Some(callback)
            }
            DuplicateAction::CompletedIdentical => {
                callback(Ok(()));
                None
            }
            DuplicateAction::ChainPending => {
                let existing = self.hosts.get_mut(&key).unwrap();
                existing.callback = Some(match existing.callback.take() {
                    Some(previous) => chain_callbacks(previous, callback),
                    None => callback,
                });
                None
            }
        }
    }

    // ========================================================================
    // Registration table
    // ========================================================================

    pub fn find_service_registration(
        &self,
        name: &str,
        service_type: &str,
    ) -> Option<&ServiceRegistration> {
        self.services
            .get(&make_full_service_name(name, strip_trailing_dot(service_type)))
    }

    /// First registration of the given type, whatever its instance name.
    /// The SRPL glue uses this to learn a daemon-chosen rename.
    pub fn find_service_registration_by_type(
        &self,
        service_type: &str,
    ) -> Option<&ServiceRegistration> {
        let service_type = strip_trailing_dot(service_type);
        self.services
            .values()
            .find(|r| r.service_type == service_type)
    }

    pub fn find_host_registration(&self, name: &str) -> Option<&HostRegistration> {
        self.hosts.get(&make_full_host_name(name))
    }

    fn remove_service_registration(&mut self, name: &str, service_type: &str) {
        let key = make_full_service_name(name, service_type);
        if let Some(mut registration) = self.services.remove(&key) {
            log::info!("[MDNS] removing service {}.{}", name, service_type);
            // Pending callback aborts before the backend side is freed.
            if let Some(callback) = registration.callback.take() {
                callback(Err(Error::Aborted));
            }
            self.backend.release_service(registration.handle);
        }
    }

    fn remove_host_registration(&mut self, name: &str) {
        if let Some(mut registration) = self.hosts.remove(&make_full_host_name(name)) {
            log::info!("[MDNS] removing host {}", name);
            if let Some(callback) = registration.callback.take() {
                callback(Err(Error::Aborted));
            }
            self.backend.release_host(registration.handle);
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe to a service type (browse) or a single instance
    /// (resolve).
    pub fn subscribe_service(
        &mut self,
        service_type: &str,
        instance_name: Option<&str>,
    ) -> Result<()> {
        let service_type = strip_trailing_dot(service_type);
        let handle = self.backend.subscribe_service(service_type, instance_name)?;
        self.service_subscriptions
            .push(ServiceSubscription::new(service_type, instance_name, handle));
        log::info!(
            "[MDNS] subscribe service {}.{} (total {})",
            instance_name.unwrap_or(""),
            service_type,
            self.service_subscriptions.len()
        );
        Ok(())
    }

    /// Cancel a service subscription; backend resources are released
    /// before return.
    pub fn unsubscribe_service(
        &mut self,
        service_type: &str,
        instance_name: Option<&str>,
    ) -> Result<()> {
        let service_type = strip_trailing_dot(service_type);
        let position = self
            .service_subscriptions
            .iter()
            .position(|s| s.matches(service_type, instance_name))
            .ok_or(Error::NotFound)?;

        let subscription = self.service_subscriptions.remove(position);
        self.backend.unsubscribe_service(subscription.handle);
        log::info!(
            "[MDNS] unsubscribe service {}.{} (left {})",
            instance_name.unwrap_or(""),
            service_type,
            self.service_subscriptions.len()
        );
        Ok(())
    }

    /// Subscribe to a host's AAAA records.
    pub fn subscribe_host(&mut self, host_name: &str) -> Result<()> {
        let handle = self.backend.subscribe_host(host_name)?;
        self.host_subscriptions
            .push(HostSubscription::new(host_name, handle));
        log::info!(
            "[MDNS] subscribe host {} (total {})",
            host_name,
            self.host_subscriptions.len()
        );
        Ok(())
    }

    /// Cancel a host subscription.
    pub fn unsubscribe_host(&mut self, host_name: &str) -> Result<()> {
        let position = self
            .host_subscriptions
            .iter()
            .position(|s| s.host_name == host_name)
            .ok_or(Error::NotFound)?;

        let subscription = self.host_subscriptions.remove(position);
        self.backend.unsubscribe_host(subscription.handle);
        log::info!(
            "[MDNS] unsubscribe host {} (left {})",
            host_name,
            self.host_subscriptions.len()
        );
        Ok(())
    }

    /// Register discovery observers; the returned id removes both.
    pub fn add_subscription_callbacks(
        &mut self,
        instance_callback: Option<InstanceCallback>,
        host_callback: Option<HostCallback>,
    ) -> SubscriberId {
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;

        if let Some(callback) = instance_callback {
            self.instance_callbacks.push((id, callback));
        }
        if let Some(callback) = host_callback {
            self.host_callbacks.push((id, callback));
        }
        id
    }

    pub fn remove_subscription_callbacks(&mut self, id: SubscriberId) {
        self.instance_callbacks.retain(|(cb_id, _)| *cb_id != id);
        self.host_callbacks.retain(|(cb_id, _)| *cb_id != id);
    }

    // ========================================================================
    // Backend event handling
    // ========================================================================

    fn handle_backend_event(
        &mut self,
        event: BackendEvent,
        instance_emissions: &mut InstanceEmissions,
        host_emissions: &mut HostEmissions,
    ) {
        match event {
            BackendEvent::StateChanged { state } => self.set_state(state),

            BackendEvent::ServiceRegistered {
                handle,
                instance_name,
                result,
            } => self.complete_service_registration(handle, &instance_name, result),

            BackendEvent::HostRegistered { handle, result } => {
                self.complete_host_registration(handle, result)
            }

            BackendEvent::InstanceFound {
                handle,
                netif_index,
                instance_name,
            } => {
                let now = Instant::now();
                if let Some(subscription) = self.service_subscription_mut(handle) {
                    subscription.handle_found(&instance_name, netif_index, now);
                }
            }

            BackendEvent::InstanceGone {
                handle,
                instance_name,
            } => {
                if let Some(subscription) = self.service_subscription_mut(handle) {
                    subscription.handle_gone(&instance_name, instance_emissions);
                }
            }

            BackendEvent::InstanceResolved {
                handle,
                instance_name,
                host_name,
                port,
                priority,
                weight,
                txt_data,
                netif_index,
            } => {
                let now = Instant::now();
                if let Some(subscription) = self.service_subscription_mut(handle) {
                    subscription.handle_resolved(
                        &instance_name,
                        &host_name,
                        port,
                        priority,
                        weight,
                        txt_data,
                        netif_index,
                        now,
                    );
                }
            }

            BackendEvent::InstanceAddress {
                handle,
                instance_name,
                address,
                ttl,
                more_coming,
            } => {
                let now = Instant::now();
                if let Some(subscription) = self.service_subscription_mut(handle) {
                    subscription.handle_address(
                        &instance_name,
                        address,
                        ttl,
                        more_coming,
                        now,
                        instance_emissions,
                    );
                }
            }

            BackendEvent::HostAddress {
                handle,
                address,
                ttl,
                more_coming,
            } => {
                if let Some(subscription) = self.host_subscription_mut(handle) {
                    subscription.handle_address(address, ttl, more_coming, host_emissions);
                }
            }

            BackendEvent::HostGone { handle } => {
                if let Some(subscription) = self.host_subscription_mut(handle) {
                    subscription.handle_gone(host_emissions);
                }
            }

            BackendEvent::SubscribeFailed { handle, error } => {
                // Log and continue; the subscription stays installed.
                log::warn!(
                    "[MDNS] resolve failed on subscription {:?}: {}",
                    handle,
                    error
                );
            }
        }
    }

    fn service_subscription_mut(
        &mut self,
        handle: BackendHandle,
    ) -> Option<&mut ServiceSubscription> {
        self.service_subscriptions
            .iter_mut()
            .find(|s| s.handle == handle)
    }

    fn host_subscription_mut(&mut self, handle: BackendHandle) -> Option<&mut HostSubscription> {
        self.host_subscriptions
            .iter_mut()
            .find(|s| s.handle == handle)
    }

    fn complete_service_registration(
        &mut self,
        handle: BackendHandle,
        instance_name: &str,
        result: Result<()>,
    ) {
        let Some(key) = self
            .services
            .iter()
            .find(|(_, r)| r.handle == handle)
            .map(|(key, _)| key.clone())
        else {
            log::warn!("[MDNS] registration result for unknown service handle {:?}", handle);
            return;
        };

        // The responder may have renamed the instance to dodge a
        // conflict; adopt the observed name before completing.
        let mut registration = self.services.remove(&key).unwrap();
        if registration.name != instance_name && !instance_name.is_empty() {
            log::info!(
                "[MDNS] service {}.{} renamed to {}.{}",
                registration.name,
                registration.service_type,
                instance_name,
                registration.service_type
            );
            registration.name = instance_name.to_string();
        }
        let key = make_full_service_name(&registration.name, &registration.service_type);

        match result {
            Ok(()) => {
                log::info!(
                    "[MDNS] successfully registered service {}.{}",
                    registration.name,
                    registration.service_type
                );
                registration.completed = true;
                if let Some(callback) = registration.callback.take() {
                    callback(Ok(()));
                }
                self.services.insert(key, registration);
            }
            Err(error) => {
                log::error!(
                    "[MDNS] failed to register service {}.{}: {}",
                    registration.name,
                    registration.service_type,
                    error
                );
                if let Some(callback) = registration.callback.take() {
                    callback(Err(error));
                }
                self.backend.release_service(registration.handle);
                // Dropped without re-inserting: the registration is gone.
            }
        }
    }

    fn complete_host_registration(&mut self, handle: BackendHandle, result: Result<()>) {
        let Some(key) = self
            .hosts
            .iter()
            .find(|(_, r)| r.handle == handle)
            .map(|(key, _)| key.clone())
        else {
            log::warn!("[MDNS] registration result for unknown host handle {:?}", handle);
            return;
        };

        match result {
            Ok(()) => {
                let registration = self.hosts.get_mut(&key).unwrap();
                log::info!("[MDNS] successfully registered host {}", registration.name);
                registration.completed = true;
                if let Some(callback) = registration.callback.take() {
                    callback(Ok(()));
                }
            }
            Err(error) => {
                let mut registration = self.hosts.remove(&key).unwrap();
                log::error!(
                    "[MDNS] failed to register host {}: {}",
                    registration.name,
                    error
                );
                if let Some(callback) = registration.callback.take() {
                    callback(Err(error));
                }
                self.backend.release_host(registration.handle);
            }
        }
    }
}

impl MainloopParticipant for Publisher {
    fn update(&mut self, ctx: &mut MainloopContext) {
        self.backend.update(ctx);

        let now = Instant::now();
        for subscription in &self.service_subscriptions {
            if let Some(deadline) = subscription.earliest_deadline() {
                ctx.shrink_timeout(deadline.saturating_duration_since(now));
            }
        }
    }

    fn process(&mut self, ctx: &MainloopContext) {
        let mut events = Vec::new();
        self.backend.process(ctx, &mut events);

        let mut instance_emissions = InstanceEmissions::new();
        let mut host_emissions = HostEmissions::new();

        for event in events {
            self.handle_backend_event(event, &mut instance_emissions, &mut host_emissions);
        }

        let now = Instant::now();
        for subscription in &mut self.service_subscriptions {
            subscription.check_deadlines(now, &mut instance_emissions);
        }

        // Dispatch after all state mutation so observers see a settled
        // table and may themselves subscribe or publish next tick.
        for (service_type, info) in instance_emissions {
            log::info!(
                "[MDNS] instance {} of {} resolved ({} addresses{})",
                info.name,
                service_type,
                info.addresses.len(),
                if info.removed { ", removed" } else { "" }
            );
            for (_, callback) in self.instance_callbacks.iter_mut() {
                callback(&service_type, &info);
            }
        }
        for (host_name, info) in host_emissions {
            log::info!(
                "[MDNS] host {} resolved ({} addresses{})",
                host_name,
                info.addresses.len(),
                if info.removed { ", removed" } else { "" }
            );
            for (_, callback) in self.host_callbacks.iter_mut() {
                callback(&host_name, &info);
            }
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.clear_registrations();
    }
}

// ============================================================================
// Tests
// ============================================================================
