// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deterministic in-process backend.
//!
//! Records every operation and emits exactly the events a test (or
//! simulation) scripts through the shared [`MockControl`] handle. No
//! network, no timers, no threads: events queued before a mainloop tick
//! surface from that tick's `process`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::mainloop::MainloopContext;

use super::backend::{Backend, BackendEvent, BackendHandle, HostPublication, ServicePublication};
use super::State;

#[derive(Default)]
struct MockState {
    started: bool,
    next_handle: u64,
    services: HashMap<u64, ServicePublication>,
    hosts: HashMap<u64, HostPublication>,
    service_subs: HashMap<u64, (String, Option<String>)>,
    host_subs: HashMap<u64, String>,
    released: Vec<u64>,
    queue: VecDeque<BackendEvent>,
    fail_next_publish: Option<Error>,
}

impl MockState {
    fn mint(&mut self) -> BackendHandle {
        self.next_handle += 1;
        BackendHandle::new(self.next_handle)
    }
}

/// Backend half; hand it to the publisher.
pub struct MockBackend {
    state: Rc<RefCell<MockState>>,
}

/// Test-driver half; keeps working after the backend is moved away.
#[derive(Clone)]
pub struct MockControl {
    state: Rc<RefCell<MockState>>,
}

impl MockBackend {
    pub fn new() -> (MockBackend, MockControl) {
        let state = Rc::new(RefCell::new(MockState::default()));
        (
            MockBackend {
                state: Rc::clone(&state),
            },
            MockControl { state },
        )
    }
}

impl Backend for MockBackend {
    fn start(&mut self) -> Result<()> {
        self.state.borrow_mut().started = true;
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.started = false;
        state.services.clear();
        state.hosts.clear();
        state.service_subs.clear();
        state.host_subs.clear();
    }

    fn is_started(&self) -> bool {
        self.state.borrow().started
    }

    fn publish_service(&mut self, publication: &ServicePublication) -> Result<BackendHandle> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.fail_next_publish.take() {
            return Err(error);
        }
        let handle = state.mint();
        state.services.insert(handle.raw(), publication.clone());
        Ok(handle)
    }

    fn release_service(&mut self, handle: BackendHandle) {
        let mut state = self.state.borrow_mut();
        state.services.remove(&handle.raw());
        state.released.push(handle.raw());
    }

    fn publish_host(&mut self, publication: &HostPublication) -> Result<BackendHandle> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.fail_next_publish.take() {
            return Err(error);
        }
        let handle = state.mint();
        state.hosts.insert(handle.raw(), publication.clone());
        Ok(handle)
    }

    fn release_host(&mut self, handle: BackendHandle) {
        let mut state = self.state.borrow_mut();
        state.hosts.remove(&handle.raw());
        state.released.push(handle.raw());
    }

    fn subscribe_service(
        &mut self,
        service_type: &str,
        instance_name: Option<&str>,
    ) -> Result<BackendHandle> {
        let mut state = self.state.borrow_mut();
        let handle = state.mint();
        state.service_subs.insert(
            handle.raw(),
            (
                service_type.to_string(),
                instance_name.map(str::to_string),
            ),
        );
        Ok(handle)
    }

    fn unsubscribe_service(&mut self, handle: BackendHandle) {
        let mut state = self.state.borrow_mut();
        state.service_subs.remove(&handle.raw());
        state.released.push(handle.raw());
    }

    fn subscribe_host(&mut self, host_name: &str) -> Result<BackendHandle> {
        let mut state = self.state.borrow_mut();
        let handle = state.mint();
        state.host_subs.insert(handle.raw(), host_name.to_string());
        Ok(handle)
    }

    fn unsubscribe_host(&mut self, handle: BackendHandle) {
        let mut state = self.state.borrow_mut();
        state.host_subs.remove(&handle.raw());
        state.released.push(handle.raw());
    }

    fn update(&mut self, ctx: &mut MainloopContext) {
        if !self.state.borrow().queue.is_empty() {
            ctx.shrink_timeout(std::time::Duration::ZERO);
        }
    }

    fn process(&mut self, _ctx: &MainloopContext, events: &mut Vec<BackendEvent>) {
        events.extend(self.state.borrow_mut().queue.drain(..));
    }
}

impl MockControl {
    /// Queue a raw event for the next tick.
    pub fn push_event(&self, event: BackendEvent) {
        self.state.borrow_mut().queue.push_back(event);
    }

    /// Make the next publish call fail synchronously.
    pub fn fail_next_publish(&self, error: Error) {
        self.state.borrow_mut().fail_next_publish = Some(error);
    }

    /// Handle of the live service publication matching `(name, type)`.
    pub fn find_service(&self, name: &str, service_type: &str) -> Option<BackendHandle> {
        self.state
            .borrow()
            .services
            .iter()
            .find(|(_, p)| p.name == name && p.service_type == service_type)
            .map(|(&raw, _)| BackendHandle::new(raw))
    }

    /// Handle of the live host publication named `name`.
    pub fn find_host(&self, name: &str) -> Option<BackendHandle> {
        self.state
            .borrow()
            .hosts
            .iter()
            .find(|(_, p)| p.name == name)
            .map(|(&raw, _)| BackendHandle::new(raw))
    }

    /// Handle of the live subscription for `service_type`.
    pub fn find_service_subscription(&self, service_type: &str) -> Option<BackendHandle> {
        self.state
            .borrow()
            .service_subs
            .iter()
            .find(|(_, (ty, _))| ty == service_type)
            .map(|(&raw, _)| BackendHandle::new(raw))
    }

    /// Handle of the live subscription for `host_name`.
    pub fn find_host_subscription(&self, host_name: &str) -> Option<BackendHandle> {
        self.state
            .borrow()
            .host_subs
            .iter()
            .find(|(_, name)| *name == host_name)
            .map(|(&raw, _)| BackendHandle::new(raw))
    }

    /// Snapshot of the live service publication behind `handle`.
    pub fn service_publication(&self, handle: BackendHandle) -> Option<ServicePublication> {
        self.state.borrow().services.get(&handle.raw()).cloned()
    }

    /// Number of live service publications.
    pub fn service_count(&self) -> usize {
        self.state.borrow().services.len()
    }

    /// Number of live subscriptions (services and hosts).
    pub fn subscription_count(&self) -> usize {
        let state = self.state.borrow();
        state.service_subs.len() + state.host_subs.len()
    }

    /// True once `handle` was released by the owner.
    pub fn was_released(&self, handle: BackendHandle) -> bool {
        self.state.borrow().released.contains(&handle.raw())
    }

    /// Complete a pending service registration, optionally under a
    /// daemon-chosen name.
    pub fn complete_service(
        &self,
        handle: BackendHandle,
        renamed_to: Option<&str>,
        result: Result<()>,
    ) {
        let instance_name = {
            let state = self.state.borrow();
            match renamed_to {
                Some(name) => name.to_string(),
                None => state
                    .services
                    .get(&handle.raw())
                    .map(|p| p.name.clone())
                    .unwrap_or_default(),
            }
        };
        self.push_event(BackendEvent::ServiceRegistered {
            handle,
            instance_name,
            result,
        });
    }

    /// Complete a pending host registration.
    pub fn complete_host(&self, handle: BackendHandle, result: Result<()>) {
        self.push_event(BackendEvent::HostRegistered { handle, result });
    }

    /// Report a responder state change.
    pub fn set_state(&self, state: State) {
        self.state.borrow_mut().started = state == State::Ready;
        self.push_event(BackendEvent::StateChanged { state });
    }
}
