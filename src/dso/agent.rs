// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The DSO transport agent: listener, connection registry, and the
//! mainloop plumbing that moves frames.
//!
//! Disconnect policy: teardown requested by the upper layer (an explicit
//! `disconnect`, or disabling the listener) never raises
//! `on_disconnected`. Teardown detected by the transport does — with
//! `GracefullyClose` when the peer closed the stream, `ForciblyAbort` for
//! socket errors, failed connects, and zero-length frames (which also put
//! RST on the wire via `SO_LINGER 0`).

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6, TcpListener};
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::mainloop::poller::{Poller, WatchId};
use crate::mainloop::{EventSet, MainloopContext, MainloopParticipant};

use super::connection::{ConnState, DsoConnection, ReadOutcome};
use super::frame;
use super::{ConnectionId, DisconnectMode, DsoHandler};

/// What a processing pass decided to do with a connection.
enum Fate {
    Keep,
    /// Tear down and raise `on_disconnected` with this mode.
    Close(DisconnectMode, &'static str),
}

pub struct DsoAgent {
    listen_port: u16,
    backlog: i32,
    infra_ifname: String,
    handler: Box<dyn DsoHandler>,
    listener: Option<TcpListener>,
    listener_watch: Option<WatchId>,
    connections: HashMap<ConnectionId, DsoConnection>,
    watches: HashMap<ConnectionId, WatchId>,
    poller: Poller,
}

impl DsoAgent {
    pub fn new(config: &Config, handler: Box<dyn DsoHandler>) -> Self {
        Self {
            listen_port: config.dso_listen_port,
            backlog: config.dso_listen_backlog,
            infra_ifname: config.infra_ifname.clone(),
            handler,
            listener: None,
            listener_watch: None,
            connections: HashMap::new(),
            watches: HashMap::new(),
            poller: Poller::new(),
        }
    }

    // ========================================================================
    // Platform operations
    // ========================================================================

    /// Bring the passive listener up or down. Disabling also tears down
    /// every connection, without raising disconnects upward.
    pub fn enable_listening(&mut self, enabled: bool) -> Result<()> {
        if enabled == self.listener.is_some() {
            return Ok(());
        }

        if enabled {
            let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
            socket.set_nonblocking(true)?;
            socket.set_only_v6(false)?;
            socket.set_reuse_address(true)?;
            socket.set_reuse_port(true)?;
            if !self.infra_ifname.is_empty() {
                socket.bind_device(Some(self.infra_ifname.as_bytes()))?;
            }

            let addr = SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::UNSPECIFIED,
                self.listen_port,
                0,
                0,
            ));
            socket.bind(&addr.into())?;
            socket.listen(self.backlog)?;

            let listener: TcpListener = socket.into();
            log::info!(
                "[DSO] listening on {} (interface {:?})",
                listener.local_addr()?,
                self.infra_ifname
            );

            self.listener_watch = Some(self.poller.add_watch(
                listener.as_raw_fd(),
                EventSet::IN | EventSet::ERR,
                None,
            ));
            self.listener = Some(listener);
        } else {
            if let Some(watch) = self.listener_watch.take() {
                self.poller.remove_watch(watch);
            }
            self.listener = None;

            let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
            for id in ids {
                self.teardown(id);
            }
            log::info!("[DSO] listening disabled");
        }

        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Bound listener address, once listening (tests bind port 0).
    pub fn local_listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Open an outbound session to `peer` under the engine-chosen id.
    pub fn connect(&mut self, id: ConnectionId, peer: SocketAddrV6) -> Result<()> {
        if self.connections.contains_key(&id) {
            return Err(Error::InvalidState("connection id already in use"));
        }

        log::info!("[DSO] connecting to {}", peer);
        let connection = DsoConnection::connect(peer).map_err(|e| {
            log::warn!("[DSO] connect to {} failed: {}", peer, e);
            Error::Failed(e.to_string())
        })?;

        let connected = connection.state == ConnState::Connected;
        let mut interest = EventSet::IN | EventSet::ERR;
        if connection.wants_write() {
            interest |= EventSet::OUT;
        }

        let watch = self.poller.add_watch(connection.raw_fd(), interest, None);
        self.connections.insert(id, connection);
        self.watches.insert(id, watch);

        if connected {
            self.handler.on_connected(id);
        }
        Ok(())
    }

    /// Frame and send one DSO message. The message is consumed whatever
    /// the outcome; bytes that don't fit the socket are buffered and
    /// drained on write readiness.
    pub fn send(&mut self, id: ConnectionId, message: Vec<u8>) -> Result<()> {
        if message.len() > frame::MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidArgs(format!(
                "DSO message of {} bytes exceeds the 16-bit length prefix",
                message.len()
            )));
        }

        let Some(connection) = self.connections.get_mut(&id) else {
            return Err(Error::NotFound);
        };

        connection.queue_message(&message);
        let flushed = if connection.state == ConnState::Connected {
            connection.flush()
        } else {
            Ok(false)
        };

        if let Err(e) = flushed {
            log::warn!("[DSO] send on connection {} failed: {}", id, e);
            self.teardown(id);
            return Err(Error::Failed(e.to_string()));
        }
        Ok(())
    }

    /// Tear a connection down on the upper layer's behalf. No
    /// `on_disconnected` is raised back.
    pub fn disconnect(&mut self, id: ConnectionId, mode: DisconnectMode) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        log::info!("[DSO] disconnecting {} ({:?})", connection.peer, mode);
        if mode == DisconnectMode::ForciblyAbort {
            connection.abort();
        }
        self.teardown(id);
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Close the socket and free the registry slot and watch.
    fn teardown(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
        if let Some(watch) = self.watches.remove(&id) {
            self.poller.remove_watch(watch);
        }
    }

    /// Drain `accept` until it would block.
    fn accept_incoming(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            let (stream, addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("[DSO] accept failed: {}", e);
                    break;
                }
            };

            if let Err(e) = stream.set_nonblocking(true) {
                log::warn!("[DSO] failed to make accepted socket non-blocking: {}", e);
                continue;
            }

            let peer = match addr {
                SocketAddr::V6(peer) if peer.ip().to_ipv4_mapped().is_none() => peer,
                other => {
                    // IPv4 DSO is not supported.
                    log::info!("[DSO] dropping non-IPv6 peer {}", other);
                    continue;
                }
            };

            // The accept path does not learn the peer's source port;
            // reported as 0.
            let tentative = SocketAddrV6::new(*peer.ip(), 0, 0, peer.scope_id());

            match self.handler.on_accept(tentative) {
                Some(id) if !self.connections.contains_key(&id) => {
                    log::info!("[DSO] accepted connection {} from {}", id, peer.ip());
                    let connection = DsoConnection::from_accepted(stream, tentative);
                    let watch = self.poller.add_watch(
                        connection.raw_fd(),
                        EventSet::IN | EventSet::ERR,
                        None,
                    );
                    self.connections.insert(id, connection);
                    self.watches.insert(id, watch);
                    self.handler.on_connected(id);
                }
                Some(id) => {
                    log::warn!("[DSO] engine reused live connection id {}; refusing peer", id);
                }
                None => {
                    log::info!("[DSO] engine refused connection from {}", peer.ip());
                }
            }
        }
    }

    fn process_connection(&mut self, id: ConnectionId) {
        let Some(&watch) = self.watches.get(&id) else {
            return;
        };
        let events = self.poller.watch_events(watch);
        if events.is_empty() {
            return;
        }

        let mut fate = Fate::Keep;
        let mut connected_now = false;
        let mut frames: Vec<Vec<u8>> = Vec::new();

        {
            let Some(connection) = self.connections.get_mut(&id) else {
                return;
            };

            if connection.state == ConnState::Connecting
                && events.intersects(EventSet::OUT | EventSet::ERR)
            {
                match connection.finish_connect() {
                    Ok(()) => {
                        log::info!("[DSO] connected to {}", connection.peer);
                        connected_now = true;
                        if let Err(e) = connection.flush() {
                            log::warn!("[DSO] flush after connect failed: {}", e);
                            fate = Fate::Close(DisconnectMode::ForciblyAbort, "send error");
                        }
                    }
                    Err(e) => {
                        log::warn!("[DSO] connect to {} failed: {}", connection.peer, e);
                        fate = Fate::Close(DisconnectMode::ForciblyAbort, "connect failed");
                    }
                }
            } else if events.contains(EventSet::OUT) {
                if let Err(e) = connection.flush() {
                    log::warn!("[DSO] send on connection {} failed: {}", id, e);
                    fate = Fate::Close(DisconnectMode::ForciblyAbort, "send error");
                }
            }

            if matches!(fate, Fate::Keep)
                && connection.state == ConnState::Connected
                && events.intersects(EventSet::IN | EventSet::ERR)
            {
                match connection.read_frames(&mut frames) {
                    Ok(ReadOutcome::Open) => {}
                    Ok(ReadOutcome::PeerClosed) => {
                        fate = Fate::Close(DisconnectMode::GracefullyClose, "peer closed");
                    }
                    Ok(ReadOutcome::ZeroLengthFrame) => {
                        connection.abort();
                        fate = Fate::Close(DisconnectMode::ForciblyAbort, "zero-length frame");
                    }
                    Err(e) => {
                        log::warn!("[DSO] receive on connection {} failed: {}", id, e);
                        fate = Fate::Close(DisconnectMode::ForciblyAbort, "receive error");
                    }
                }
            }
        }

        if connected_now {
            self.handler.on_connected(id);
        }
        for message in frames {
            log::debug!("[DSO] received {}-byte message on connection {}", message.len(), id);
            self.handler.on_receive(id, message);
        }
        if let Fate::Close(mode, why) = fate {
            log::info!("[DSO] connection {} closed: {} ({:?})", id, why, mode);
            self.teardown(id);
            self.handler.on_disconnected(id, mode);
        }
    }
}

impl MainloopParticipant for DsoAgent {
    fn update(&mut self, ctx: &mut MainloopContext) {
        for (id, connection) in &self.connections {
            let mut interest = EventSet::IN | EventSet::ERR;
            if connection.wants_write() {
                interest |= EventSet::OUT;
            }
            if let Some(&watch) = self.watches.get(id) {
                self.poller.update_watch(watch, interest);
            }
        }
        self.poller.update(ctx);
    }

    fn process(&mut self, ctx: &MainloopContext) {
        self.poller.process(ctx);

        let accept_ready = self
            .listener_watch
            .map(|watch| {
                self.poller
                    .watch_events(watch)
                    .intersects(EventSet::IN | EventSet::ERR)
            })
            .unwrap_or(false);
        if accept_ready {
            self.accept_incoming();
        }

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.process_connection(id);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
