// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DSO transport: framed, length-prefixed TCP sessions for DNS Stateful
//! Operations (RFC 8490).
//!
//! The [`DsoAgent`] owns a passive listener and a registry of
//! connections, each identified by an opaque [`ConnectionId`] chosen by
//! the upper DNS engine. The engine drives the agent through
//! `enable_listening` / `connect` / `send` / `disconnect`, and hears back
//! through its [`DsoHandler`] during mainloop processing.
//!
//! ```text
//!  DNS engine                    DsoAgent                     network
//!  ----------                    --------                     -------
//!  enable_listening(true) ----->  listener [::]:853
//!  connect(id, peer) ----------->  non-blocking TCP connect ----->
//!  send(id, msg) --------------->  [len u16 BE][msg] ------------>
//!      <-- on_accept(peer) -----  accept()
//!      <-- on_connected(id) ----  connect completes
//!      <-- on_receive(id, msg) -  frame reassembled  <------------
//!      <-- on_disconnected ----   peer closed / reset / 0-length
//! ```

pub mod frame;

mod agent;
mod connection;

pub use agent::DsoAgent;

use std::net::SocketAddrV6;

/// Opaque connection identity chosen by the upper layer.
pub type ConnectionId = u64;

/// How a connection is (or was) torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectMode {
    /// Orderly close: TCP FIN.
    GracefullyClose,
    /// Abort: `SO_LINGER {on, 0}` then close, emitting TCP RST.
    ForciblyAbort,
}

/// Upward interface into the DNS engine.
///
/// Callbacks run on the mainloop thread during [`DsoAgent`] processing.
/// A callback must not call back into the agent; it records state the
/// engine acts on in its own turn of the tick.
pub trait DsoHandler {
    /// An inbound connection arrived. The peer's port is reported as 0.
    /// Return the connection id to adopt it, or `None` to refuse (the
    /// socket is closed).
    fn on_accept(&mut self, peer: SocketAddrV6) -> Option<ConnectionId>;

    /// The connection (inbound or outbound) is established.
    fn on_connected(&mut self, connection: ConnectionId);

    /// One reassembled DSO message arrived.
    fn on_receive(&mut self, connection: ConnectionId, message: Vec<u8>);

    /// The transport tore the connection down: the peer closed
    /// (`GracefullyClose`), or an error / zero-length frame forced an
    /// abort (`ForciblyAbort`). Never raised for teardown the upper
    /// layer itself requested.
    fn on_disconnected(&mut self, connection: ConnectionId, mode: DisconnectMode);
}
