// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # srplink — DNS-SD advertisement and DSO transport for a border router
//!
//! The two halves of SRP replication's link layer:
//!
//! - **Advertisement** ([`mdns`], [`srpl`]): publish this node's
//!   `_srpl-tls._tcp` instance and its host records on the local link,
//!   browse for replication peers, and dedupe/rename/coalesce the way a
//!   long-lived responder client has to.
//! - **Transport** ([`dso`]): framed, length-prefixed TCP sessions for
//!   DNS Stateful Operations — a passive listener, engine-driven outbound
//!   connects, and per-connection reassembly of
//!   `len(u16 BE) || DNS message` frames.
//!
//! Everything runs single-threaded on the cooperative [`mainloop`]; the
//! only other thread belongs to the embedded mDNS daemon, whose channels
//! are marshalled back onto the loop by its backend.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                           DNS engine                                |
//! |        (SRP replication: sessions, message semantics)               |
//! +----------------+--------------------------+-------------------------+
//!                  |                          |
//!         SrplPartnerInfo                DsoHandler upcalls
//!                  |                          |
//! +----------------v-----------+  +-----------v------------------------+
//! |         srpl::SrplDnssd    |  |          dso::DsoAgent             |
//! |  advertise + browse peers  |  |  listener, connect, send, frames   |
//! +----------------+-----------+  +-----------+------------------------+
//!                  |                          |
//! +----------------v-----------+              |
//! |       mdns::Publisher      |              |
//! |  registrations, subscribes |              |
//! +----------------+-----------+              |
//!                  |                          |
//! +----------------v-----------+  +-----------v------------------------+
//! |   mdns backend (daemon or  |  |      mainloop poller (watches,     |
//! |   mock) behind one seam    |  |      timers over poll(2))          |
//! +----------------------------+  +------------------------------------+
//! ```
//!
//! ## Wiring
//!
//! ```ignore
//! use srplink::config::Config;
//! use srplink::dso::DsoAgent;
//! use srplink::mainloop::Mainloop;
//! use srplink::mdns::{DaemonBackend, Publisher};
//! use srplink::srpl::SrplDnssd;
//!
//! let config = Config::new("eth0");
//! let mut publisher = Publisher::new(
//!     Box::new(DaemonBackend::new(&config)),
//!     Box::new(|state| log::info!("mDNS state: {:?}", state)),
//! );
//! publisher.start()?;
//!
//! let mut dso = DsoAgent::new(&config, Box::new(engine_handler));
//! dso.enable_listening(true)?;
//!
//! let mut srpl = SrplDnssd::new(&config, Box::new(on_partner));
//! srpl.register_service(&mut publisher, txt_data)?;
//! srpl.start_browse(&mut publisher)?;
//!
//! let mut mainloop = Mainloop::new();
//! loop {
//!     mainloop.poll_once(&mut [&mut publisher, &mut dso])?;
//!     srpl.process(&mut publisher);
//! }
//! ```

pub mod config;
pub mod dso;
pub mod error;
pub mod mainloop;
pub mod mdns;
pub mod srpl;

pub use config::Config;
pub use error::{Error, Result};
