// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded cooperative mainloop.
//!
//! Every I/O-bearing component implements [`MainloopParticipant`]: in
//! `update` it adds file-descriptor interests and shrinks the wakeup
//! timeout on the shared [`MainloopContext`]; after the context polls, its
//! `process` hook reacts to whatever became ready.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        Mainloop tick                         |
//! |                                                              |
//! |  clear ctx -> update(p1..pn) -> poll(2) -> process(p1..pn)   |
//! |               (interests,                  (readiness,       |
//! |                timeout)                     callbacks)       |
//! +--------------------------------------------------------------+
//! ```
//!
//! Polling is `poll(2)` over a vector rebuilt each tick, so there is no
//! `FD_SETSIZE` ceiling and no persistent registration state to keep in
//! sync. All callbacks run on the polling thread; participants never see
//! concurrent calls.

pub mod poller;

use std::collections::HashMap;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::config::MAX_POLL_TIMEOUT;

// ============================================================================
// Event set
// ============================================================================

/// Compact set of fd events a participant can wait for or observe.
///
/// Hang-up and invalid-descriptor conditions reported by the kernel are
/// folded into [`EventSet::ERR`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventSet(u8);

impl EventSet {
    /// Empty set.
    pub const NONE: EventSet = EventSet(0);
    /// Readable.
    pub const IN: EventSet = EventSet(0b001);
    /// Writable.
    pub const OUT: EventSet = EventSet(0b010);
    /// Error, hang-up, or invalid descriptor.
    pub const ERR: EventSet = EventSet(0b100);

    /// True when every event in `other` is present in `self`.
    pub fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when any event in `other` is present in `self`.
    pub fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    /// True when no event is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventSet {
    type Output = EventSet;
    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventSet {
    type Output = EventSet;
    fn bitand(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 & rhs.0)
    }
}

impl std::fmt::Debug for EventSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.contains(EventSet::IN) {
            parts.push("IN");
        }
        if self.contains(EventSet::OUT) {
            parts.push("OUT");
        }
        if self.contains(EventSet::ERR) {
            parts.push("ERR");
        }
        if parts.is_empty() {
            parts.push("NONE");
        }
        write!(f, "EventSet({})", parts.join("|"))
    }
}

// ============================================================================
// Context
// ============================================================================

/// Per-tick interest and readiness state shared by all participants.
pub struct MainloopContext {
    interest: HashMap<RawFd, EventSet>,
    ready: HashMap<RawFd, EventSet>,
    timeout: Option<Duration>,
}

impl MainloopContext {
    pub fn new() -> Self {
        Self {
            interest: HashMap::new(),
            ready: HashMap::new(),
            timeout: None,
        }
    }

    /// Drop all interests, readiness, and the timeout. Called by the
    /// driver at the start of each tick.
    pub fn clear(&mut self) {
        self.interest.clear();
        self.ready.clear();
        self.timeout = None;
    }

    /// Register interest in `events` on `fd`. Interests for the same fd
    /// accumulate across participants.
    pub fn add_fd(&mut self, fd: RawFd, events: EventSet) {
        if events.is_empty() {
            return;
        }
        *self.interest.entry(fd).or_default() |= events;
    }

    /// Register read interest on `fd`.
    pub fn add_read_fd(&mut self, fd: RawFd) {
        self.add_fd(fd, EventSet::IN);
    }

    /// Register write interest on `fd`.
    pub fn add_write_fd(&mut self, fd: RawFd) {
        self.add_fd(fd, EventSet::OUT);
    }

    /// Register error interest on `fd`.
    pub fn add_error_fd(&mut self, fd: RawFd) {
        self.add_fd(fd, EventSet::ERR);
    }

    /// Lower the wakeup timeout to at most `timeout`.
    pub fn shrink_timeout(&mut self, timeout: Duration) {
        match self.timeout {
            Some(current) if current <= timeout => {}
            _ => self.timeout = Some(timeout),
        }
    }

    /// The currently requested wakeup timeout, if any participant set one.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Events that fired on `fd` in the last poll.
    pub fn events(&self, fd: RawFd) -> EventSet {
        self.ready.get(&fd).copied().unwrap_or(EventSet::NONE)
    }

    /// True when `fd` became readable in the last poll.
    pub fn readable(&self, fd: RawFd) -> bool {
        self.events(fd).contains(EventSet::IN)
    }

    /// True when `fd` became writable in the last poll.
    pub fn writable(&self, fd: RawFd) -> bool {
        self.events(fd).contains(EventSet::OUT)
    }

    /// True when `fd` reported an error or hang-up in the last poll.
    pub fn errored(&self, fd: RawFd) -> bool {
        self.events(fd).contains(EventSet::ERR)
    }

    /// Wait for any registered interest or the timeout, whichever comes
    /// first, and record readiness. Returns the number of ready
    /// descriptors; `EINTR` is treated as a zero-ready wakeup.
    pub fn poll(&mut self, max_timeout: Duration) -> io::Result<usize> {
        let timeout = self.timeout.map_or(max_timeout, |t| t.min(max_timeout));
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;

        let mut fds: Vec<libc::pollfd> = self
            .interest
            .iter()
            .map(|(&fd, &events)| {
                let mut raw: libc::c_short = 0;
                if events.contains(EventSet::IN) {
                    raw |= libc::POLLIN;
                }
                if events.contains(EventSet::OUT) {
                    raw |= libc::POLLOUT;
                }
                // POLLERR/POLLHUP are always reported; no bit to request.
                libc::pollfd {
                    fd,
                    events: raw,
                    revents: 0,
                }
            })
            .collect();

        self.ready.clear();

        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for pfd in &fds {
            let mut events = EventSet::NONE;
            if pfd.revents & libc::POLLIN != 0 {
                events |= EventSet::IN;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                events |= EventSet::OUT;
            }
            if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                events |= EventSet::ERR;
            }
            if !events.is_empty() {
                self.ready.insert(pfd.fd, events);
            }
        }

        Ok(ret as usize)
    }
}

impl Default for MainloopContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Participant
// ============================================================================

/// Hook pair every event-loop participant implements.
pub trait MainloopParticipant {
    /// Add fd interests and shrink the timeout before the poll.
    fn update(&mut self, ctx: &mut MainloopContext);

    /// React to readiness and fired timers after the poll.
    fn process(&mut self, ctx: &MainloopContext);
}

// ============================================================================
// Driver
// ============================================================================

/// Owns the reusable context and runs update → poll → process cycles.
pub struct Mainloop {
    ctx: MainloopContext,
    max_poll_timeout: Duration,
}

impl Mainloop {
    pub fn new() -> Self {
        Self::with_max_poll_timeout(MAX_POLL_TIMEOUT)
    }

    /// Driver with a custom upper bound on each poll.
    pub fn with_max_poll_timeout(max_poll_timeout: Duration) -> Self {
        Self {
            ctx: MainloopContext::new(),
            max_poll_timeout,
        }
    }

    /// Run one full tick over `participants`, in slice order for both
    /// hooks. Returns the number of descriptors that became ready.
    pub fn poll_once(
        &mut self,
        participants: &mut [&mut dyn MainloopParticipant],
    ) -> io::Result<usize> {
        self.ctx.clear();

        for participant in participants.iter_mut() {
            participant.update(&mut self.ctx);
        }

        let ready = self.ctx.poll(self.max_poll_timeout)?;

        for participant in participants.iter_mut() {
            participant.process(&self.ctx);
        }

        Ok(ready)
    }
}

impl Default for Mainloop {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn test_event_set_ops() {
        let set = EventSet::IN | EventSet::ERR;
        assert!(set.contains(EventSet::IN));
        assert!(set.contains(EventSet::ERR));
        assert!(!set.contains(EventSet::OUT));
        assert!(set.intersects(EventSet::IN | EventSet::OUT));
        assert!(EventSet::NONE.is_empty());
        assert_eq!(format!("{:?}", set), "EventSet(IN|ERR)");
    }

    #[test]
    fn test_shrink_timeout_keeps_minimum() {
        let mut ctx = MainloopContext::new();
        assert_eq!(ctx.timeout(), None);

        ctx.shrink_timeout(Duration::from_secs(5));
        ctx.shrink_timeout(Duration::from_secs(8));
        assert_eq!(ctx.timeout(), Some(Duration::from_secs(5)));

        ctx.shrink_timeout(Duration::from_millis(10));
        assert_eq!(ctx.timeout(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_poll_reports_readable() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let mut ctx = MainloopContext::new();
        ctx.add_read_fd(b.as_raw_fd());

        a.write_all(b"x").unwrap();
        let ready = ctx.poll(Duration::from_secs(1)).unwrap();
        assert_eq!(ready, 1);
        assert!(ctx.readable(b.as_raw_fd()));
        assert!(!ctx.writable(b.as_raw_fd()));
    }

    #[test]
    fn test_poll_times_out() {
        let (_a, b) = UnixStream::pair().unwrap();

        let mut ctx = MainloopContext::new();
        ctx.add_read_fd(b.as_raw_fd());
        ctx.shrink_timeout(Duration::from_millis(20));

        let start = Instant::now();
        let ready = ctx.poll(Duration::from_secs(5)).unwrap();
        assert_eq!(ready, 0);
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert!(ctx.events(b.as_raw_fd()).is_empty());
    }

    #[test]
    fn test_poll_reports_hangup_as_error() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);

        let mut ctx = MainloopContext::new();
        ctx.add_read_fd(b.as_raw_fd());

        ctx.poll(Duration::from_secs(1)).unwrap();
        // Peer closed: readable (EOF) and the hang-up folded into ERR.
        assert!(ctx.readable(b.as_raw_fd()) || ctx.errored(b.as_raw_fd()));
    }

    struct PipeEcho {
        rx: UnixStream,
        seen: Vec<u8>,
    }

    impl MainloopParticipant for PipeEcho {
        fn update(&mut self, ctx: &mut MainloopContext) {
            ctx.add_read_fd(self.rx.as_raw_fd());
        }

        fn process(&mut self, ctx: &MainloopContext) {
            if ctx.readable(self.rx.as_raw_fd()) {
                use std::io::Read;
                let mut buf = [0u8; 16];
                if let Ok(n) = self.rx.read(&mut buf) {
                    self.seen.extend_from_slice(&buf[..n]);
                }
            }
        }
    }

    #[test]
    fn test_driver_runs_participants() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let mut echo = PipeEcho {
            rx: b,
            seen: Vec::new(),
        };

        a.write_all(b"tick").unwrap();

        let mut mainloop = Mainloop::with_max_poll_timeout(Duration::from_millis(100));
        mainloop.poll_once(&mut [&mut echo]).unwrap();

        assert_eq!(echo.seen, b"tick");
    }
}
