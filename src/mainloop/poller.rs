// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Watch/timer bridge over the mainloop.
//!
//! Components that juggle many descriptors or deadlines register them here
//! instead of talking to the [`MainloopContext`] directly: a *watch* is a
//! persistent fd interest, a *timer* is an absolute deadline. The poller
//! translates both into mainloop state during `update` and dispatches
//! during `process`.
//!
//! Handles are ids into owning maps, never pointers, so a callback that
//! removes its own watch or timer (or anybody else's) mid-dispatch is
//! safe: dispatch snapshots the id list and re-looks every id up before
//! touching it.
//!
//! Semantics worth knowing:
//!
//! - A watch's `happened` set is cleared in `update` and recorded in
//!   `process` before its callback runs, so re-registering from inside a
//!   callback never observes stale readiness.
//! - Timers fire when `now >= deadline`; several expiring in one tick fire
//!   in registration order. A fired timer *remains armed at the fire
//!   time* — the callback rearms or disarms it via [`PollerOps`]. A timer
//!   left untouched fires again on the next tick.
//! - Watches and timers may be registered without callbacks; their owner
//!   queries [`Poller::watch_events`] after the tick instead.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::time::Instant;

use super::{EventSet, MainloopContext, MainloopParticipant};

// ============================================================================
// Handles and callbacks
// ============================================================================

/// Handle to a registered watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

/// Handle to a registered timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Invoked when a watched descriptor reports events.
pub type WatchCallback = Box<dyn FnMut(&mut PollerOps<'_>, RawFd, EventSet)>;

/// Invoked when a timer deadline expires. Receives the fire time.
pub type TimerCallback = Box<dyn FnMut(&mut PollerOps<'_>, Instant)>;

struct Watch {
    fd: RawFd,
    interest: EventSet,
    happened: EventSet,
    callback: Option<WatchCallback>,
}

struct Timer {
    /// `None` means disarmed.
    deadline: Option<Instant>,
    callback: Option<TimerCallback>,
}

// ============================================================================
// Poller
// ============================================================================

/// Owns all watches and timers of one component.
pub struct Poller {
    // Ordered maps: ids are monotonic, so iteration order is registration
    // order, which the timer contract requires.
    watches: BTreeMap<u64, Watch>,
    timers: BTreeMap<u64, Timer>,
    next_id: u64,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            watches: BTreeMap::new(),
            timers: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register a watch on `fd` for `interest`.
    pub fn add_watch(
        &mut self,
        fd: RawFd,
        interest: EventSet,
        callback: Option<WatchCallback>,
    ) -> WatchId {
        let id = self.next_id();
        self.watches.insert(
            id,
            Watch {
                fd,
                interest,
                happened: EventSet::NONE,
                callback,
            },
        );
        WatchId(id)
    }

    /// Change the interest set of an existing watch.
    pub fn update_watch(&mut self, id: WatchId, interest: EventSet) {
        if let Some(watch) = self.watches.get_mut(&id.0) {
            watch.interest = interest;
        }
    }

    /// Events that fired on the watch in the last `process`.
    pub fn watch_events(&self, id: WatchId) -> EventSet {
        self.watches
            .get(&id.0)
            .map(|w| w.happened)
            .unwrap_or(EventSet::NONE)
    }

    /// Remove a watch. Unknown ids are ignored.
    pub fn remove_watch(&mut self, id: WatchId) {
        self.watches.remove(&id.0);
    }

    /// Register a timer. `deadline == None` creates it disarmed.
    pub fn add_timer(&mut self, deadline: Option<Instant>, callback: Option<TimerCallback>) -> TimerId {
        let id = self.next_id();
        self.timers.insert(id, Timer { deadline, callback });
        TimerId(id)
    }

    /// Rearm (`Some`) or disarm (`None`) an existing timer.
    pub fn update_timer(&mut self, id: TimerId, deadline: Option<Instant>) {
        if let Some(timer) = self.timers.get_mut(&id.0) {
            timer.deadline = deadline;
        }
    }

    /// Current deadline of a timer, if it exists and is armed.
    pub fn timer_deadline(&self, id: TimerId) -> Option<Instant> {
        self.timers.get(&id.0).and_then(|t| t.deadline)
    }

    /// Remove a timer. Unknown ids are ignored.
    pub fn remove_timer(&mut self, id: TimerId) {
        self.timers.remove(&id.0);
    }

    /// Number of live watches.
    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    /// Number of live timers (armed or not).
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl MainloopParticipant for Poller {
    fn update(&mut self, ctx: &mut MainloopContext) {
        for watch in self.watches.values_mut() {
            watch.happened = EventSet::NONE;
            ctx.add_fd(watch.fd, watch.interest);
        }

        let now = Instant::now();
        for timer in self.timers.values() {
            if let Some(deadline) = timer.deadline {
                ctx.shrink_timeout(deadline.saturating_duration_since(now));
            }
        }
    }

    fn process(&mut self, ctx: &MainloopContext) {
        // Watches: record happened, then dispatch. Ids are snapshotted so
        // callbacks may mutate the registry freely.
        let watch_ids: Vec<u64> = self.watches.keys().copied().collect();
        for id in watch_ids {
            let (fd, fired) = match self.watches.get_mut(&id) {
                Some(watch) => {
                    let fired = watch.interest & ctx.events(watch.fd);
                    watch.happened = fired;
                    (watch.fd, fired)
                }
                None => continue,
            };

            if fired.is_empty() {
                continue;
            }

            let Some(mut callback) = self.watches.get_mut(&id).and_then(|w| w.callback.take())
            else {
                continue;
            };
            callback(&mut PollerOps { poller: self }, fd, fired);
            // Put the callback back unless the watch was freed meanwhile.
            if let Some(watch) = self.watches.get_mut(&id) {
                if watch.callback.is_none() {
                    watch.callback = Some(callback);
                }
            }
        }

        // Timers: fire everything due, in registration order.
        let now = Instant::now();
        let due: Vec<u64> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline.is_some_and(|d| d <= now))
            .map(|(&id, _)| id)
            .collect();

        for id in due {
            let Some(timer) = self.timers.get_mut(&id) else {
                continue;
            };
            // A callback earlier in this tick may have rearmed it.
            if !timer.deadline.is_some_and(|d| d <= now) {
                continue;
            }
            // Remains armed at the fire time until the callback says
            // otherwise.
            timer.deadline = Some(now);

            let Some(mut callback) = timer.callback.take() else {
                continue;
            };
            callback(&mut PollerOps { poller: self }, now);
            if let Some(timer) = self.timers.get_mut(&id) {
                if timer.callback.is_none() {
                    timer.callback = Some(callback);
                }
            }
        }
    }
}

// ============================================================================
// Dispatch-time operations
// ============================================================================

/// Registry operations available to callbacks while they run.
///
/// The firing watch or timer may operate on itself: removing it drops the
/// callback after return, rearming keeps it alive.
pub struct PollerOps<'a> {
    poller: &'a mut Poller,
}

impl PollerOps<'_> {
    pub fn add_watch(
        &mut self,
        fd: RawFd,
        interest: EventSet,
        callback: Option<WatchCallback>,
    ) -> WatchId {
        self.poller.add_watch(fd, interest, callback)
    }

    pub fn update_watch(&mut self, id: WatchId, interest: EventSet) {
        self.poller.update_watch(id, interest);
    }

    pub fn remove_watch(&mut self, id: WatchId) {
        self.poller.remove_watch(id);
    }

    pub fn add_timer(
        &mut self,
        deadline: Option<Instant>,
        callback: Option<TimerCallback>,
    ) -> TimerId {
        self.poller.add_timer(deadline, callback)
    }

    pub fn update_timer(&mut self, id: TimerId, deadline: Option<Instant>) {
        self.poller.update_timer(id, deadline);
    }

    pub fn remove_timer(&mut self, id: TimerId) {
        self.poller.remove_timer(id);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainloop::Mainloop;
    use std::cell::RefCell;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::time::Duration;

    fn tick(poller: &mut Poller) {
        let mut mainloop = Mainloop::with_max_poll_timeout(Duration::from_millis(50));
        mainloop.poll_once(&mut [poller]).unwrap();
    }

    #[test]
    fn test_watch_happened_set_and_cleared() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let mut poller = Poller::new();
        let watch = poller.add_watch(b.as_raw_fd(), EventSet::IN, None);

        a.write_all(b"x").unwrap();
        tick(&mut poller);
        assert!(poller.watch_events(watch).contains(EventSet::IN));

        // Drain so the next tick sees nothing.
        use std::io::Read;
        let mut sink = [0u8; 8];
        let _ = (&b).read(&mut sink);

        tick(&mut poller);
        assert!(poller.watch_events(watch).is_empty());
    }

    #[test]
    fn test_watch_callback_fires() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fired = Rc::new(RefCell::new(Vec::new()));

        let mut poller = Poller::new();
        let sink = Rc::clone(&fired);
        poller.add_watch(
            b.as_raw_fd(),
            EventSet::IN,
            Some(Box::new(move |_ops, fd, events| {
                sink.borrow_mut().push((fd, events));
            })),
        );

        a.write_all(b"x").unwrap();
        tick(&mut poller);

        let fired = fired.borrow();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, b.as_raw_fd());
        assert!(fired[0].1.contains(EventSet::IN));
    }

    #[test]
    fn test_watch_free_during_callback() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let mut poller = Poller::new();
        let id_cell: Rc<RefCell<Option<WatchId>>> = Rc::new(RefCell::new(None));
        let id_for_cb = Rc::clone(&id_cell);
        let id = poller.add_watch(
            b.as_raw_fd(),
            EventSet::IN,
            Some(Box::new(move |ops, _fd, _events| {
                // Remove ourselves mid-dispatch.
                ops.remove_watch(id_for_cb.borrow().unwrap());
            })),
        );
        *id_cell.borrow_mut() = Some(id);

        a.write_all(b"x").unwrap();
        tick(&mut poller);
        assert_eq!(poller.watch_count(), 0);

        // A second tick must not dispatch (or crash on) the freed watch.
        a.write_all(b"y").unwrap();
        tick(&mut poller);
    }

    #[test]
    fn test_timers_fire_in_registration_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut poller = Poller::new();
        let past = Instant::now() - Duration::from_millis(5);

        for tag in ["first", "second", "third"] {
            let sink = Rc::clone(&order);
            let id_cell: Rc<RefCell<Option<TimerId>>> = Rc::new(RefCell::new(None));
            let id_for_cb = Rc::clone(&id_cell);
            let id = poller.add_timer(
                Some(past),
                Some(Box::new(move |ops, _now| {
                    sink.borrow_mut().push(tag);
                    ops.update_timer(id_for_cb.borrow().unwrap(), None);
                })),
            );
            *id_cell.borrow_mut() = Some(id);
        }

        tick(&mut poller);
        assert_eq!(*order.borrow(), vec!["first", "second", "third"]);

        // All disarmed themselves; nothing fires again.
        tick(&mut poller);
        assert_eq!(order.borrow().len(), 3);
    }

    #[test]
    fn test_timer_left_armed_fires_again() {
        let count = Rc::new(RefCell::new(0));
        let mut poller = Poller::new();
        let sink = Rc::clone(&count);
        poller.add_timer(
            Some(Instant::now()),
            Some(Box::new(move |_ops, _now| {
                // Deliberately neither rearm nor disarm.
                *sink.borrow_mut() += 1;
            })),
        );

        tick(&mut poller);
        tick(&mut poller);
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn test_timer_rearm_in_future() {
        let count = Rc::new(RefCell::new(0));
        let mut poller = Poller::new();
        let sink = Rc::clone(&count);
        let id_cell: Rc<RefCell<Option<TimerId>>> = Rc::new(RefCell::new(None));
        let id_for_cb = Rc::clone(&id_cell);
        let id = poller.add_timer(
            Some(Instant::now()),
            Some(Box::new(move |ops, now| {
                *sink.borrow_mut() += 1;
                ops.update_timer(id_for_cb.borrow().unwrap(), Some(now + Duration::from_secs(60)));
            })),
        );
        *id_cell.borrow_mut() = Some(id);

        tick(&mut poller);
        tick(&mut poller);
        // Rearmed a minute out: only the first tick fired.
        assert_eq!(*count.borrow(), 1);
        assert!(poller.timer_deadline(id).is_some());
    }

    #[test]
    fn test_disarmed_timer_does_not_shrink_timeout() {
        let mut poller = Poller::new();
        poller.add_timer(None, None);

        let mut ctx = MainloopContext::new();
        poller.update(&mut ctx);
        assert_eq!(ctx.timeout(), None);
    }
}
