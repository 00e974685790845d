//! Event-loop bridge.
//!
//! Collaborators that live on the main thread (the mixer change notifier,
//! a service-discovery wrapper) need fd watches and timers without caring
//! which event loop the server embeds. This module fixes the contract: a
//! small bitset of I/O conditions, the watch/timeout trait, and the flag
//! translation to the poll layer. There is deliberately no logic beyond
//! that.

use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::time::Duration;

use nix::poll::PollFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoEvents(u8);

impl IoEvents {
    pub const NONE: IoEvents = IoEvents(0);
    pub const INPUT: IoEvents = IoEvents(1);
    pub const OUTPUT: IoEvents = IoEvents(1 << 1);
    pub const ERROR: IoEvents = IoEvents(1 << 2);
    pub const HANGUP: IoEvents = IoEvents(1 << 3);

    pub fn contains(self, other: IoEvents) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for IoEvents {
    type Output = IoEvents;
    fn bitor(self, rhs: IoEvents) -> IoEvents {
        IoEvents(self.0 | rhs.0)
    }
}

impl BitOrAssign for IoEvents {
    fn bitor_assign(&mut self, rhs: IoEvents) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for IoEvents {
    type Output = IoEvents;
    fn bitand(self, rhs: IoEvents) -> IoEvents {
        IoEvents(self.0 & rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutId(pub u64);

pub type WatchCallback = Box<dyn FnMut(RawFd, IoEvents) + Send>;
pub type TimeoutCallback = Box<dyn FnMut() + Send>;

/// Main-thread event loop primitives. Each watch and timeout owns an
/// underlying loop resource; `free` releases it.
pub trait EventLoop {
    fn watch_new(&mut self, fd: RawFd, events: IoEvents, cb: WatchCallback) -> WatchId;
    fn watch_update(&mut self, id: WatchId, events: IoEvents);
    fn watch_events(&self, id: WatchId) -> IoEvents;
    fn watch_free(&mut self, id: WatchId);

    fn timeout_new(&mut self, after: Duration, cb: TimeoutCallback) -> TimeoutId;
    fn timeout_update(&mut self, id: TimeoutId, after: Duration);
    fn timeout_free(&mut self, id: TimeoutId);
}

pub fn to_poll_flags(events: IoEvents) -> PollFlags {
    let mut flags = PollFlags::empty();
    if events.contains(IoEvents::INPUT) {
        flags |= PollFlags::POLLIN;
    }
    if events.contains(IoEvents::OUTPUT) {
        flags |= PollFlags::POLLOUT;
    }
    if events.contains(IoEvents::ERROR) {
        flags |= PollFlags::POLLERR;
    }
    if events.contains(IoEvents::HANGUP) {
        flags |= PollFlags::POLLHUP;
    }
    flags
}

pub fn from_poll_flags(flags: PollFlags) -> IoEvents {
    let mut events = IoEvents::NONE;
    if flags.contains(PollFlags::POLLIN) {
        events |= IoEvents::INPUT;
    }
    if flags.contains(PollFlags::POLLOUT) {
        events |= IoEvents::OUTPUT;
    }
    if flags.contains(PollFlags::POLLERR) {
        events |= IoEvents::ERROR;
    }
    if flags.contains(PollFlags::POLLHUP) {
        events |= IoEvents::HANGUP;
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitset_operations() {
        let ev = IoEvents::INPUT | IoEvents::ERROR;
        assert!(ev.contains(IoEvents::INPUT));
        assert!(ev.contains(IoEvents::ERROR));
        assert!(!ev.contains(IoEvents::OUTPUT));
        assert!(IoEvents::NONE.is_empty());
        assert_eq!(ev & IoEvents::INPUT, IoEvents::INPUT);
    }

    #[test]
    fn flag_translation_round_trips() {
        let all = IoEvents::INPUT | IoEvents::OUTPUT | IoEvents::ERROR | IoEvents::HANGUP;
        assert_eq!(from_poll_flags(to_poll_flags(all)), all);
        assert_eq!(from_poll_flags(to_poll_flags(IoEvents::NONE)), IoEvents::NONE);
        assert_eq!(
            from_poll_flags(to_poll_flags(IoEvents::INPUT)),
            IoEvents::INPUT
        );
    }

    #[test]
    fn translation_maps_to_the_expected_poll_bits() {
        assert_eq!(to_poll_flags(IoEvents::INPUT), PollFlags::POLLIN);
        assert_eq!(
            to_poll_flags(IoEvents::OUTPUT | IoEvents::HANGUP),
            PollFlags::POLLOUT | PollFlags::POLLHUP
        );
    }
}
