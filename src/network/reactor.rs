//! Reactor Contract
//!
//! The connection layer never talks to the OS poller directly. It goes through
//! the [`Reactor`] trait, which hands out [`EventId`] slots owned by a
//! [`ConnectionId`]. When a slot fires, the reactor thread looks the owner up
//! and calls its [`EventHandler`]. Routing through ids instead of stored
//! callbacks means a slot can never outlive the handle it points at: once the
//! owner is gone the delivery is simply dropped.
//!
//! Only [`EventActivator`] may be used from another thread. Command workers
//! use it to wake a connection whose asynchronous result is ready.

use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Readiness and registration flags, modelled on libevent's `EV_*` bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventFlags(u8);

impl EventFlags {
    pub const TIMEOUT: EventFlags = EventFlags(0x01);
    pub const READ: EventFlags = EventFlags(0x02);
    pub const WRITE: EventFlags = EventFlags(0x04);
    pub const SIGNAL: EventFlags = EventFlags(0x08);
    pub const PERSIST: EventFlags = EventFlags(0x10);

    pub const fn empty() -> Self {
        EventFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every bit of `other` is set.
    pub const fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: EventFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: EventFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EventFlags, &str); 5] = [
            (EventFlags::TIMEOUT, "TIMEOUT"),
            (EventFlags::READ, "READ"),
            (EventFlags::WRITE, "WRITE"),
            (EventFlags::SIGNAL, "SIGNAL"),
            (EventFlags::PERSIST, "PERSIST"),
        ];

        if self.is_empty() {
            return f.write_str("(empty)");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A registration slot handed out by a reactor. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub usize);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next id. Ids are never handed out twice.
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        ConnectionId(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wakes a manual event. Safe to call from any thread.
pub trait EventActivator: Send + Sync {
    fn activate(&self, event: EventId, flags: EventFlags);
}

/// The single-threaded event loop a connection registers with.
pub trait Reactor {
    /// Registers interest in `fd`. The slot is armed immediately.
    fn register_event(
        &mut self,
        owner: ConnectionId,
        fd: RawFd,
        flags: EventFlags,
    ) -> io::Result<EventId>;

    /// Replaces the interest and timeout of a socket slot and arms it.
    ///
    /// A timeout is only honoured when `flags` contains [`EventFlags::TIMEOUT`].
    fn update_event(
        &mut self,
        event: EventId,
        fd: RawFd,
        flags: EventFlags,
        timeout: Option<Duration>,
    ) -> io::Result<()>;

    /// Re-arms a slot with its last interest, waiting forever.
    fn add_event(&mut self, event: EventId) -> io::Result<()>;

    /// Stops delivering a slot without releasing it.
    fn del_event(&mut self, event: EventId) -> io::Result<()>;

    /// Releases a slot. Unknown ids are ignored.
    fn unregister_event(&mut self, event: EventId) -> io::Result<()>;

    /// Registers a slot that only fires through [`EventActivator::activate`].
    fn register_manual_event(&mut self, owner: ConnectionId) -> io::Result<EventId>;

    /// The thread-safe activation handle for this reactor's manual events.
    fn activator(&self) -> Arc<dyn EventActivator>;
}

/// Something the reactor can deliver events to.
pub trait EventHandler {
    fn on_event(&mut self, flags: EventFlags, reactor: &mut dyn Reactor);
}
