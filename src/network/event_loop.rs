//! mio Reactor
//!
//! [`EventLoop`] implements [`Reactor`] on top of `mio::Poll`. Socket slots
//! are registered through `SourceFd` with their [`EventId`] as the token;
//! token 0 belongs to the waker.
//!
//! Slot semantics follow the classic `PERSIST | TIMEOUT` model:
//!
//! - a persistent slot stays armed after it fired;
//! - a timeout is pushed back whenever the slot delivers readiness and is
//!   re-armed after it expired;
//! - a slot without `PERSIST` disarms after its first delivery.
//!
//! Manual slots have no descriptor. They fire only through the
//! [`EventActivator`], the one part of the loop other threads may touch.

use crate::network::reactor::{ConnectionId, EventActivator, EventFlags, EventId, Reactor};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const WAKER_TOKEN: Token = Token(0);

/// Readiness events fetched per poll
const EVENTS_CAPACITY: usize = 1024;

#[derive(Debug)]
enum SlotKind {
    Socket {
        fd: RawFd,
        flags: EventFlags,
        /// Currently registered with the poller
        registered: bool,
        armed: bool,
        timeout: Option<Duration>,
        deadline: Option<Instant>,
    },
    Manual,
}

#[derive(Debug)]
struct Slot {
    owner: ConnectionId,
    kind: SlotKind,
}

/// Cross-thread activation queue.
#[derive(Debug)]
struct Activations {
    queue: Mutex<Vec<(EventId, EventFlags)>>,
    waker: Arc<Waker>,
}

impl EventActivator for Activations {
    fn activate(&self, event: EventId, flags: EventFlags) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event, flags));
        if let Err(e) = self.waker.wake() {
            warn!(?event, error = %e, "Failed to wake reactor");
        }
    }
}

/// Wakes a blocked [`EventLoop::poll_ready`] from any thread.
#[derive(Debug, Clone)]
pub struct Notifier {
    waker: Arc<Waker>,
}

impl Notifier {
    pub fn notify(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
    }
}

/// A single-threaded reactor.
#[derive(Debug)]
pub struct EventLoop {
    poll: Poll,
    events: Events,
    slots: HashMap<EventId, Slot>,
    next_event: usize,
    activations: Arc<Activations>,
}

fn interest(flags: EventFlags) -> Option<Interest> {
    match (flags.contains(EventFlags::READ), flags.contains(EventFlags::WRITE)) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn not_found(event: EventId) -> io::Error {
    io::Error::new(ErrorKind::NotFound, format!("unknown event {:?}", event))
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            slots: HashMap::new(),
            next_event: WAKER_TOKEN.0 + 1,
            activations: Arc::new(Activations {
                queue: Mutex::new(Vec::new()),
                waker,
            }),
        })
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            waker: Arc::clone(&self.activations.waker),
        }
    }

    /// Number of registered slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn allocate(&mut self) -> EventId {
        let event = EventId(self.next_event);
        self.next_event += 1;
        event
    }

    /// Waits for readiness, expired timeouts or activations, at most
    /// `max_wait` (`None` blocks until something happens).
    ///
    /// Returns one `(owner, flags)` delivery per fired slot. A notifier
    /// wake-up alone returns an empty list.
    pub fn poll_ready(
        &mut self,
        max_wait: Option<Duration>,
    ) -> io::Result<Vec<(ConnectionId, EventFlags)>> {
        let mut wait = max_wait;
        if let Some(deadline) = self.next_deadline() {
            let until = deadline.saturating_duration_since(Instant::now());
            wait = Some(wait.map_or(until, |w| w.min(until)));
        }
        if !self.activations_pending() {
            match self.poll.poll(&mut self.events, wait) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(Vec::new()),
                Err(e) => return Err(e),
            }
        } else {
            self.events.clear();
        }

        let mut ready = Vec::new();
        let now = Instant::now();

        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let id = EventId(event.token().0);
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            let SlotKind::Socket {
                flags,
                armed,
                timeout,
                deadline,
                ..
            } = &mut slot.kind
            else {
                continue;
            };
            if !*armed {
                continue;
            }

            let hangup = event.is_error() || event.is_read_closed() || event.is_write_closed();
            let mut fired = EventFlags::empty();
            if flags.contains(EventFlags::READ) && (event.is_readable() || hangup) {
                fired |= EventFlags::READ;
            }
            if flags.contains(EventFlags::WRITE) && (event.is_writable() || hangup) {
                fired |= EventFlags::WRITE;
            }
            if fired.is_empty() {
                continue;
            }

            if flags.contains(EventFlags::PERSIST) {
                *deadline = timeout.map(|t| now + t);
            } else {
                *armed = false;
                *deadline = None;
            }
            ready.push((slot.owner, fired));
        }

        for slot in self.slots.values_mut() {
            let SlotKind::Socket {
                flags,
                armed,
                timeout,
                deadline,
                ..
            } = &mut slot.kind
            else {
                continue;
            };
            if !*armed || !deadline.is_some_and(|d| d <= now) {
                continue;
            }
            if flags.contains(EventFlags::PERSIST) {
                *deadline = timeout.map(|t| now + t);
            } else {
                *armed = false;
                *deadline = None;
            }
            ready.push((slot.owner, EventFlags::TIMEOUT));
        }

        let activated = std::mem::take(
            &mut *self
                .activations
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (event, flags) in activated {
            match self.slots.get(&event) {
                Some(slot) => ready.push((slot.owner, flags | EventFlags::SIGNAL)),
                None => trace!(?event, "Dropping activation for unregistered event"),
            }
        }

        Ok(ready)
    }

    fn activations_pending(&self) -> bool {
        !self
            .activations
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter_map(|slot| match slot.kind {
                SlotKind::Socket {
                    armed: true,
                    deadline,
                    ..
                } => deadline,
                _ => None,
            })
            .min()
    }

    /// Brings the poller registration of a socket slot in line with `flags`.
    fn apply_interest(
        poll: &Poll,
        id: EventId,
        current_fd: RawFd,
        registered: &mut bool,
        fd: RawFd,
        flags: EventFlags,
    ) -> io::Result<()> {
        let registry = poll.registry();
        if *registered && current_fd != fd {
            let _ = registry.deregister(&mut SourceFd(&current_fd));
            *registered = false;
        }
        match interest(flags) {
            Some(interest) if *registered => {
                registry.reregister(&mut SourceFd(&fd), Token(id.0), interest)
            }
            Some(interest) => {
                registry.register(&mut SourceFd(&fd), Token(id.0), interest)?;
                *registered = true;
                Ok(())
            }
            None if *registered => {
                *registered = false;
                registry.deregister(&mut SourceFd(&fd))
            }
            None => Ok(()),
        }
    }
}

impl Reactor for EventLoop {
    fn register_event(
        &mut self,
        owner: ConnectionId,
        fd: RawFd,
        flags: EventFlags,
    ) -> io::Result<EventId> {
        let id = self.allocate();
        let mut registered = false;
        Self::apply_interest(&self.poll, id, fd, &mut registered, fd, flags)?;
        self.slots.insert(
            id,
            Slot {
                owner,
                kind: SlotKind::Socket {
                    fd,
                    flags,
                    registered,
                    armed: true,
                    timeout: None,
                    deadline: None,
                },
            },
        );
        trace!(conn = %owner, event = ?id, fd, ?flags, "Registered socket event");
        Ok(id)
    }

    fn update_event(
        &mut self,
        event: EventId,
        new_fd: RawFd,
        new_flags: EventFlags,
        new_timeout: Option<Duration>,
    ) -> io::Result<()> {
        let slot = self.slots.get_mut(&event).ok_or_else(|| not_found(event))?;
        let SlotKind::Socket {
            fd,
            flags,
            registered,
            armed,
            timeout,
            deadline,
        } = &mut slot.kind
        else {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "manual events carry no descriptor",
            ));
        };

        Self::apply_interest(&self.poll, event, *fd, registered, new_fd, new_flags)?;
        *fd = new_fd;
        *flags = new_flags;
        *armed = true;
        *timeout = new_timeout.filter(|_| new_flags.contains(EventFlags::TIMEOUT));
        *deadline = timeout.map(|t| Instant::now() + t);
        Ok(())
    }

    fn add_event(&mut self, event: EventId) -> io::Result<()> {
        let slot = self.slots.get_mut(&event).ok_or_else(|| not_found(event))?;
        if let SlotKind::Socket {
            fd,
            flags,
            registered,
            armed,
            deadline,
            ..
        } = &mut slot.kind
        {
            Self::apply_interest(&self.poll, event, *fd, registered, *fd, *flags)?;
            *armed = true;
            *deadline = None;
        }
        Ok(())
    }

    fn del_event(&mut self, event: EventId) -> io::Result<()> {
        let slot = self.slots.get_mut(&event).ok_or_else(|| not_found(event))?;
        if let SlotKind::Socket {
            fd,
            registered,
            armed,
            deadline,
            ..
        } = &mut slot.kind
        {
            if *registered {
                *registered = false;
                self.poll.registry().deregister(&mut SourceFd(&*fd))?;
            }
            *armed = false;
            *deadline = None;
        }
        Ok(())
    }

    fn unregister_event(&mut self, event: EventId) -> io::Result<()> {
        let Some(slot) = self.slots.remove(&event) else {
            return Ok(());
        };
        if let SlotKind::Socket {
            fd,
            registered: true,
            ..
        } = slot.kind
        {
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                debug!(?event, fd, error = %e, "Deregistering socket failed");
            }
        }
        Ok(())
    }

    fn register_manual_event(&mut self, owner: ConnectionId) -> io::Result<EventId> {
        let id = self.allocate();
        self.slots.insert(
            id,
            Slot {
                owner,
                kind: SlotKind::Manual,
            },
        );
        Ok(id)
    }

    fn activator(&self) -> Arc<dyn EventActivator> {
        self.activations.clone()
    }
}
