//! Reactor Threads
//!
//! Each [`ConnectionHandlerTask`] is one reactor thread: an [`EventLoop`],
//! the handles it owns and a factory to recycle them. Accepted sockets arrive
//! over an unbounded channel followed by a [`Notifier`] wake-up, and from
//! then on the connection never leaves the thread.

use crate::network::event_loop::{EventLoop, Notifier};
use crate::network::factory::ConnectionHandleFactory;
use crate::network::handle::ConnectionHandle;
use crate::network::reactor::{ConnectionId, EventHandler};
use crate::network::stats::ConnectionStats;
use mio::net::TcpStream;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Upper bound on a single wait, so a missed wake-up cannot stall shutdown.
const MAX_POLL_WAIT: Duration = Duration::from_millis(500);

/// Sending side of a reactor thread's hand-off channel.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    sender: mpsc::UnboundedSender<TcpStream>,
    notifier: Notifier,
}

impl ReactorHandle {
    /// Passes an accepted socket to the reactor thread. The socket comes back
    /// if the thread is gone.
    pub fn hand_off(&self, socket: TcpStream) -> Result<(), TcpStream> {
        self.sender.send(socket).map_err(|e| e.0)?;
        self.notifier.notify();
        Ok(())
    }

    /// Wakes the thread, e.g. to notice shutdown.
    pub fn wake(&self) {
        self.notifier.notify();
    }
}

/// One reactor thread and the connections it owns.
pub struct ConnectionHandlerTask {
    name: String,
    event_loop: EventLoop,
    handles: HashMap<ConnectionId, ConnectionHandle>,
    factory: ConnectionHandleFactory,
    incoming: mpsc::UnboundedReceiver<TcpStream>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<ConnectionStats>,
}

impl ConnectionHandlerTask {
    pub fn new(
        name: impl Into<String>,
        factory: ConnectionHandleFactory,
        shutdown: Arc<AtomicBool>,
        stats: Arc<ConnectionStats>,
    ) -> io::Result<(Self, ReactorHandle)> {
        let event_loop = EventLoop::new()?;
        let (sender, incoming) = mpsc::unbounded_channel();
        let handle = ReactorHandle {
            sender,
            notifier: event_loop.notifier(),
        };
        let task = Self {
            name: name.into(),
            event_loop,
            handles: HashMap::new(),
            factory,
            incoming,
            shutdown,
            stats,
        };
        Ok((task, handle))
    }

    /// Connections currently owned by this thread.
    pub fn connections(&self) -> usize {
        self.handles.len()
    }

    /// Serves connections until shutdown is requested, then terminates
    /// every live connection.
    pub fn run(mut self) {
        info!(reactor = %self.name, "Reactor thread started");
        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.turn(Some(MAX_POLL_WAIT)) {
                error!(reactor = %self.name, error = %e, "Reactor poll failed");
                break;
            }
        }
        self.terminate_all();
        info!(reactor = %self.name, "Reactor thread stopped");
    }

    /// One reactor iteration: wait, adopt new sockets, dispatch deliveries
    /// and recycle closed handles.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> io::Result<()> {
        let ready = self.event_loop.poll_ready(max_wait)?;
        self.adopt_incoming();

        let mut closed = Vec::new();
        for (owner, flags) in ready {
            let Some(handle) = self.handles.get_mut(&owner) else {
                continue;
            };
            handle.on_event(flags, &mut self.event_loop);
            if handle.is_closed() {
                closed.push(owner);
            }
        }
        for id in closed {
            self.recycle(id);
        }
        Ok(())
    }

    fn adopt_incoming(&mut self) {
        while let Ok(socket) = self.incoming.try_recv() {
            let id = ConnectionId::next();
            let client = socket.peer_addr().ok();
            let mut handle = self.factory.acquire(id, socket);

            match handle.register_to_receive_events(&mut self.event_loop) {
                Ok(()) => {
                    debug!(conn = %id, client = ?client, reactor = %self.name, "Accepted connection");
                    self.stats.connection_opened();
                    self.handles.insert(id, handle);
                }
                Err(e) => {
                    warn!(conn = %id, error = %e, "Failed to register connection");
                    handle.terminate(&mut self.event_loop);
                    self.factory.release(handle);
                }
            }
        }
    }

    fn recycle(&mut self, id: ConnectionId) {
        if let Some(handle) = self.handles.remove(&id) {
            self.stats.connection_closed();
            self.factory.release(handle);
        }
    }

    fn terminate_all(&mut self) {
        let ids: Vec<ConnectionId> = self.handles.keys().copied().collect();
        for id in ids {
            if let Some(handle) = self.handles.get_mut(&id) {
                handle.terminate(&mut self.event_loop);
            }
            self.recycle(id);
        }
    }
}
