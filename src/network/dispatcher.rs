//! Listener thread and server lifecycle.
//!
//! ```text
//!                      ┌──────────────────────┐
//!   accept() ────────> │ ConnectionDispatcher │ round-robin
//!                      └──────────┬───────────┘
//!              ┌──────────────────┼──────────────────┐
//!              ▼                  ▼                  ▼
//!        reactor-0          reactor-1          reactor-N
//!   (ConnectionHandlerTask, one EventLoop each, owns its handles)
//! ```

use crate::commands::TrafficCop;
use crate::config::ServerConfig;
use crate::metrics::NetworkMetricsStore;
use crate::network::factory::ConnectionHandleFactory;
use crate::network::handler_task::{ConnectionHandlerTask, ReactorHandle};
use crate::network::stats::ConnectionStats;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Upper bound on a single wait, so a missed wake-up cannot stall shutdown.
const MAX_POLL_WAIT: Duration = Duration::from_millis(500);

/// Accepts connections and spreads them across reactor threads.
pub struct ConnectionDispatcher {
    poll: Poll,
    listener: TcpListener,
    reactors: Vec<ReactorHandle>,
    next_reactor: usize,
    shutdown: Arc<AtomicBool>,
}

impl ConnectionDispatcher {
    /// Registers the listener. The returned waker interrupts [`run`](Self::run)
    /// so it can notice shutdown.
    pub fn new(
        mut listener: TcpListener,
        reactors: Vec<ReactorHandle>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<(Self, Arc<Waker>)> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let dispatcher = Self {
            poll,
            listener,
            reactors,
            next_reactor: 0,
            shutdown,
        };
        Ok((dispatcher, waker))
    }

    pub fn run(mut self) {
        info!("Dispatcher started");
        let mut events = Events::with_capacity(64);

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(MAX_POLL_WAIT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Dispatcher poll failed");
                break;
            }
            let readable = events.iter().any(|event| event.token() == LISTENER);
            if readable {
                self.accept_all();
            }
        }

        for reactor in &self.reactors {
            reactor.wake();
        }
        info!("Dispatcher stopped");
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((socket, addr)) => {
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    self.dispatch(socket, addr);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    break;
                }
            }
        }
    }

    /// Hands the socket to the next live reactor thread.
    fn dispatch(&mut self, mut socket: TcpStream, addr: SocketAddr) {
        for _ in 0..self.reactors.len() {
            let reactor = &self.reactors[self.next_reactor];
            self.next_reactor = (self.next_reactor + 1) % self.reactors.len();
            match reactor.hand_off(socket) {
                Ok(()) => return,
                Err(returned) => socket = returned,
            }
        }
        warn!(client = %addr, "No reactor thread available, dropping connection");
        drop(socket);
    }
}

/// A running server: one dispatcher thread plus its reactor threads.
///
/// Dropping the server stops it the same way [`shutdown`](Self::shutdown)
/// does.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    dispatcher: Option<Arc<Waker>>,
    reactors: Vec<ReactorHandle>,
    threads: Vec<JoinHandle<()>>,
    stats: Arc<ConnectionStats>,
}

impl Server {
    /// Binds the listener and starts every thread.
    pub fn start(
        config: &ServerConfig,
        traffic_cop: Arc<TrafficCop>,
        metrics: Option<Arc<NetworkMetricsStore>>,
    ) -> io::Result<Server> {
        let listener = std::net::TcpListener::bind(config.bind_address())?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let listener = TcpListener::from_std(listener);

        // Threads spawned before a failure are stopped by Drop.
        let mut server = Server {
            local_addr,
            shutdown: Arc::new(AtomicBool::new(false)),
            dispatcher: None,
            reactors: Vec::new(),
            threads: Vec::new(),
            stats: Arc::new(ConnectionStats::new()),
        };

        for i in 0..config.reactors.max(1) {
            let factory = ConnectionHandleFactory::new(
                Arc::clone(&traffic_cop),
                config.io_settings(),
                config.idle_timeout,
                config.pool_size,
            )
            .with_metrics(metrics.clone())
            .with_stats(Arc::clone(&server.stats));

            let name = format!("kvreactor-reactor-{i}");
            let (task, handle) = ConnectionHandlerTask::new(
                name.clone(),
                factory,
                Arc::clone(&server.shutdown),
                Arc::clone(&server.stats),
            )?;
            let thread = thread::Builder::new().name(name).spawn(move || task.run())?;
            server.threads.push(thread);
            server.reactors.push(handle);
        }

        let (dispatcher, waker) = ConnectionDispatcher::new(
            listener,
            server.reactors.clone(),
            Arc::clone(&server.shutdown),
        )?;
        server.dispatcher = Some(waker);
        let thread = thread::Builder::new()
            .name("kvreactor-dispatch".to_string())
            .spawn(move || dispatcher.run())?;
        server.threads.push(thread);

        info!(
            addr = %local_addr,
            reactors = server.reactors.len(),
            async_commands = traffic_cop.is_async(),
            "Server started"
        );
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }

    /// Stops accepting, terminates every live connection and joins all
    /// threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shutdown.store(true, Ordering::Release);
        if let Some(waker) = &self.dispatcher {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake dispatcher");
            }
        }
        for reactor in &self.reactors {
            reactor.wake();
        }
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or("unnamed").to_string();
            if thread.join().is_err() {
                error!(thread = %name, "Server thread panicked");
            }
        }
        info!(
            accepted = self.stats.accepted(),
            "Server stopped"
        );
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
