//! Transport Wrappers
//!
//! An [`IoWrapper`] owns a connection's transport together with its
//! [`ReadBuffer`] and [`WriteQueue`] and performs the non-blocking fill and
//! flush the state machine asks for. Each operation answers with the
//! [`Transition`] the connection should take next, so blocking on the socket
//! turns into "wait for readiness" instead of a stalled thread.

use crate::network::buffer::{ReadBuffer, WriteQueue};
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::state_machine::Transition;
use mio::net::TcpStream;
use std::io::{self, ErrorKind};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, trace};

/// Buffer sizing shared by every wrapper a reactor thread creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoSettings {
    /// Maximum bytes buffered for a single connection
    pub max_read_buffer: usize,
    /// Queued response bytes that trigger a flush on their own
    pub flush_threshold: usize,
    /// Ask for the idle timeout whenever the socket is drained
    pub idle_timeout: bool,
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            max_read_buffer: 1024 * 1024,
            flush_threshold: 16 * 1024,
            idle_timeout: true,
        }
    }
}

/// A connection's transport plus its buffers.
pub trait IoWrapper {
    /// What [`IoWrapper::restart`] installs when a handle is reused.
    type Socket;

    fn socket_fd(&self) -> RawFd;

    /// Reads as much as is available without blocking.
    ///
    /// `Proceed` once bytes arrived, `NeedRead`/`NeedReadTimeout` when the
    /// socket is drained, `Terminate` at end of stream.
    fn fill_read_buffer(&mut self) -> NetworkResult<Transition>;

    /// Writes the whole queue, or answers `NeedWrite` if the socket is full.
    fn flush_all_writes(&mut self) -> NetworkResult<Transition>;

    /// True when queued responses are due to go out.
    fn should_flush(&self) -> bool;

    /// Closes the transport. `Proceed` on success, otherwise the wait needed
    /// before trying again. Closing twice is a no-op.
    fn close(&mut self) -> NetworkResult<Transition>;

    /// Installs a fresh transport and empties the buffers.
    fn restart(&mut self, socket: Self::Socket);

    /// Drops the transport but keeps the buffers for the next restart.
    fn release(&mut self);

    fn read_buffer(&self) -> &ReadBuffer;

    fn write_queue(&self) -> &WriteQueue;

    /// Both buffers at once, as the interpreter needs them.
    fn buffers_mut(&mut self) -> (&mut ReadBuffer, &mut WriteQueue);
}

/// An [`IoWrapper`] over a plain non-blocking TCP socket.
#[derive(Debug)]
pub struct NetworkIoWrapper {
    stream: Option<TcpStream>,
    peer_addr: Option<SocketAddr>,
    read_buffer: ReadBuffer,
    write_queue: WriteQueue,
    settings: IoSettings,
    closed: bool,
}

impl NetworkIoWrapper {
    pub fn new(stream: TcpStream, settings: IoSettings) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            stream: Some(stream),
            peer_addr,
            read_buffer: ReadBuffer::new(settings.max_read_buffer),
            write_queue: WriteQueue::new(settings.flush_threshold),
            settings,
            closed: false,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn stream(&mut self) -> NetworkResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(NetworkError::PeerClosed)
    }

    fn drained_transition(&self) -> Transition {
        if self.settings.idle_timeout {
            Transition::NeedReadTimeout
        } else {
            Transition::NeedRead
        }
    }
}

impl IoWrapper for NetworkIoWrapper {
    type Socket = TcpStream;

    fn socket_fd(&self) -> RawFd {
        self.stream.as_ref().map_or(-1, |s| s.as_raw_fd())
    }

    fn fill_read_buffer(&mut self) -> NetworkResult<Transition> {
        let mut result = self.drained_transition();

        loop {
            if self.read_buffer.is_full() {
                if result == Transition::Proceed {
                    return Ok(result);
                }
                return Err(NetworkError::BufferFull {
                    limit: self.read_buffer.limit(),
                });
            }

            let stream = self.stream.as_mut().ok_or(NetworkError::PeerClosed)?;
            match self.read_buffer.fill_from(stream) {
                Ok(0) => {
                    trace!(peer = ?self.peer_addr, "End of stream");
                    return Ok(Transition::Terminate);
                }
                Ok(n) => {
                    trace!(peer = ?self.peer_addr, bytes = n, "Read data");
                    result = Transition::Proceed;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(result),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn flush_all_writes(&mut self) -> NetworkResult<Transition> {
        while !self.write_queue.is_empty() {
            let stream = self.stream.as_mut().ok_or(NetworkError::PeerClosed)?;
            match self.write_queue.write_to(stream) {
                Ok(0) => return Err(NetworkError::PeerClosed),
                Ok(n) => trace!(peer = ?self.peer_addr, bytes = n, "Sent data"),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Transition::NeedWrite),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.write_queue.flushed();
        Ok(Transition::Proceed)
    }

    fn should_flush(&self) -> bool {
        self.write_queue.should_flush()
    }

    fn close(&mut self) -> NetworkResult<Transition> {
        if self.closed {
            return Ok(Transition::Proceed);
        }

        // Last chance for already-encoded frames such as a termination notice.
        if !self.write_queue.is_empty() {
            if let Err(e) = self.flush_all_writes() {
                debug!(peer = ?self.peer_addr, error = %e, "Dropping unsent bytes on close");
            }
            self.write_queue.clear();
        }

        let stream = self.stream()?;
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotConnected => {}
            Err(e) => debug!(peer = ?self.peer_addr, error = %e, "Socket shutdown failed"),
        }
        self.closed = true;
        Ok(Transition::Proceed)
    }

    fn restart(&mut self, socket: TcpStream) {
        self.peer_addr = socket.peer_addr().ok();
        self.stream = Some(socket);
        self.read_buffer.clear();
        self.write_queue.clear();
        self.closed = false;
    }

    fn release(&mut self) {
        self.stream = None;
        self.read_buffer.clear();
        self.write_queue.clear();
        self.closed = true;
    }

    fn read_buffer(&self) -> &ReadBuffer {
        &self.read_buffer
    }

    fn write_queue(&self) -> &WriteQueue {
        &self.write_queue
    }

    fn buffers_mut(&mut self) -> (&mut ReadBuffer, &mut WriteQueue) {
        (&mut self.read_buffer, &mut self.write_queue)
    }
}

/// Converts an accepted std socket into the non-blocking form the reactor needs.
pub fn into_nonblocking(stream: std::net::TcpStream) -> io::Result<TcpStream> {
    stream.set_nonblocking(true)?;
    Ok(TcpStream::from_std(stream))
}
