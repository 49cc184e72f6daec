//! Errors raised while driving a connection.
//!
//! Every variant here is recoverable at the connection level: the state
//! machine logs it and terminates that one connection.

use crate::protocol::ParseError;
use std::io;
use thiserror::Error;

/// Errors that can occur while driving a connection.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// I/O error on the transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or unexpected client data
    #[error("Protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// The peer stopped accepting bytes
    #[error("Peer closed the connection")]
    PeerClosed,

    /// The read buffer hit its limit without holding a complete message
    #[error("Read buffer limit of {limit} bytes exceeded")]
    BufferFull { limit: usize },

    /// The reactor refused a registration change
    #[error("Reactor error: {0}")]
    Reactor(String),
}

impl NetworkError {
    /// Returns true if the error just means the client went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            NetworkError::PeerClosed => true,
            NetworkError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type for connection actions.
pub type NetworkResult<T> = Result<T, NetworkError>;
