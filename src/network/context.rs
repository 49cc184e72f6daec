//! Per-connection context handed to the protocol interpreter.

use crate::metrics::{NetworkFeatures, NetworkOperatingUnit};
use crate::network::reactor::{ConnectionId, EventActivator, EventFlags, EventId};
use std::fmt;
use std::sync::Arc;

/// Wakes a connection once its asynchronous command completed.
///
/// This is the only piece of a connection that may cross threads; invoking it
/// activates the connection's manual event and touches nothing else.
#[derive(Clone)]
pub struct CompletionCallback {
    activator: Arc<dyn EventActivator>,
    event: EventId,
}

impl CompletionCallback {
    pub fn new(activator: Arc<dyn EventActivator>, event: EventId) -> Self {
        Self { activator, event }
    }

    pub fn event(&self) -> EventId {
        self.event
    }

    pub fn invoke(&self) {
        self.activator.activate(self.event, EventFlags::WRITE);
    }
}

impl fmt::Debug for CompletionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionCallback")
            .field("event", &self.event)
            .finish()
    }
}

/// State shared between a handle and its interpreter.
#[derive(Debug)]
pub struct ConnectionContext {
    connection_id: ConnectionId,
    /// Counters for the inbound unit currently being sampled
    pub read_features: NetworkFeatures,
    /// Counters for the outbound unit currently being sampled
    pub write_features: NetworkFeatures,
    callback: Option<CompletionCallback>,
    commands_processed: u64,
}

impl ConnectionContext {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            read_features: NetworkFeatures::armed(NetworkOperatingUnit::Read),
            write_features: NetworkFeatures::armed(NetworkOperatingUnit::Write),
            callback: None,
            commands_processed: 0,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn set_callback(&mut self, callback: CompletionCallback) {
        self.callback = Some(callback);
    }

    /// The callback asynchronous commands must invoke, if the connection is
    /// registered with a reactor.
    pub fn callback(&self) -> Option<&CompletionCallback> {
        self.callback.as_ref()
    }

    pub fn commands_processed(&self) -> u64 {
        self.commands_processed
    }

    pub fn command_processed(&mut self) {
        self.commands_processed += 1;
    }

    /// Back to a fresh context for a new connection.
    pub fn reset(&mut self, connection_id: ConnectionId) {
        *self = Self::new(connection_id);
    }
}
