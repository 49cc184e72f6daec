//! Network Module
//!
//! Connection handling on reactor threads. Every accepted socket is owned by
//! one [`ConnectionHandle`], which drives a per-connection [`StateMachine`]
//! from readiness events delivered by its thread's [`EventLoop`].
//!
//! ## Per-connection state machine
//!
//! ```text
//!              Proceed / Process        Proceed / TryWrite
//!   ┌──────┐ ───────────────────> ┌─────────┐ ─────────────────> ┌───────┐
//!   │ READ │ <─ NeedRead/TryRead ─│ PROCESS │ <─ Proceed/Process │ WRITE │
//!   └──────┘                      └─────────┘                    └───────┘
//!                                  NeedResult: wait for the
//!                                  worker pool, then GetResult
//!
//!   Terminate from any state ──> CLOSING ── TryClose ──> closed
//! ```
//!
//! The table lives in [`StateMachine::delta`]; the handle only supplies the
//! actions. Protocol work is delegated to a [`ProtocolInterpreter`], and
//! slow commands finish on a worker pool that wakes the connection through
//! its [`CompletionCallback`].

pub mod buffer;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod factory;
pub mod handle;
pub mod handler_task;
pub mod interpreter;
pub mod io_wrapper;
pub mod reactor;
pub mod state_machine;
pub mod stats;
#[cfg(test)]
pub mod testing;

pub use buffer::{ReadBuffer, WriteQueue};
pub use context::{CompletionCallback, ConnectionContext};
pub use dispatcher::{ConnectionDispatcher, Server};
pub use error::{NetworkError, NetworkResult};
pub use event_loop::{EventLoop, Notifier};
pub use factory::ConnectionHandleFactory;
pub use handle::ConnectionHandle;
pub use handler_task::{ConnectionHandlerTask, ReactorHandle};
pub use interpreter::ProtocolInterpreter;
pub use io_wrapper::{IoSettings, IoWrapper, NetworkIoWrapper};
pub use reactor::{ConnectionId, EventActivator, EventFlags, EventHandler, EventId, Reactor};
pub use state_machine::{Action, Actions, ConnState, StateMachine, Transition, TransitionResult};
pub use stats::ConnectionStats;
