//! Command Module
//!
//! Everything between a decoded request and its reply.
//!
//! ```text
//!   RespInterpreter (protocol)
//!          │  request
//!          ▼
//!   ┌──────────────┐   slow commands   ┌───────────────────┐
//!   │  TrafficCop  │ ────────────────> │ tokio blocking    │
//!   └──────┬───────┘                   │ pool + oneshot    │
//!          │ inline                    └─────────┬─────────┘
//!          ▼                                     ▼
//!   ┌──────────────┐                     CompletionCallback
//!   │CommandHandler│                     (wakes the connection)
//!   └──────┬───────┘
//!          ▼
//!    StorageEngine
//! ```

pub mod handler;
pub mod kind;
pub mod traffic_cop;

pub use handler::{command_name, CommandError, CommandHandler};
pub use kind::CommandKind;
pub use traffic_cop::{Execution, TrafficCop};
