//! # kvreactor - A Redis-Compatible Key-Value Server on Reactor Threads
//!
//! kvreactor serves the RESP protocol from a small, fixed set of reactor
//! threads. Each connection is a [`network::ConnectionHandle`] driven by an
//! explicit state machine, so the lifecycle of a socket (reading, decoding,
//! waiting for a slow command, flushing, closing) is a table lookup rather
//! than control flow scattered across async tasks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               kvreactor                                  │
//! │                                                                          │
//! │  ┌──────────────┐  hand-off  ┌────────────────────────────────────────┐  │
//! │  │  Dispatcher  │──────────> │ Reactor thread (EventLoop, N per box)  │  │
//! │  │  (listener)  │            │  ConnectionHandle ── StateMachine      │  │
//! │  └──────────────┘            │        │                               │  │
//! │                              │        ▼                               │  │
//! │                              │  RespInterpreter ──> TrafficCop ───────┼──┼─┐
//! │                              └────────────────────────────────────────┘  │ │
//! │                                                          inline │        │ │
//! │                                                                 ▼        │ │
//! │  ┌──────────────────┐      ┌──────────────────────────────────────────┐  │ │
//! │  │  Tokio runtime   │      │              StorageEngine               │  │ │
//! │  │  spawn_blocking  │────> │  ┌────────┐ ┌────────┐ ┌────────┐        │  │ │
//! │  │  ExpirySweeper   │      │  │Shard 0 │ │Shard 1 │ │...N    │        │  │ │
//! │  └──────────────────┘      │  └────────┘ └────────┘ └────────┘        │  │ │
//! │          ▲                 └──────────────────────────────────────────┘  │ │
//! │          └───────────────────── slow commands (KEYS, FLUSHDB, ...) ──────┼─┘
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use kvreactor::commands::{CommandHandler, TrafficCop};
//! use kvreactor::config::ServerConfig;
//! use kvreactor::network::Server;
//! use kvreactor::storage::StorageEngine;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(StorageEngine::new());
//! let traffic_cop = TrafficCop::new(Arc::new(CommandHandler::new(storage)));
//!
//! let server = Server::start(&ServerConfig::default(), Arc::new(traffic_cop), None)?;
//! println!("listening on {}", server.local_addr());
//! server.shutdown();
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! ## Module Overview
//!
//! - [`network`]: state machine, connection handles, reactor threads and dispatcher
//! - [`protocol`]: RESP parser, types and the connection-facing interpreter
//! - [`commands`]: command execution and the inline/worker-pool split
//! - [`storage`]: thread-safe storage engine with TTL support
//! - [`metrics`]: optional per-request network feature sampling
//! - [`config`]: command-line configuration

pub mod commands;
pub mod config;
pub mod metrics;
pub mod network;
pub mod protocol;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::{CommandHandler, TrafficCop};
pub use config::ServerConfig;
pub use network::{ConnectionHandle, Server, StateMachine};
pub use protocol::{ParseError, RespParser, RespValue};
pub use storage::{ExpiryConfig, ExpirySweeper, StorageEngine};

/// The default port kvreactor listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host kvreactor binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of kvreactor
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
