//! Storage Engine Module
//!
//! The data the command layer operates on: a sharded, thread-safe key-value
//! store with per-key deadlines, plus the background task that evicts keys
//! nobody reads again.
//!
//! ```
//! use kvreactor::storage::StorageEngine;
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let engine = StorageEngine::new();
//! engine.set(Bytes::from("name"), Bytes::from("kv"));
//! assert_eq!(engine.get(b"name"), Some(Bytes::from("kv")));
//!
//! engine.set_with_ttl(Bytes::from("session"), Bytes::from("t0k3n"), Duration::from_secs(60));
//! assert!(engine.pttl(b"session").unwrap() > 0);
//! ```

pub mod engine;
pub mod expiry;

pub use engine::{Entry, SetCondition, SetOptions, StorageEngine, StorageError, StorageStats};
pub use expiry::{ExpiryConfig, ExpirySweeper};
