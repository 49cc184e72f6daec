//! Network Metrics Module
//!
//! An optional sampling hook around the raw socket I/O of each connection.
//! When enabled, connections record a [`NetworkFeatures`] row for every read
//! or write that carried exactly one command, and the rows are collected in a
//! bounded [`NetworkMetricsStore`] for CSV export.
//!
//! Batches of pipelined commands are not attributed: a read that delivered
//! three commands cannot be split into per-command byte counts.

mod features;
mod store;

pub use features::{NetworkFeatures, NetworkOperatingUnit};
pub use store::{NetworkMetricsStore, CSV_HEADER};
