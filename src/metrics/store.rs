use super::NetworkFeatures;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

pub const CSV_HEADER: &str = "op_unit, num_queries, num_reads, num_writes, num_admin, bytes, elapsed_us";

/// Bytes worth of records kept before new ones are dropped.
const STORE_BYTES: usize = 1 << 15;

/// Collects feature records from every reactor thread.
#[derive(Debug)]
pub struct NetworkMetricsStore {
    enabled: AtomicBool,
    records: Mutex<VecDeque<NetworkFeatures>>,
    capacity: usize,
}

impl NetworkMetricsStore {
    pub fn new(enabled: bool) -> Self {
        let capacity = STORE_BYTES / std::mem::size_of::<NetworkFeatures>();
        Self {
            enabled: AtomicBool::new(enabled),
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// The cheap check performed before every sampled I/O call.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stores a record. Returns false if the store is full and it was dropped.
    pub fn record(&self, features: NetworkFeatures) -> bool {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() >= self.capacity {
            return false;
        }
        records.push_back(features);
        true
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every collected record.
    pub fn drain(&self) -> Vec<NetworkFeatures> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Writes the header and all collected records, draining the store.
    /// Returns the number of records written.
    pub fn write_csv<W: Write>(&self, mut out: W) -> io::Result<usize> {
        let records = self.drain();
        writeln!(out, "{}", CSV_HEADER)?;
        for record in &records {
            writeln!(out, "{}", record)?;
        }
        out.flush()?;
        Ok(records.len())
    }
}

impl Default for NetworkMetricsStore {
    fn default() -> Self {
        Self::new(false)
    }
}
