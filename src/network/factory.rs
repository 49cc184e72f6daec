//! Connection handle pooling.
//!
//! Closed handles keep their buffers. The factory parks them and hands them
//! out again through [`ConnectionHandle::reset_for_reuse`], so a busy reactor
//! thread stops allocating per connection once its pool is warm.

use crate::commands::TrafficCop;
use crate::metrics::NetworkMetricsStore;
use crate::network::handle::ConnectionHandle;
use crate::network::io_wrapper::{IoSettings, NetworkIoWrapper};
use crate::network::reactor::ConnectionId;
use crate::network::stats::ConnectionStats;
use crate::protocol::{RespInterpreter, RespParser};
use mio::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Per-reactor source of [`ConnectionHandle`]s.
pub struct ConnectionHandleFactory {
    pool: Vec<ConnectionHandle>,
    pool_size: usize,
    settings: IoSettings,
    read_timeout: Option<Duration>,
    parser: RespParser,
    traffic_cop: Arc<TrafficCop>,
    metrics: Option<Arc<NetworkMetricsStore>>,
    stats: Option<Arc<ConnectionStats>>,
}

impl ConnectionHandleFactory {
    pub fn new(
        traffic_cop: Arc<TrafficCop>,
        settings: IoSettings,
        read_timeout: Option<Duration>,
        pool_size: usize,
    ) -> Self {
        // A frame larger than the read buffer could never complete.
        let parser = RespParser::new().with_max_bulk_size(settings.max_read_buffer);
        Self {
            pool: Vec::with_capacity(pool_size.min(64)),
            pool_size,
            settings,
            read_timeout,
            parser,
            traffic_cop,
            metrics: None,
            stats: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<NetworkMetricsStore>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_stats(mut self, stats: Arc<ConnectionStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Closed handles waiting for reuse.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    fn interpreter(&self) -> Box<RespInterpreter> {
        Box::new(RespInterpreter::with_parser(self.parser.clone()))
    }

    /// A handle for a freshly accepted socket, recycled when possible.
    pub fn acquire(&mut self, connection_id: ConnectionId, socket: TcpStream) -> ConnectionHandle {
        let interpreter = self.interpreter();
        if let Some(mut handle) = self.pool.pop() {
            trace!(conn = %connection_id, "Reusing pooled handle");
            handle.reset_for_reuse(connection_id, socket, interpreter);
            if let Some(stats) = &self.stats {
                stats.handle_reused();
            }
            return handle;
        }

        let mut handle = ConnectionHandle::new(
            connection_id,
            NetworkIoWrapper::new(socket, self.settings),
            interpreter,
            Arc::clone(&self.traffic_cop),
        )
        .with_read_timeout(self.read_timeout);
        if let Some(metrics) = &self.metrics {
            handle = handle.with_metrics(Arc::clone(metrics));
        }
        if let Some(stats) = &self.stats {
            handle = handle.with_stats(Arc::clone(stats));
        }
        handle
    }

    /// Takes back a closed handle. Its socket is dropped right away; the
    /// handle itself is pooled unless the pool is full.
    pub fn release(&mut self, mut handle: ConnectionHandle) {
        handle.release_transport();
        if self.pool.len() < self.pool_size {
            self.pool.push(handle);
        }
    }
}
