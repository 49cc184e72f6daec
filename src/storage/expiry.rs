//! Active Expiry
//!
//! Lazy expiry only evicts keys somebody touches again. The sweeper is a tokio
//! task that periodically evicts the rest, sweeping faster while many keys
//! expire and backing off while none do.

use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Sweep pacing.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    pub base_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Expired fraction above which the interval is halved
    pub speedup_threshold: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            speedup_threshold: 0.25,
        }
    }
}

impl ExpiryConfig {
    /// The interval to use after a sweep that evicted `expired` of `scanned` keys.
    fn next_interval(&self, current: Duration, expired: u64, scanned: u64) -> Duration {
        if scanned > 0 && expired as f64 / scanned as f64 > self.speedup_threshold {
            (current / 2).max(self.min_interval)
        } else if expired == 0 {
            (current * 2).min(self.max_interval)
        } else {
            current
        }
    }
}

/// Handle to the running sweeper task. Dropping it stops the task.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    /// Spawns the sweeper on the current tokio runtime.
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(sweep(engine, config, shutdown_rx));
        info!("Expiry sweeper started");
        Self {
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Signals the task to stop and waits for it.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        if self.shutdown_tx.send(true).is_ok() {
            debug!("Expiry sweeper stopping");
        }
    }
}

async fn sweep(
    engine: Arc<StorageEngine>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Expiry sweeper stopped");
                    return;
                }
            }
        }

        let scanned = engine.len();
        let expired = engine.cleanup_expired();
        let next = config.next_interval(interval, expired, scanned);

        if expired > 0 {
            debug!(
                expired,
                keys_remaining = engine.len(),
                interval_ms = next.as_millis() as u64,
                "Evicted expired keys"
            );
        } else if next != interval {
            trace!(interval_ms = next.as_millis() as u64, "Expiry sweeper backing off");
        }
        interval = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_next_interval_adapts() {
        let config = ExpiryConfig::default();
        let base = config.base_interval;

        assert_eq!(config.next_interval(base, 50, 100), base / 2);
        assert_eq!(config.next_interval(base, 0, 100), base * 2);
        assert_eq!(config.next_interval(base, 1, 100), base);
        assert_eq!(
            config.next_interval(config.min_interval, 100, 100),
            config.min_interval
        );
        assert_eq!(
            config.next_interval(config.max_interval, 0, 0),
            config.max_interval
        );
    }

    #[tokio::test]
    async fn test_sweeper_evicts_expired_keys() {
        let engine = Arc::new(StorageEngine::new());
        for i in 0..10 {
            engine.set_with_ttl(
                Bytes::from(format!("key{}", i)),
                Bytes::from("v"),
                Duration::from_millis(30),
            );
        }
        engine.set(Bytes::from("persistent"), Bytes::from("v"));

        let sweeper = ExpirySweeper::start(
            Arc::clone(&engine),
            ExpiryConfig {
                base_interval: Duration::from_millis(10),
                ..ExpiryConfig::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(engine.len(), 1);
        assert!(engine.exists(b"persistent"));

        sweeper.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_sweeper_leaves_keys_to_lazy_expiry() {
        let engine = Arc::new(StorageEngine::new());
        let sweeper = ExpirySweeper::start(Arc::clone(&engine), ExpiryConfig::default());
        sweeper.stop().await;

        engine.set_with_ttl(Bytes::from("k"), Bytes::from("v"), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(engine.len(), 1);
        assert!(engine.get(b"k").is_none());
        assert_eq!(engine.len(), 0);
    }
}
