//! In-process counters: connection lifecycle and classified errors.
//!
//! Shaped on the teacher's telemetry accumulator — a background task wakes
//! on a timer and logs a snapshot — but counters live purely in memory here;
//! there's no outbound network sink to flush to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::errors::{ErrorBand, ErrorTag};

#[derive(Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    connections_active: AtomicI64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    error_counts: Mutex<HashMap<ErrorTag, u64>>,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: i64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub error_counts: HashMap<ErrorTag, u64>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_message_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_out(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn record_error(&self, tag: ErrorTag) {
        *self.error_counts.lock().await.entry(tag).or_insert(0) += 1;
    }

    /// Error counts grouped by propagation band (§7), derived from the same
    /// per-tag tally `record_error` maintains.
    pub async fn band_counts(&self) -> HashMap<ErrorBand, u64> {
        let mut bands: HashMap<ErrorBand, u64> = HashMap::new();
        for (tag, count) in self.error_counts.lock().await.iter() {
            *bands.entry(tag.band()).or_insert(0) += count;
        }
        bands
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            error_counts: self.error_counts.lock().await.clone(),
        }
    }

    /// Spawns a task that logs a snapshot on `interval`. Returns its handle
    /// so the caller can abort it during shutdown.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let snapshot = this.snapshot().await;
                let bands = this.band_counts().await;
                info!(
                    connections_active = snapshot.connections_active,
                    connections_total = snapshot.connections_total,
                    messages_in = snapshot.messages_in,
                    messages_out = snapshot.messages_out,
                    errors = snapshot.error_counts.values().sum::<u64>(),
                    errors_admission = bands.get(&ErrorBand::Admission).copied().unwrap_or(0),
                    errors_protocol = bands.get(&ErrorBand::Protocol).copied().unwrap_or(0),
                    errors_auth = bands.get(&ErrorBand::Auth).copied().unwrap_or(0),
                    errors_operational = bands.get(&ErrorBand::Operational).copied().unwrap_or(0),
                    "gateway metrics"
                );
            }
        })
    }
}
