//! Recommends a per-priority batch size from recent flush behavior.
//!
//! Shaped on the teacher's telemetry flush task: samples queue into an
//! `mpsc` channel and a background task drains them, here updating a
//! per-priority exponential moving average instead of buffering for an HTTP
//! POST. Never blocks a flush on backpressure — `record` uses `try_send`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::Priority;

const EMA_ALPHA: f64 = 0.2;
/// A sustained average flush latency above this fraction of the configured
/// batch timeout triggers a reduced batch-size recommendation.
const LATENCY_PRESSURE_RATIO: f64 = 1.5;

#[derive(Debug, Clone, Copy)]
pub struct LoadSample {
    pub priority: Priority,
    pub fill_ratio: f64,
    pub flush_latency: Duration,
    pub batch_size: usize,
    pub original_bytes: usize,
    pub compressed_bytes: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ema {
    fill_ratio: f64,
    flush_latency_ms: f64,
    samples: u64,
    min_batch_size: usize,
    max_batch_size: usize,
    total_original_bytes: u64,
    total_compressed_bytes: u64,
}

impl Ema {
    fn update(&mut self, sample: &LoadSample) {
        let latency_ms = sample.flush_latency.as_secs_f64() * 1000.0;
        if self.samples == 0 {
            self.fill_ratio = sample.fill_ratio;
            self.flush_latency_ms = latency_ms;
            self.min_batch_size = sample.batch_size;
            self.max_batch_size = sample.batch_size;
        } else {
            self.fill_ratio = EMA_ALPHA * sample.fill_ratio + (1.0 - EMA_ALPHA) * self.fill_ratio;
            self.flush_latency_ms =
                EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * self.flush_latency_ms;
            self.min_batch_size = self.min_batch_size.min(sample.batch_size);
            self.max_batch_size = self.max_batch_size.max(sample.batch_size);
        }
        self.total_original_bytes += sample.original_bytes as u64;
        self.total_compressed_bytes += sample.compressed_bytes.unwrap_or(sample.original_bytes) as u64;
        self.samples += 1;
    }

    /// Ratio of compressed to original bytes across all recorded samples for
    /// this priority; `1.0` when nothing has been compressed yet.
    fn compression_ratio(&self) -> f64 {
        if self.total_original_bytes == 0 {
            1.0
        } else {
            self.total_compressed_bytes as f64 / self.total_original_bytes as f64
        }
    }
}

pub struct LoadPredictor {
    tx: mpsc::Sender<LoadSample>,
    stats: Arc<Mutex<HashMap<Priority, Ema>>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LoadPredictor {
    pub fn new(analytics_interval: Duration) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<LoadSample>(256);
        let stats: Arc<Mutex<HashMap<Priority, Ema>>> = Arc::new(Mutex::new(HashMap::new()));

        let stats_for_task = Arc::clone(&stats);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(analytics_interval.max(Duration::from_millis(1)));
            interval.tick().await;
            loop {
                tokio::select! {
                    Some(sample) = rx.recv() => {
                        let mut stats = stats_for_task.lock().await;
                        stats.entry(sample.priority).or_default().update(&sample);
                    }
                    _ = interval.tick() => {
                        let stats = stats_for_task.lock().await;
                        let total_samples: u64 = stats.values().map(|e| e.samples).sum();
                        for (priority, ema) in stats.iter() {
                            let share = if total_samples == 0 { 0.0 } else { ema.samples as f64 / total_samples as f64 };
                            debug!(
                                ?priority,
                                fill_ratio = ema.fill_ratio,
                                latency_ms = ema.flush_latency_ms,
                                min_batch_size = ema.min_batch_size,
                                max_batch_size = ema.max_batch_size,
                                compression_ratio = ema.compression_ratio(),
                                share_of_flushes = share,
                                "load predictor stats"
                            );
                        }
                    }
                    else => break,
                }
            }
        });

        Arc::new(Self {
            tx,
            stats,
            task: std::sync::Mutex::new(Some(task)),
        })
    }

    pub fn record(&self, sample: LoadSample) {
        let _ = self.tx.try_send(sample);
    }

    /// Recommends the batch size to use for `priority`'s next flush cycle.
    /// Falls back to `configured` until enough samples have accumulated, and
    /// never recommends below 1.
    pub async fn recommend_batch_size(&self, priority: Priority, configured: usize, batch_timeout: Duration) -> usize {
        let stats = self.stats.lock().await;
        let Some(ema) = stats.get(&priority) else {
            return configured;
        };
        if ema.samples < 3 {
            return configured;
        }
        let timeout_ms = batch_timeout.as_secs_f64() * 1000.0;
        if ema.flush_latency_ms > timeout_ms * LATENCY_PRESSURE_RATIO {
            (configured / 2).max(1)
        } else {
            configured
        }
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recommends_configured_size_before_enough_samples() {
        let predictor = LoadPredictor::new(Duration::from_secs(60));
        let size = predictor
            .recommend_batch_size(Priority::High, 50, Duration::from_millis(100))
            .await;
        assert_eq!(size, 50);
    }

    #[tokio::test]
    async fn recommends_smaller_batch_under_sustained_latency_pressure() {
        let predictor = LoadPredictor::new(Duration::from_secs(60));
        for _ in 0..5 {
            predictor.record(LoadSample {
                priority: Priority::High,
                fill_ratio: 1.0,
                flush_latency: Duration::from_millis(500),
                batch_size: 50,
                original_bytes: 2048,
                compressed_bytes: Some(1024),
            });
        }
        // give the background task a chance to drain the channel
        tokio::time::sleep(Duration::from_millis(50)).await;
        let size = predictor
            .recommend_batch_size(Priority::High, 50, Duration::from_millis(100))
            .await;
        assert_eq!(size, 25);
    }

    #[tokio::test]
    async fn tracks_batch_size_range_and_compression_ratio() {
        let predictor = LoadPredictor::new(Duration::from_secs(60));
        predictor.record(LoadSample {
            priority: Priority::Medium,
            fill_ratio: 0.5,
            flush_latency: Duration::from_millis(10),
            batch_size: 10,
            original_bytes: 1000,
            compressed_bytes: Some(500),
        });
        predictor.record(LoadSample {
            priority: Priority::Medium,
            fill_ratio: 1.0,
            flush_latency: Duration::from_millis(10),
            batch_size: 40,
            original_bytes: 1000,
            compressed_bytes: Some(500),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = predictor.stats.lock().await;
        let ema = stats[&Priority::Medium];
        assert_eq!(ema.min_batch_size, 10);
        assert_eq!(ema.max_batch_size, 40);
        assert_eq!(ema.compression_ratio(), 0.5);
    }
}
