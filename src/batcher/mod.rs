//! Per-client, per-priority message batching.
//!
//! Each client has one queue per `Priority`. A queue flushes either when it
//! reaches its effective batch size (the configured size, adjusted down by
//! the `LoadPredictor` under sustained flush-latency pressure) or when its
//! flush timer ticks, whichever comes first.

pub mod predictor;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::compression;
use crate::config::{BatchingConfig, CompressionSettings};
use crate::errors::{ErrorTag, GatewayResult};
use crate::protocol::{Message, Priority, Tag};

use predictor::{LoadPredictor, LoadSample};

struct ClientState {
    queues: HashMap<Priority, VecDeque<Value>>,
    outbox: mpsc::Sender<Message>,
    flush_tasks: Vec<JoinHandle<()>>,
}

pub struct Batcher {
    config: Arc<BatchingConfig>,
    predictor: Arc<LoadPredictor>,
    clients: Mutex<HashMap<String, ClientState>>,
}

impl Batcher {
    pub fn new(config: Arc<BatchingConfig>) -> Arc<Self> {
        let predictor = LoadPredictor::new(config.analytics_interval);
        Arc::new(Self {
            config,
            predictor,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a client and starts one periodic flush timer per priority,
    /// each ticking at that priority's own configured timeout. Messages for
    /// flushed batches are sent to `outbox`.
    pub async fn register_client(self: &Arc<Self>, client_id: &str, outbox: mpsc::Sender<Message>) {
        let flush_tasks = Priority::BATCHABLE
            .iter()
            .map(|&priority| {
                let this = Arc::clone(self);
                let client_id_owned = client_id.to_string();
                let timeout = this.config.timeouts.get(priority);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(timeout);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        this.flush(&client_id_owned, priority).await;
                    }
                })
            })
            .collect();

        let mut clients = self.clients.lock().await;
        clients.insert(
            client_id.to_string(),
            ClientState {
                queues: HashMap::new(),
                outbox,
                flush_tasks,
            },
        );
    }

    /// Removes a client, cancels its flush timers, and drops any residual
    /// queued messages (an unflushed queue is discarded rather than stalling
    /// shutdown), logging how many were dropped.
    pub async fn remove_client(&self, client_id: &str) -> usize {
        let mut clients = self.clients.lock().await;
        let Some(state) = clients.remove(client_id) else {
            return 0;
        };
        for task in &state.flush_tasks {
            task.abort();
        }
        let dropped: usize = state.queues.values().map(|q| q.len()).sum();
        if dropped > 0 {
            warn!(client_id, dropped, "dropping residual queued messages on client removal");
        }
        dropped
    }

    pub async fn add_message(&self, client_id: &str, priority: Priority, data: Value) -> GatewayResult<()> {
        let effective = self
            .predictor
            .recommend_batch_size(priority, self.config.batch_size, self.config.batch_timeout)
            .await;

        let should_flush = {
            let mut clients = self.clients.lock().await;
            let Some(state) = clients.get_mut(client_id) else {
                return Err(ErrorTag::ConnectionError.into());
            };
            let queue = state.queues.entry(priority).or_default();
            if queue.len() >= self.config.max_queue_size {
                return Err(ErrorTag::QueueFull.into());
            }
            queue.push_back(data);
            queue.len() >= effective
        };

        if should_flush {
            self.flush(client_id, priority).await;
        }
        Ok(())
    }

    /// Flushes one client's one priority queue, if non-empty, sending the
    /// resulting `BATCH` frame to that client's outbox.
    async fn flush(&self, client_id: &str, priority: Priority) {
        let (batch, outbox) = {
            let mut clients = self.clients.lock().await;
            let Some(state) = clients.get_mut(client_id) else {
                return;
            };
            let effective = self.config.batch_size;
            let batch = build_batch(&mut state.queues, priority, effective, &self.config.compression, &self.predictor);
            (batch, state.outbox.clone())
        };
        if let Some(message) = batch {
            let _ = outbox.send(message).await;
        }
    }

    /// Stops all flush timers and drops remaining queued work, returning the
    /// total number of dropped messages.
    pub async fn stop(&self) -> usize {
        let client_ids: Vec<String> = self.clients.lock().await.keys().cloned().collect();
        let mut dropped = 0;
        for client_id in client_ids {
            dropped += self.remove_client(&client_id).await;
        }
        self.predictor.stop().await;
        dropped
    }
}

fn build_batch(
    queues: &mut HashMap<Priority, VecDeque<Value>>,
    priority: Priority,
    effective_batch_size: usize,
    compression_settings: &CompressionSettings,
    predictor: &LoadPredictor,
) -> Option<Message> {
    let queue = queues.get_mut(&priority)?;
    if queue.is_empty() {
        return None;
    }
    let take = effective_batch_size.max(1).min(queue.len());
    let items: Vec<Value> = queue.drain(..take).collect();
    let fill_ratio = items.len() as f64 / effective_batch_size.max(1) as f64;

    let start = Instant::now();
    let serialized = serde_json::to_vec(&items).unwrap_or_default();
    let threshold = compression_settings.priority_thresholds.get(priority);
    let original_bytes = serialized.len();
    let mut compressed_bytes = None;
    let data = if compression_settings.enabled && serialized.len() >= threshold {
        match compression::compress(&serialized, compression_settings.algorithm, compression_settings.level) {
            Ok(compressed) => {
                compressed_bytes = Some(compressed.len());
                json!({
                    "priority": priority,
                    "compressed": true,
                    "algorithm": compression_settings.algorithm,
                    "payload": hex::encode(compressed),
                    "count": items.len(),
                })
            }
            Err(_) => json!({
                "priority": priority,
                "compressed": false,
                "messages": items,
                "count": take,
            }),
        }
    } else {
        json!({
            "priority": priority,
            "compressed": false,
            "messages": items,
            "count": take,
        })
    };
    let flush_latency = start.elapsed();

    predictor.record(LoadSample {
        priority,
        fill_ratio,
        flush_latency,
        batch_size: take,
        original_bytes,
        compressed_bytes,
    });

    Some(Message::new(Tag::Batch, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_timeouts() -> crate::config::PriorityTimeouts {
        crate::config::PriorityTimeouts {
            high: Duration::from_secs(60),
            medium: Duration::from_secs(60),
            low: Duration::from_secs(60),
        }
    }

    fn test_compression() -> CompressionSettings {
        CompressionSettings {
            enabled: true,
            min_size: 1024,
            level: 6,
            algorithm: crate::compression::Algorithm::Gzip,
            priority_thresholds: crate::config::PriorityThresholds {
                high: 512,
                medium: 1024,
                low: 2048,
            },
        }
    }

    fn test_config() -> Arc<BatchingConfig> {
        Arc::new(BatchingConfig {
            batch_size: 3,
            batch_timeout: Duration::from_secs(60),
            max_queue_size: 10,
            analytics_interval: Duration::from_secs(60),
            timeouts: test_timeouts(),
            compression: test_compression(),
        })
    }

    #[tokio::test]
    async fn flushes_automatically_at_batch_size() {
        let batcher = Batcher::new(test_config());
        let (tx, mut rx) = mpsc::channel(8);
        batcher.register_client("c1", tx).await;

        batcher.add_message("c1", Priority::Medium, json!(1)).await.unwrap();
        batcher.add_message("c1", Priority::Medium, json!(2)).await.unwrap();
        assert!(rx.try_recv().is_err(), "not yet full");
        batcher.add_message("c1", Priority::Medium, json!(3)).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.data["count"], json!(3));
    }

    #[tokio::test]
    async fn queue_full_is_rejected() {
        let batcher = Batcher::new(Arc::new(BatchingConfig {
            batch_size: 100,
            batch_timeout: Duration::from_secs(60),
            max_queue_size: 2,
            analytics_interval: Duration::from_secs(60),
            timeouts: test_timeouts(),
            compression: test_compression(),
        }));
        let (tx, _rx) = mpsc::channel(8);
        batcher.register_client("c1", tx).await;
        batcher.add_message("c1", Priority::Low, json!(1)).await.unwrap();
        batcher.add_message("c1", Priority::Low, json!(2)).await.unwrap();
        let err = batcher.add_message("c1", Priority::Low, json!(3)).await.unwrap_err();
        assert_eq!(err.tag, ErrorTag::QueueFull);
    }

    #[tokio::test]
    async fn remove_client_reports_dropped_count() {
        let batcher = Batcher::new(test_config());
        let (tx, _rx) = mpsc::channel(8);
        batcher.register_client("c1", tx).await;
        batcher.add_message("c1", Priority::High, json!(1)).await.unwrap();
        let dropped = batcher.remove_client("c1").await;
        assert_eq!(dropped, 1);
    }

    #[tokio::test]
    async fn message_to_unknown_client_is_connection_error() {
        let batcher = Batcher::new(test_config());
        let err = batcher.add_message("ghost", Priority::Low, json!(1)).await.unwrap_err();
        assert_eq!(err.tag, ErrorTag::ConnectionError);
    }
}
