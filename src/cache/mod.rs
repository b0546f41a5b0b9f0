//! General-purpose keyed cache with TTL, priority-aware eviction, and
//! optional entry compression.
//!
//! The LRU bookkeeping (hash map + order deque, move-to-back on hit, evict
//! from the front on overflow) is the teacher's completion cache pattern.
//! TTL expiry, priority-aware eviction, and the memory budget are this
//! gateway's additions on top of that shape.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::compression::{self, Algorithm};
use crate::config::CacheConfig;
use crate::errors::GatewayResult;
use crate::protocol::Priority;
use crate::sliding_window::RatioWindow;

struct CacheEntry {
    bytes: Vec<u8>,
    compressed: bool,
    priority: Priority,
    size_bytes: usize,
    inserted_at: Instant,
    expires_at: Option<Instant>,
}

struct CacheInner {
    map: HashMap<String, CacheEntry>,
    /// Front = least recently used, back = most recently used.
    order: VecDeque<String>,
    memory_used: usize,
    hit_ratio: RatioWindow,
}

impl CacheInner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        let entry = self.map.remove(key)?;
        self.memory_used = self.memory_used.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Evicts the lowest-priority entry, breaking ties in favor of the least
    /// recently used one.
    fn evict_one(&mut self) -> Option<String> {
        let min_priority = self.map.values().map(|e| e.priority).min()?;
        let victim = self
            .order
            .iter()
            .find(|k| self.map.get(*k).map(|e| e.priority) == Some(min_priority))
            .cloned()?;
        self.remove(&victim);
        Some(victim)
    }

    /// Evicts the least recently used entry among those *below* the highest
    /// priority currently observed in the cache, leaving the top priority
    /// band untouched. Used by the memory monitor instead of `evict_one` so
    /// a memory-pressure sweep never reclaims the entries callers care about
    /// most. Returns `None` (evicting nothing) if every entry shares the
    /// highest priority.
    fn evict_skipping_highest(&mut self) -> Option<String> {
        let max_priority = self.map.values().map(|e| e.priority).max()?;
        let victim = self
            .order
            .iter()
            .find(|k| self.map.get(*k).map(|e| e.priority) != Some(max_priority))
            .cloned()?;
        self.remove(&victim);
        Some(victim)
    }

    fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .map
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|t| t <= now))
            .map(|(k, _)| k.clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.remove(&key);
        }
        count
    }
}

/// Thread-safe, priority-aware cache. Cheaply cloneable via `Arc` internally.
pub struct Cache {
    config: Arc<CacheConfig>,
    inner: Mutex<CacheInner>,
    sweep_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    memory_monitor_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    pub fn new(config: Arc<CacheConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                memory_used: 0,
                hit_ratio: RatioWindow::new(1000),
            }),
            sweep_task: std::sync::Mutex::new(None),
            memory_monitor_task: std::sync::Mutex::new(None),
        })
    }

    /// Spawns the periodic expired-entry sweep and, if enabled, the memory
    /// pressure monitor.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = this.config.invalidation_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = this.inner.lock().await.sweep_expired(Instant::now());
                if removed > 0 {
                    debug!(removed, "cache invalidation sweep");
                }
            }
        });
        *self.sweep_task.lock().unwrap() = Some(handle);

        if self.config.memory_monitoring.enabled {
            let this = Arc::clone(self);
            let monitoring = this.config.memory_monitoring.clone();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(monitoring.check_interval);
                loop {
                    ticker.tick().await;
                    let mut inner = this.inner.lock().await;
                    if inner.memory_used > monitoring.warning_threshold_bytes {
                        warn!(
                            memory_used = inner.memory_used,
                            warning_threshold_bytes = monitoring.warning_threshold_bytes,
                            "cache memory usage above warning threshold"
                        );
                    }
                    let mut evicted = 0;
                    while inner.memory_used > monitoring.max_memory_bytes {
                        if inner.evict_skipping_highest().is_none() {
                            break;
                        }
                        evicted += 1;
                    }
                    if evicted > 0 {
                        debug!(evicted, memory_used = inner.memory_used, "cache memory monitor evicted entries");
                    }
                }
            });
            *self.memory_monitor_task.lock().unwrap() = Some(handle);
        }
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.sweep_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.memory_monitor_task.lock().unwrap().take() {
            handle.abort();
        }
        self.clear().await;
    }

    pub async fn set(
        &self,
        key: &str,
        value: &Value,
        priority: Priority,
        ttl: Option<Duration>,
    ) -> GatewayResult<()> {
        let raw = serde_json::to_vec(value).unwrap_or_default();
        let size_bytes = raw.len();
        let (bytes, compressed) = if self.config.compression_enabled
            && size_bytes >= self.config.compression_threshold_bytes
        {
            (compression::compress(&raw, Algorithm::Deflate, 6)?, true)
        } else {
            (raw, false)
        };

        let effective_ttl = ttl
            .or_else(|| self.config.priority_ttls.get(priority))
            .unwrap_or(self.config.default_ttl);
        let expires_at = Some(Instant::now() + effective_ttl);
        let entry = CacheEntry {
            bytes,
            compressed,
            priority,
            size_bytes,
            inserted_at: Instant::now(),
            expires_at,
        };

        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.map.remove(key) {
            inner.memory_used = inner.memory_used.saturating_sub(old.size_bytes);
        }
        inner.memory_used += entry.size_bytes;
        inner.map.insert(key.to_string(), entry);
        inner.touch(key);

        while inner.map.len() > self.config.capacity {
            if inner.evict_one().is_none() {
                break;
            }
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let expired = inner
            .map
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|t| t <= now));
        if expired {
            inner.remove(key);
            inner.hit_ratio.record(false);
            return None;
        }
        let Some(entry) = inner.map.get(key) else {
            inner.hit_ratio.record(false);
            return None;
        };
        let raw = if entry.compressed {
            compression::decompress(&entry.bytes, Algorithm::Deflate).ok()?
        } else {
            entry.bytes.clone()
        };
        inner.touch(key);
        inner.hit_ratio.record(true);
        serde_json::from_slice(&raw).ok()
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.inner.lock().await.remove(key).is_some()
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.map.clear();
        inner.order.clear();
        inner.memory_used = 0;
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.map.len()
    }

    pub async fn memory_used(&self) -> usize {
        self.inner.lock().await.memory_used
    }

    pub async fn hit_ratio(&self) -> f64 {
        self.inner.lock().await.hit_ratio.ratio()
    }

    /// Bulk-loads entries, preserving each entry's own priority/TTL. Entries
    /// are inserted one at a time so capacity/memory eviction applies exactly
    /// as it would for individual `set` calls.
    pub async fn preload(
        &self,
        entries: Vec<(String, Value, Priority, Option<Duration>)>,
    ) -> GatewayResult<()> {
        for (key, value, priority, ttl) in entries {
            self.set(&key, &value, priority, ttl).await?;
        }
        Ok(())
    }
}
