pub mod auth;
pub mod batcher;
pub mod cache;
pub mod circuit_breaker;
pub mod compression;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod sliding_window;
pub mod validator;

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use auth::AuthService;
use batcher::Batcher;
use cache::Cache;
use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use config::GatewayConfig;
use handlers::device::{
    CharacteristicReadHandler, CharacteristicWriteHandler, ConnectHandler, DeviceAdapterState,
    DisconnectHandler, StartScanHandler, StopScanHandler,
};
use handlers::HandlerRegistry;
use metrics::Metrics;
use protocol::Tag;
use validator::Validator;

/// Shared state handed to the server and every handler/background task.
pub struct GatewayContext {
    pub config: Arc<GatewayConfig>,
    pub auth: Arc<AuthService>,
    pub validator: Arc<Validator>,
    pub cache: Arc<Cache>,
    pub batcher: Arc<Batcher>,
    pub handlers: Arc<HandlerRegistry>,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
}

impl GatewayContext {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker.failure_threshold,
            reset_timeout: config.circuit_breaker.reset_timeout,
            half_open_limit: config.circuit_breaker.half_open_limit,
        }));
        let device_state = Arc::new(DeviceAdapterState::new(breaker));

        let mut registry = HandlerRegistry::new(config.server.handler_timeout);
        registry.register(Tag::StartScan, Box::new(StartScanHandler { state: device_state.clone() }));
        registry.register(Tag::StopScan, Box::new(StopScanHandler { state: device_state.clone() }));
        registry.register(Tag::Connect, Box::new(ConnectHandler { state: device_state.clone() }));
        registry.register(Tag::Disconnect, Box::new(DisconnectHandler { state: device_state.clone() }));
        registry.register(Tag::CharacteristicRead, Box::new(CharacteristicReadHandler { state: device_state.clone() }));
        registry.register(Tag::CharacteristicWrite, Box::new(CharacteristicWriteHandler { state: device_state }));

        Arc::new(Self {
            auth: AuthService::new(Arc::new(config.auth.clone())),
            validator: Arc::new(Validator::new(config.cache.capacity.min(1000))),
            cache: Cache::new(Arc::new(config.cache.clone())),
            batcher: Batcher::new(Arc::new(config.batching.clone())),
            handlers: Arc::new(registry),
            metrics: Metrics::new(),
            started_at: Instant::now(),
            config,
        })
    }

    /// Starts the background tasks owned by each subsystem: API-key
    /// rotation, cache invalidation sweeps, and the metrics reporter.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.auth.start();
        self.cache.start();
        self.metrics.spawn_reporter(self.config.batching.analytics_interval)
    }

    /// Stops every background task and drops in-flight per-client state.
    pub async fn stop(&self) {
        self.auth.stop().await;
        self.cache.stop().await;
        let dropped = self.batcher.stop().await;
        if dropped > 0 {
            tracing::info!(dropped, "dropped queued messages during shutdown");
        }
    }
}
