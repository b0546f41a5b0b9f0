//! End-to-end scenarios driven over a real WebSocket connection against a
//! `Server` bound to an OS-assigned loopback port.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mcp_gateway::compression::Algorithm;
use mcp_gateway::config::{
    AuthConfig, BatchingConfig, CacheConfig, CircuitBreakerSettings, CompressionSettings,
    GatewayConfig, LoggingConfig, MemoryMonitoring, PriorityThresholds, PriorityTimeouts,
    PriorityTtls, ServerConfig,
};
use mcp_gateway::server::Server;
use mcp_gateway::GatewayContext;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

fn test_timeouts() -> PriorityTimeouts {
    PriorityTimeouts {
        high: Duration::from_millis(50),
        medium: Duration::from_millis(100),
        low: Duration::from_millis(200),
    }
}

fn test_compression() -> CompressionSettings {
    CompressionSettings {
        enabled: true,
        min_size: 1024,
        level: 6,
        algorithm: Algorithm::Gzip,
        priority_thresholds: PriorityThresholds {
            high: 512,
            medium: 1024,
            low: 2048,
        },
    }
}

fn test_memory_monitoring() -> MemoryMonitoring {
    MemoryMonitoring {
        enabled: true,
        check_interval: Duration::from_secs(30),
        warning_threshold_bytes: 80 * 1024 * 1024,
        max_memory_bytes: 100 * 1024 * 1024,
    }
}

fn test_config(api_keys: Vec<&str>) -> GatewayConfig {
    GatewayConfig {
        server: ServerConfig {
            port: 0,
            max_connections: 10,
            message_queue_size: 100,
            max_message_size: 1024,
            handler_timeout: Duration::from_secs(2),
        },
        auth: AuthConfig {
            enabled: true,
            api_keys: api_keys.into_iter().map(String::from).collect(),
            session_duration: Duration::from_secs(3600),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max: 5,
            key_rotation_interval: Duration::ZERO,
            max_key_age: Duration::from_secs(86_400),
            max_keys: 5,
        },
        batching: BatchingConfig {
            batch_size: 50,
            batch_timeout: Duration::from_secs(60),
            max_queue_size: 100,
            analytics_interval: Duration::from_secs(60),
            timeouts: test_timeouts(),
            compression: test_compression(),
        },
        cache: CacheConfig {
            capacity: 100,
            default_ttl: Duration::from_secs(60),
            compression_enabled: true,
            compression_threshold_bytes: 1024,
            invalidation_interval: Duration::from_secs(60),
            priority_ttls: PriorityTtls::default(),
            memory_monitoring: test_memory_monitoring(),
        },
        circuit_breaker: CircuitBreakerSettings {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(1),
            half_open_limit: 1,
        },
        logging: LoggingConfig { level: "error".into() },
    }
}

/// Spawns a gateway on an ephemeral port and returns its `ws://` URL.
async fn spawn_gateway(config: GatewayConfig) -> String {
    let ctx = GatewayContext::new(config);
    ctx.start();
    let server = Server::new(ctx);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        server.serve(listener).await.ok();
    });
    format!("ws://{addr}")
}

async fn connect(url: &str) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn recv_json(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Value {
    loop {
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn s1_ack_on_connect() {
    let url = spawn_gateway(test_config(vec!["K"])).await;
    let mut ws = connect(&url).await;

    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "CONNECTION_ACK");
    assert!(ack["data"]["clientId"].is_string());
}

#[tokio::test]
async fn s2_bad_key_is_rejected() {
    let url = spawn_gateway(test_config(vec!["K"])).await;
    let mut ws = connect(&url).await;
    recv_json(&mut ws).await; // CONNECTION_ACK

    ws.send(WsMessage::Text(json!({"type": "AUTHENTICATE", "data": {"apiKey": "X"}}).to_string()))
        .await
        .unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "ERROR");
    assert_eq!(reply["code"], "INVALID_API_KEY");
}

#[tokio::test]
async fn s3_good_key_then_characteristic_read() {
    let url = spawn_gateway(test_config(vec!["K"])).await;
    let mut ws = connect(&url).await;
    recv_json(&mut ws).await; // CONNECTION_ACK

    ws.send(WsMessage::Text(json!({"type": "AUTHENTICATE", "data": {"apiKey": "K"}}).to_string()))
        .await
        .unwrap();
    let auth_reply = recv_json(&mut ws).await;
    assert_eq!(auth_reply["type"], "AUTHENTICATED");
    assert!(auth_reply["data"]["token"].is_string());

    ws.send(WsMessage::Text(json!({"type": "CONNECT", "data": {"deviceId": "device-1"}}).to_string()))
        .await
        .unwrap();
    let batch = recv_json(&mut ws).await;
    assert_eq!(batch["type"], "BATCH");

    ws.send(WsMessage::Text(
        json!({
            "type": "CHARACTERISTIC_READ",
            "data": {"deviceId": "device-1", "serviceUuid": "s1", "characteristicUuid": "c1"},
        })
        .to_string(),
    ))
    .await
    .unwrap();
    let batch = recv_json(&mut ws).await;
    assert_eq!(batch["type"], "BATCH");
    assert_eq!(batch["data"]["count"], json!(1));
}

#[tokio::test]
async fn s4_oversize_message_is_rejected_but_session_continues() {
    let url = spawn_gateway(test_config(vec!["K"])).await;
    let mut ws = connect(&url).await;
    recv_json(&mut ws).await; // CONNECTION_ACK

    let oversized = "x".repeat(2048);
    ws.send(WsMessage::Text(
        json!({"type": "AUTHENTICATE", "data": {"apiKey": "K", "padding": oversized}}).to_string(),
    ))
    .await
    .unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "ERROR");
    assert_eq!(reply["code"], "MESSAGE_TOO_LARGE");

    // session still usable afterwards
    ws.send(WsMessage::Text(json!({"type": "AUTHENTICATE", "data": {"apiKey": "K"}}).to_string()))
        .await
        .unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "AUTHENTICATED");
}

#[tokio::test]
async fn s5_rate_limit_then_close() {
    let mut config = test_config(vec!["K"]);
    config.auth.rate_limit_window = Duration::from_secs(60);
    config.auth.rate_limit_max = 5;
    let url = spawn_gateway(config).await;
    let mut ws = connect(&url).await;
    recv_json(&mut ws).await; // CONNECTION_ACK

    for _ in 0..5 {
        ws.send(WsMessage::Text(json!({"type": "AUTHENTICATE", "data": {"apiKey": "bogus"}}).to_string()))
            .await
            .unwrap();
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["code"], "INVALID_API_KEY");
    }

    ws.send(WsMessage::Text(json!({"type": "AUTHENTICATE", "data": {"apiKey": "bogus"}}).to_string()))
        .await
        .unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["code"], "RATE_LIMIT_EXCEEDED");

    // connection should be closed by the server right after
    let outcome = ws.next().await;
    assert!(matches!(outcome, None | Some(Ok(WsMessage::Close(_)))));
}

#[tokio::test]
async fn s6_batch_groups_same_priority_messages() {
    use mcp_gateway::batcher::Batcher;
    use mcp_gateway::protocol::Priority;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    let config = Arc::new(BatchingConfig {
        batch_size: 5,
        batch_timeout: Duration::from_millis(100),
        max_queue_size: 100,
        analytics_interval: Duration::from_secs(60),
        timeouts: test_timeouts(),
        compression: test_compression(),
    });
    let batcher = Batcher::new(config);
    let (tx, mut rx) = mpsc::channel(16);
    batcher.register_client("c1", tx).await;

    for i in 0..3 {
        batcher.add_message("c1", Priority::Medium, json!(i)).await.unwrap();
    }

    let batch = tokio::time::timeout(Duration::from_millis(500), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.data["count"], json!(3));
    assert_eq!(batch.data["priority"], json!("medium"));
}

#[tokio::test]
async fn s7_cache_evicts_lowest_priority_first() {
    use mcp_gateway::cache::Cache;
    use mcp_gateway::protocol::Priority;
    use std::sync::Arc;

    let cache = Cache::new(Arc::new(CacheConfig {
        capacity: 2,
        default_ttl: Duration::from_secs(60),
        compression_enabled: false,
        compression_threshold_bytes: 1024,
        invalidation_interval: Duration::from_secs(60),
        priority_ttls: PriorityTtls::default(),
        memory_monitoring: test_memory_monitoring(),
    }));

    cache.set("a", &json!(1), Priority::Low, None).await.unwrap();
    cache.set("b", &json!(2), Priority::Low, None).await.unwrap();
    cache.set("c", &json!(3), Priority::High, None).await.unwrap();

    assert_eq!(cache.get("a").await, None);
    assert_eq!(cache.get("b").await, Some(json!(2)));
    assert_eq!(cache.get("c").await, Some(json!(3)));
}

#[tokio::test]
async fn s8_circuit_breaker_opens_then_half_opens() {
    use mcp_gateway::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 3,
        reset_timeout: Duration::from_millis(200),
        half_open_limit: 1,
    });
    let endpoint = "device-adapter";

    for _ in 0..3 {
        breaker.record_failure(endpoint).await;
    }
    assert_eq!(breaker.state(endpoint).await, CircuitState::Open);
    assert!(!breaker.is_allowed(endpoint).await);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(breaker.is_allowed(endpoint).await);
    assert_eq!(breaker.state(endpoint).await, CircuitState::HalfOpen);

    breaker.record_success(endpoint).await;
    assert_eq!(breaker.state(endpoint).await, CircuitState::Closed);
}
