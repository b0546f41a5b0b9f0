//! Stub BLE device-adapter handlers.
//!
//! The real device bridge (talking to an actual Bluetooth stack) is out of
//! scope; these handlers track just enough in-memory, per-client state —
//! which clients are scanning, which devices each client has connected to —
//! to exercise the protocol's scan/connect/characteristic operations and
//! their documented error cases end to end. Every call into the adapter is
//! gated by a [`CircuitBreaker`] endpoint keyed on `"adapter"` for the
//! scan operations or on `deviceId` for per-device operations, so a
//! persistently failing device or adapter fails fast instead of being
//! retried by every handler call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::circuit_breaker::CircuitBreaker;
use crate::errors::{ErrorBand, ErrorTag, GatewayResult};
use crate::handlers::{Handler, HandlerContext};

/// Devices the stub adapter will report as discoverable/connectable.
const KNOWN_DEVICES: &[&str] = &["device-1", "device-2", "device-3"];

/// Fixed endpoint id the circuit breaker uses for adapter-wide operations
/// (start/stop scan) that aren't addressed at one particular device.
const ADAPTER_ENDPOINT: &str = "adapter";

fn required_str<'a>(data: &'a Value, field: &str) -> GatewayResult<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| crate::errors::GatewayError::new(ErrorTag::InvalidParams, format!("missing \"{field}\"")))
}

/// Records a result against the breaker for `endpoint`: an `Operational`
/// failure (a real upstream problem, not a protocol-level rejection like
/// `DeviceNotFound`/`AlreadyConnected`) trips the breaker, while admission
/// is always recorded as a success after passing the gate.
async fn guard<F, Fut>(breaker: &CircuitBreaker, endpoint: &str, call: F) -> GatewayResult<Value>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = GatewayResult<Value>>,
{
    if !breaker.is_allowed(endpoint).await {
        return Err(ErrorTag::BleNotAvailable.into());
    }
    match call().await {
        Ok(value) => {
            breaker.record_success(endpoint).await;
            Ok(value)
        }
        Err(e) => {
            if e.tag.band() == ErrorBand::Operational {
                breaker.record_failure(endpoint).await;
            }
            Err(e)
        }
    }
}

pub struct DeviceAdapterState {
    /// Client ids currently scanning.
    scanning: Mutex<HashSet<String>>,
    /// Client id -> set of device ids that client has connected to.
    connected: Mutex<HashMap<String, HashSet<String>>>,
    breaker: Arc<CircuitBreaker>,
}

impl DeviceAdapterState {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            scanning: Mutex::new(HashSet::new()),
            connected: Mutex::new(HashMap::new()),
            breaker,
        }
    }

    fn is_connected(&self, client_id: &str, device_id: &str) -> bool {
        self.connected
            .lock()
            .unwrap()
            .get(client_id)
            .is_some_and(|devices| devices.contains(device_id))
    }

    /// Releases every resource a disconnecting client held: stops counting
    /// it as scanning and drops its connected-device set.
    pub fn release_client(&self, client_id: &str) {
        self.scanning.lock().unwrap().remove(client_id);
        self.connected.lock().unwrap().remove(client_id);
    }
}

pub struct StartScanHandler {
    pub state: Arc<DeviceAdapterState>,
}

#[async_trait]
impl Handler for StartScanHandler {
    async fn handle(&self, ctx: HandlerContext<'_>) -> GatewayResult<Value> {
        let state = &self.state;
        let client_id = ctx.client_id.to_string();
        guard(&state.breaker, ADAPTER_ENDPOINT, || async move {
            let mut scanning = state.scanning.lock().unwrap();
            if scanning.contains(&client_id) {
                return Err(ErrorTag::ScanAlreadyActive.into());
            }
            scanning.insert(client_id);
            Ok(json!({ "scanning": true }))
        })
        .await
    }

    async fn handle_disconnect(&self, client_id: &str) -> GatewayResult<()> {
        self.state.release_client(client_id);
        Ok(())
    }
}

pub struct StopScanHandler {
    pub state: Arc<DeviceAdapterState>,
}

#[async_trait]
impl Handler for StopScanHandler {
    async fn handle(&self, ctx: HandlerContext<'_>) -> GatewayResult<Value> {
        let state = &self.state;
        let client_id = ctx.client_id.to_string();
        guard(&state.breaker, ADAPTER_ENDPOINT, || async move {
            let mut scanning = state.scanning.lock().unwrap();
            if !scanning.remove(&client_id) {
                return Err(ErrorTag::ScanNotActive.into());
            }
            Ok(json!({ "scanning": false }))
        })
        .await
    }

    async fn handle_disconnect(&self, client_id: &str) -> GatewayResult<()> {
        self.state.release_client(client_id);
        Ok(())
    }
}

pub struct ConnectHandler {
    pub state: Arc<DeviceAdapterState>,
}

#[async_trait]
impl Handler for ConnectHandler {
    async fn handle(&self, ctx: HandlerContext<'_>) -> GatewayResult<Value> {
        let device_id = required_str(ctx.data, "deviceId")?.to_string();
        let state = &self.state;
        let client_id = ctx.client_id.to_string();
        guard(&state.breaker, &device_id.clone(), || async move {
            if !KNOWN_DEVICES.contains(&device_id.as_str()) {
                return Err(ErrorTag::DeviceNotFound.into());
            }
            let mut connected = state.connected.lock().unwrap();
            let devices = connected.entry(client_id).or_default();
            if !devices.insert(device_id.clone()) {
                return Err(ErrorTag::AlreadyConnected.into());
            }
            Ok(json!({ "deviceId": device_id, "connected": true }))
        })
        .await
    }

    async fn handle_disconnect(&self, client_id: &str) -> GatewayResult<()> {
        self.state.release_client(client_id);
        Ok(())
    }
}

pub struct DisconnectHandler {
    pub state: Arc<DeviceAdapterState>,
}

#[async_trait]
impl Handler for DisconnectHandler {
    async fn handle(&self, ctx: HandlerContext<'_>) -> GatewayResult<Value> {
        let device_id = required_str(ctx.data, "deviceId")?.to_string();
        let state = &self.state;
        let client_id = ctx.client_id.to_string();
        guard(&state.breaker, &device_id.clone(), || async move {
            let mut connected = state.connected.lock().unwrap();
            let removed = connected.get_mut(&client_id).is_some_and(|devices| devices.remove(&device_id));
            if !removed {
                return Err(ErrorTag::NotConnected.into());
            }
            Ok(json!({ "deviceId": device_id, "connected": false }))
        })
        .await
    }

    async fn handle_disconnect(&self, client_id: &str) -> GatewayResult<()> {
        self.state.release_client(client_id);
        Ok(())
    }
}

pub struct CharacteristicReadHandler {
    pub state: Arc<DeviceAdapterState>,
}

#[async_trait]
impl Handler for CharacteristicReadHandler {
    async fn handle(&self, ctx: HandlerContext<'_>) -> GatewayResult<Value> {
        let device_id = required_str(ctx.data, "deviceId")?.to_string();
        let service_uuid = required_str(ctx.data, "serviceUuid")?.to_string();
        let characteristic_uuid = required_str(ctx.data, "characteristicUuid")?.to_string();
        let state = &self.state;
        let client_id = ctx.client_id.to_string();
        guard(&state.breaker, &device_id.clone(), || async move {
            if !state.is_connected(&client_id, &device_id) {
                return Err(ErrorTag::NotConnected.into());
            }
            Ok(json!({
                "deviceId": device_id,
                "serviceUuid": service_uuid,
                "characteristicUuid": characteristic_uuid,
                "value": "00",
            }))
        })
        .await
    }

    async fn handle_disconnect(&self, client_id: &str) -> GatewayResult<()> {
        self.state.release_client(client_id);
        Ok(())
    }
}

pub struct CharacteristicWriteHandler {
    pub state: Arc<DeviceAdapterState>,
}

#[async_trait]
impl Handler for CharacteristicWriteHandler {
    async fn handle(&self, ctx: HandlerContext<'_>) -> GatewayResult<Value> {
        let device_id = required_str(ctx.data, "deviceId")?.to_string();
        let service_uuid = required_str(ctx.data, "serviceUuid")?.to_string();
        let characteristic_uuid = required_str(ctx.data, "characteristicUuid")?.to_string();
        let _value = required_str(ctx.data, "value")?;
        let state = &self.state;
        let client_id = ctx.client_id.to_string();
        guard(&state.breaker, &device_id.clone(), || async move {
            if !state.is_connected(&client_id, &device_id) {
                return Err(ErrorTag::NotConnected.into());
            }
            Ok(json!({
                "deviceId": device_id,
                "serviceUuid": service_uuid,
                "characteristicUuid": characteristic_uuid,
                "written": true,
            }))
        })
        .await
    }

    async fn handle_disconnect(&self, client_id: &str) -> GatewayResult<()> {
        self.state.release_client(client_id);
        Ok(())
    }
}
