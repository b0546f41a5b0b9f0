//! Canonical message types and wire framing for the MCP gateway protocol.
//!
//! A frame is a single UTF-8 JSON object `{"type":Tag,"data":...,"timestamp":T}`.
//! This module owns the closed `Tag` set, the `Message` envelope, and the
//! helpers the server uses to build `ERROR`/`CONNECTION_ACK`/`BATCH` frames.

pub mod schema;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ErrorTag;

/// The closed set of message types. Unknown strings deserialize to `Other`
/// so the server can still classify the frame as `INVALID_MESSAGE_TYPE`
/// instead of failing JSON decode outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tag {
    Authenticate,
    Authenticated,
    SessionValid,
    Logout,
    LoggedOut,
    StartScan,
    StopScan,
    DeviceFound,
    Connect,
    Disconnect,
    CharacteristicRead,
    CharacteristicWrite,
    ConnectionAck,
    Batch,
    Error,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Authenticate => "AUTHENTICATE",
            Tag::Authenticated => "AUTHENTICATED",
            Tag::SessionValid => "SESSION_VALID",
            Tag::Logout => "LOGOUT",
            Tag::LoggedOut => "LOGGED_OUT",
            Tag::StartScan => "START_SCAN",
            Tag::StopScan => "STOP_SCAN",
            Tag::DeviceFound => "DEVICE_FOUND",
            Tag::Connect => "CONNECT",
            Tag::Disconnect => "DISCONNECT",
            Tag::CharacteristicRead => "CHARACTERISTIC_READ",
            Tag::CharacteristicWrite => "CHARACTERISTIC_WRITE",
            Tag::ConnectionAck => "CONNECTION_ACK",
            Tag::Batch => "BATCH",
            Tag::Error => "ERROR",
        }
    }

    /// Parse a raw `type` string from an incoming frame. Returns `None` for
    /// anything outside the closed set (including a missing/empty string) —
    /// the caller maps that to `INVALID_MESSAGE_TYPE`.
    pub fn parse(raw: &str) -> Option<Tag> {
        Some(match raw {
            "AUTHENTICATE" => Tag::Authenticate,
            "AUTHENTICATED" => Tag::Authenticated,
            "SESSION_VALID" => Tag::SessionValid,
            "LOGOUT" => Tag::Logout,
            "LOGGED_OUT" => Tag::LoggedOut,
            "START_SCAN" => Tag::StartScan,
            "STOP_SCAN" => Tag::StopScan,
            "DEVICE_FOUND" => Tag::DeviceFound,
            "CONNECT" => Tag::Connect,
            "DISCONNECT" => Tag::Disconnect,
            "CHARACTERISTIC_READ" => Tag::CharacteristicRead,
            "CHARACTERISTIC_WRITE" => Tag::CharacteristicWrite,
            "CONNECTION_ACK" => Tag::ConnectionAck,
            "BATCH" => Tag::Batch,
            "ERROR" => Tag::Error,
            _ => return None,
        })
    }
}

/// Priority ordinal governing batching and cache-eviction order.
/// `Ord` follows declaration order: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    pub const BATCHABLE: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];
}

/// A raw inbound frame as deserialized straight off the wire, before the
/// `type` string has been checked against the closed `Tag` set.
#[derive(Debug, Deserialize)]
pub struct RawFrame {
    #[serde(rename = "type")]
    pub type_: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// A fully-typed outbound (or validated inbound) message.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub data: Value,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    /// Informational only (§9 open question) — never asserted on by tests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Message {
    pub fn new(tag: Tag, data: Value) -> Self {
        Self {
            type_: tag.as_str(),
            data,
            timestamp: now_millis(),
            code: None,
            message: None,
        }
    }

    pub fn connection_ack(client_id: &str) -> Self {
        Self::new(Tag::ConnectionAck, serde_json::json!({ "clientId": client_id }))
    }

    pub fn authenticated(token: &str, expires_in_secs: i64) -> Self {
        Self::new(
            Tag::Authenticated,
            serde_json::json!({ "token": token, "expiresIn": expires_in_secs }),
        )
    }

    pub fn error(tag: ErrorTag, detail: impl Into<String>) -> Self {
        Self {
            type_: Tag::Error.as_str(),
            data: Value::Null,
            timestamp: now_millis(),
            code: Some(tag.as_str()),
            message: Some(detail.into()),
        }
    }

    pub fn to_json_string(&self) -> String {
        // ERROR frames carry `code` + `message` at the top level rather than
        // nested under `data`, matching the wire contract in §6.
        if self.type_ == Tag::Error.as_str() {
            serde_json::json!({
                "type": self.type_,
                "code": self.code,
                "message": self.message.clone().unwrap_or_default(),
                "timestamp": self.timestamp,
            })
            .to_string()
        } else {
            serde_json::to_string(self).unwrap_or_default()
        }
    }
}

pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
