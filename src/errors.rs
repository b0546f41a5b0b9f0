//! The gateway's closed error taxonomy.
//!
//! Internal subsystems never propagate raw exceptions across the session
//! boundary — they return one of these typed codes, and the ingress pipeline
//! (see `server::dispatch_frame`) is the single place that turns a code into
//! an `ERROR` frame on the wire.

use serde::{Deserialize, Serialize};

/// One entry per wire-visible error code. `Display`/`Serialize` render the
/// exact `SCREAMING_CASE` string clients match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorTag {
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("session expired")]
    SessionExpired,
    #[error("invalid token")]
    InvalidToken,
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("authentication error")]
    AuthError,
    #[error("invalid message")]
    InvalidMessage,
    #[error("invalid message type")]
    InvalidMessageType,
    #[error("message too large")]
    MessageTooLarge,
    #[error("queue full")]
    QueueFull,
    #[error("processing error")]
    ProcessingError,
    #[error("connection limit reached")]
    ConnectionLimitReached,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection error")]
    ConnectionError,
    #[error("scan already active")]
    ScanAlreadyActive,
    #[error("scan not active")]
    ScanNotActive,
    #[error("device not found")]
    DeviceNotFound,
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("invalid params")]
    InvalidParams,
    #[error("operation failed")]
    OperationFailed,
    #[error("BLE adapter not available")]
    BleNotAvailable,
}

impl ErrorTag {
    /// The four error bands from the propagation policy (§7). Used only for
    /// metrics classification — the wire format is always just `code`.
    pub fn band(self) -> ErrorBand {
        use ErrorTag::*;
        match self {
            ConnectionLimitReached | MessageTooLarge | RateLimitExceeded => ErrorBand::Admission,
            InvalidMessage | InvalidMessageType | InvalidParams | ScanAlreadyActive | ScanNotActive
            | DeviceNotFound | AlreadyConnected | NotConnected => ErrorBand::Protocol,
            InvalidApiKey | InvalidToken | SessionExpired | NotAuthenticated | AuthError => {
                ErrorBand::Auth
            }
            _ => ErrorBand::Operational,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorTag::InvalidApiKey => "INVALID_API_KEY",
            ErrorTag::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorTag::SessionExpired => "SESSION_EXPIRED",
            ErrorTag::InvalidToken => "INVALID_TOKEN",
            ErrorTag::NotAuthenticated => "NOT_AUTHENTICATED",
            ErrorTag::AuthError => "AUTH_ERROR",
            ErrorTag::InvalidMessage => "INVALID_MESSAGE",
            ErrorTag::InvalidMessageType => "INVALID_MESSAGE_TYPE",
            ErrorTag::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorTag::QueueFull => "QUEUE_FULL",
            ErrorTag::ProcessingError => "PROCESSING_ERROR",
            ErrorTag::ConnectionLimitReached => "CONNECTION_LIMIT_REACHED",
            ErrorTag::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorTag::ConnectionError => "CONNECTION_ERROR",
            ErrorTag::ScanAlreadyActive => "SCAN_ALREADY_ACTIVE",
            ErrorTag::ScanNotActive => "SCAN_NOT_ACTIVE",
            ErrorTag::DeviceNotFound => "DEVICE_NOT_FOUND",
            ErrorTag::AlreadyConnected => "ALREADY_CONNECTED",
            ErrorTag::NotConnected => "NOT_CONNECTED",
            ErrorTag::InvalidParams => "INVALID_PARAMS",
            ErrorTag::OperationFailed => "OPERATION_FAILED",
            ErrorTag::BleNotAvailable => "BLE_NOT_AVAILABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorBand {
    Admission,
    Protocol,
    Auth,
    Operational,
}

/// A typed gateway error carrying the wire code plus a human-readable detail
/// string. Handlers and subsystems return this instead of `anyhow::Error`;
/// the server maps it 1:1 onto an `ERROR` frame.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{tag}: {detail}")]
pub struct GatewayError {
    pub tag: ErrorTag,
    pub detail: String,
}

impl GatewayError {
    pub fn new(tag: ErrorTag, detail: impl Into<String>) -> Self {
        Self {
            tag,
            detail: detail.into(),
        }
    }
}

impl From<ErrorTag> for GatewayError {
    fn from(tag: ErrorTag) -> Self {
        Self {
            detail: tag.to_string(),
            tag,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
