//! Pluggable per-message-type handler dispatch.
//!
//! Modeled on the teacher's `pub async fn handler_name(params, ctx) -> Result<Value>`
//! handler functions, generalized into a trait object so the registry can be
//! built from a plain `HashMap<Tag, Box<dyn Handler>>` instead of a method
//! match arm per type.

pub mod device;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::errors::{ErrorTag, GatewayResult};
use crate::protocol::Tag;

/// Context passed to a handler: the authenticated session's opaque client id
/// and the raw `data` payload (already schema-validated by the caller).
pub struct HandlerContext<'a> {
    pub client_id: &'a str,
    pub data: &'a Value,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext<'_>) -> GatewayResult<Value>;

    /// Called once per unique handler when a client disconnects, so handlers
    /// holding per-client state (e.g. the device adapter's connected-device
    /// set) can release it. Default is a no-op.
    async fn handle_disconnect(&self, _client_id: &str) -> GatewayResult<()> {
        Ok(())
    }
}

pub struct HandlerRegistry {
    handlers: HashMap<Tag, Box<dyn Handler>>,
    handler_timeout: Duration,
}

impl HandlerRegistry {
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            handler_timeout,
        }
    }

    pub fn register(&mut self, tag: Tag, handler: Box<dyn Handler>) {
        self.handlers.insert(tag, handler);
    }

    /// Dispatches to the registered handler for `tag`. A handler that doesn't
    /// return within `handlerTimeout` is abandoned and reported as
    /// `PROCESSING_ERROR`.
    pub async fn dispatch(&self, tag: Tag, client_id: &str, data: &Value) -> GatewayResult<Value> {
        let Some(handler) = self.handlers.get(&tag) else {
            return Err(ErrorTag::InvalidMessageType.into());
        };
        let ctx = HandlerContext { client_id, data };
        match tokio::time::timeout(self.handler_timeout, handler.handle(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ErrorTag::ProcessingError.into()),
        }
    }

    /// Invokes `handle_disconnect` on every *unique* registered handler
    /// (the same `Box<dyn Handler>` may be registered under several tags),
    /// deduplicating by trait-object identity. Every failure is logged;
    /// the first one encountered is returned to the caller.
    pub async fn dispatch_disconnect(&self, client_id: &str) -> GatewayResult<()> {
        let mut seen = HashSet::new();
        let mut first_err = None;
        for handler in self.handlers.values() {
            let identity = &**handler as *const dyn Handler as *const () as usize;
            if !seen.insert(identity) {
                continue;
            }
            if let Err(e) = handler.handle_disconnect(client_id).await {
                warn!(client_id, err = %e, "handler disconnect hook failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, ctx: HandlerContext<'_>) -> GatewayResult<Value> {
            Ok(ctx.data.clone())
        }
    }

    struct Hangs;

    #[async_trait]
    impl Handler for Hangs {
        async fn handle(&self, _ctx: HandlerContext<'_>) -> GatewayResult<Value> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let mut registry = HandlerRegistry::new(Duration::from_secs(1));
        registry.register(Tag::Connect, Box::new(Echo));
        let result = registry
            .dispatch(Tag::Connect, "client-1", &json!({"deviceId": "d1"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"deviceId": "d1"}));
    }

    #[tokio::test]
    async fn unregistered_tag_is_invalid_message_type() {
        let registry = HandlerRegistry::new(Duration::from_secs(1));
        let err = registry
            .dispatch(Tag::Connect, "client-1", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.tag, ErrorTag::InvalidMessageType);
    }

    struct CountsDisconnects(std::sync::Arc<std::sync::atomic::AtomicUsize>);

    #[async_trait]
    impl Handler for CountsDisconnects {
        async fn handle(&self, ctx: HandlerContext<'_>) -> GatewayResult<Value> {
            Ok(ctx.data.clone())
        }

        async fn handle_disconnect(&self, _client_id: &str) -> GatewayResult<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_disconnect_invokes_every_registered_handler() {
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new(Duration::from_secs(1));
        registry.register(Tag::Connect, Box::new(CountsDisconnects(counter.clone())));
        registry.register(Tag::Disconnect, Box::new(CountsDisconnects(counter.clone())));
        registry.dispatch_disconnect("client-1").await.unwrap();
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abandoned_handler_reports_processing_error() {
        let mut registry = HandlerRegistry::new(Duration::from_millis(10));
        registry.register(Tag::Connect, Box::new(Hangs));
        let err = registry
            .dispatch(Tag::Connect, "client-1", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.tag, ErrorTag::ProcessingError);
    }
}
