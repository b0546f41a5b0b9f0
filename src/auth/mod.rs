//! Authentication, session tokens, and API-key rotation.
//!
//! Grounded on the teacher daemon's per-account rate tracker
//! (`scheduler/rate_limits.rs`'s `SlidingWindow`) for the per-client request
//! limiter, and on `ipc/mod.rs`'s `tokens_equal` for constant-time secret
//! comparison on the API key check.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::AuthConfig;
use crate::errors::{ErrorTag, GatewayResult};
use crate::protocol::Message;
use crate::sliding_window::SlidingWindow;

/// Constant-time byte comparison, used so an attacker probing the API key
/// endpoint can't learn anything from early-exit timing.
fn secure_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct ApiKeyRecord {
    key: String,
    created_at: Instant,
}

struct SessionRecord {
    client_id: String,
    expires_at: Instant,
}

/// Owns the rotating pool of valid API keys, live session tokens, and the
/// per-client request-rate limiter.
pub struct AuthService {
    config: Arc<AuthConfig>,
    api_keys: RwLock<VecDeque<ApiKeyRecord>>,
    sessions: RwLock<HashMap<String, SessionRecord>>,
    rate_limiters: Mutex<HashMap<String, SlidingWindow>>,
    rotation_task: StdMutex<Option<JoinHandle<()>>>,
}

impl AuthService {
    /// Seeds the key pool from `config.apiKeys`; each seed key is recorded as
    /// freshly minted so the first rotation doesn't immediately expire it.
    pub fn new(config: Arc<AuthConfig>) -> Arc<Self> {
        let now = Instant::now();
        let seeded: VecDeque<ApiKeyRecord> = config
            .api_keys
            .iter()
            .cloned()
            .map(|key| ApiKeyRecord {
                key,
                created_at: now,
            })
            .collect();
        Arc::new(Self {
            config,
            api_keys: RwLock::new(seeded),
            sessions: RwLock::new(HashMap::new()),
            rate_limiters: Mutex::new(HashMap::new()),
            rotation_task: StdMutex::new(None),
        })
    }

    /// Spawns the background key-rotation task. A no-op if `keyRotationInterval`
    /// is zero (rotation disabled).
    pub fn start(self: &Arc<Self>) {
        if self.config.key_rotation_interval.is_zero() {
            return;
        }
        let this = Arc::clone(self);
        let interval = self.config.key_rotation_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                this.rotate_keys().await;
            }
        });
        *self.rotation_task.lock().unwrap() = Some(handle);
    }

    pub async fn stop(&self) {
        let handle = self.rotation_task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.sessions.write().await.clear();
        self.rate_limiters.lock().await.clear();
    }

    /// Mints a new key, then retains only keys that are BOTH among the
    /// `maxKeys` most recent AND no older than `maxKeyAge` (the intersection
    /// resolved for the "what happens when maxKeys and key expiry disagree"
    /// open question — whichever constraint is stricter wins).
    pub async fn rotate_keys(&self) {
        let now = Instant::now();
        let mut keys = self.api_keys.write().await;
        keys.push_front(ApiKeyRecord {
            key: random_token(),
            created_at: now,
        });
        keys.truncate(self.config.max_keys.max(1));
        keys.retain(|rec| now.duration_since(rec.created_at) <= self.config.max_key_age);
    }

    async fn is_valid_key(&self, candidate: &str) -> bool {
        let keys = self.api_keys.read().await;
        let now = Instant::now();
        keys.iter()
            .take(self.config.max_keys.max(1))
            .filter(|rec| now.duration_since(rec.created_at) <= self.config.max_key_age)
            .any(|rec| secure_eq(&rec.key, candidate))
    }

    /// Validates `api_key` and, on success, mints a session token and returns
    /// the `AUTHENTICATED` frame to send back.
    pub async fn authenticate(&self, client_id: &str, api_key: &str) -> GatewayResult<Message> {
        if !self.is_valid_key(api_key).await {
            return Err(ErrorTag::InvalidApiKey.into());
        }
        let token = random_token();
        let expires_at = Instant::now() + self.config.session_duration;
        self.sessions.write().await.insert(
            token.clone(),
            SessionRecord {
                client_id: client_id.to_string(),
                expires_at,
            },
        );
        Ok(Message::authenticated(
            &token,
            self.config.session_duration.as_secs() as i64,
        ))
    }

    /// `true` iff the token exists and has not expired. An invalid or expired
    /// token is evicted immediately — the owning session is treated as
    /// unauthenticated from that point on rather than lingering until the
    /// next explicit `LOGOUT`.
    pub async fn validate_session(&self, token: &str) -> bool {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        match sessions.get(token) {
            Some(rec) if rec.expires_at > now => true,
            Some(_) => {
                sessions.remove(token);
                false
            }
            None => false,
        }
    }

    pub async fn logout(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }

    pub async fn session_client_id(&self, token: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(token)
            .map(|rec| rec.client_id.clone())
    }

    /// Applies the sliding-window request limit for `client_id`, lazily
    /// creating its window on first use.
    pub async fn check_rate_limit(&self, client_id: &str) -> GatewayResult<()> {
        let mut limiters = self.rate_limiters.lock().await;
        let window = limiters.entry(client_id.to_string()).or_insert_with(|| {
            SlidingWindow::new(self.config.rate_limit_window, self.config.rate_limit_max)
        });
        let now = Instant::now();
        if window.is_limited(now) {
            return Err(ErrorTag::RateLimitExceeded.into());
        }
        window.record(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<AuthConfig> {
        Arc::new(AuthConfig {
            enabled: true,
            api_keys: vec!["seed-key".to_string()],
            session_duration: Duration::from_secs(3600),
            rate_limit_window: Duration::from_secs(1),
            rate_limit_max: 2,
            key_rotation_interval: Duration::ZERO,
            max_key_age: Duration::from_secs(86400),
            max_keys: 3,
        })
    }

    #[tokio::test]
    async fn authenticate_rejects_unknown_key() {
        let svc = AuthService::new(test_config());
        let err = svc.authenticate("client-1", "bogus").await.unwrap_err();
        assert_eq!(err.tag, ErrorTag::InvalidApiKey);
    }

    #[tokio::test]
    async fn authenticate_accepts_seeded_key_and_session_validates() {
        let svc = AuthService::new(test_config());
        let msg = svc.authenticate("client-1", "seed-key").await.unwrap();
        let token = msg.data["token"].as_str().unwrap().to_string();
        assert!(svc.validate_session(&token).await);
    }

    #[tokio::test]
    async fn logout_invalidates_session() {
        let svc = AuthService::new(test_config());
        let msg = svc.authenticate("client-1", "seed-key").await.unwrap();
        let token = msg.data["token"].as_str().unwrap().to_string();
        svc.logout(&token).await;
        assert!(!svc.validate_session(&token).await);
    }

    #[tokio::test]
    async fn rate_limit_trips_after_max_requests() {
        let svc = AuthService::new(test_config());
        assert!(svc.check_rate_limit("client-1").await.is_ok());
        assert!(svc.check_rate_limit("client-1").await.is_ok());
        let err = svc.check_rate_limit("client-1").await.unwrap_err();
        assert_eq!(err.tag, ErrorTag::RateLimitExceeded);
    }

    #[tokio::test]
    async fn rotate_keys_retains_only_max_keys_most_recent() {
        let svc = AuthService::new(test_config());
        svc.rotate_keys().await;
        svc.rotate_keys().await;
        svc.rotate_keys().await;
        // seed key plus 3 rotated = 4 candidates, max_keys caps the pool at 3.
        assert_eq!(svc.api_keys.read().await.len(), 3);
    }

    #[test]
    fn secure_eq_rejects_mismatched_length() {
        assert!(!secure_eq("abc", "abcd"));
        assert!(secure_eq("abc", "abc"));
    }
}
