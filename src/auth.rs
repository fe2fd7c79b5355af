use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::debug;

pub const AUTH_COOKIE: &str = "auth_token";
const TOKEN_BYTES: usize = 32;
/// Upper bound on session lifetime; keeps expiry arithmetic in range.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub username: String,
    pub expires_at: Instant,
}

/// Opaque bearer token -> identity with sliding expiry. Process-local.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, SessionRecord>>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ttl: ttl.min(MAX_SESSION_TTL),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn create(&self, username: &str) -> String {
        let token = new_token();
        let record = SessionRecord {
            username: username.to_string(),
            expires_at: Instant::now() + self.ttl,
        };
        self.sessions.lock().await.insert(token.clone(), record);
        debug!("Created session for {}", username);
        token
    }

    /// Returns the session's user and extends its expiry. Expired records are
    /// removed here.
    pub async fn touch(&self, token: &str) -> Option<String> {
        let mut sessions = self.sessions.lock().await;
        let now = Instant::now();
        let record = sessions.get_mut(token)?;
        if record.expires_at < now {
            sessions.remove(token);
            return None;
        }
        record.expires_at = now + self.ttl;
        Some(record.username.clone())
    }

    pub async fn remove(&self, token: &str) {
        self.sessions.lock().await.remove(token);
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

fn new_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == AUTH_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

pub fn session_cookie(token: &str, ttl: Duration) -> String {
    format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}",
        AUTH_COOKIE,
        token,
        ttl.as_secs()
    )
}

pub fn cleared_cookie() -> String {
    format!("{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0", AUTH_COOKIE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_create_and_touch() {
        let store = SessionStore::new(Duration::from_secs(60));
        let token = store.create("alice").await;

        assert_eq!(token.len(), 43);
        assert_eq!(store.touch(&token).await.as_deref(), Some("alice"));
        assert_eq!(store.touch("unknown").await, None);
    }

    #[tokio::test]
    async fn test_expired_sessions_are_dropped() {
        let store = SessionStore::new(Duration::from_millis(10));
        let token = store.create("bob").await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.touch(&token).await, None);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_touch_slides_expiry() {
        let store = SessionStore::new(Duration::from_millis(80));
        let token = store.create("carol").await;
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(store.touch(&token).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_huge_ttl_is_clamped() {
        let store = SessionStore::new(Duration::MAX);
        assert_eq!(store.ttl(), MAX_SESSION_TTL);

        let token = store.create("erin").await;
        assert_eq!(store.touch(&token).await.as_deref(), Some("erin"));
    }

    #[tokio::test]
    async fn test_remove() {
        let store = SessionStore::new(Duration::from_secs(60));
        let token = store.create("dave").await;
        store.remove(&token).await;
        assert_eq!(store.touch(&token).await, None);
    }

    #[test]
    fn test_token_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; auth_token=abc123; other=1"),
        );
        assert_eq!(token_from_headers(&headers).as_deref(), Some("abc123"));

        let mut empty = HeaderMap::new();
        empty.insert(header::COOKIE, HeaderValue::from_static("auth_token="));
        assert_eq!(token_from_headers(&empty), None);
        assert_eq!(token_from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn test_cookie_strings() {
        let cookie = session_cookie("tok", Duration::from_secs(10));
        assert_eq!(cookie, "auth_token=tok; HttpOnly; SameSite=Lax; Path=/; Max-Age=10");
        assert!(cleared_cookie().contains("Max-Age=0"));
    }
}
