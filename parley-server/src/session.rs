//! Cookie-session store: opaque token → authenticated username.
//!
//! Sessions expire a fixed duration after issuance. The store is the single
//! owner of session records; the relay and the HTTP layer only resolve
//! tokens through [`SessionStore::lookup`]. Expired entries are treated as
//! absent and removed on observation; a periodic sweep clears the rest.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Cookie carrying the session token on both the HTTP surface and the
/// WebSocket handshake.
pub const SESSION_COOKIE: &str = "cpen322-session";

#[derive(Debug, Clone)]
struct SessionRecord {
    username: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh token bound to `username`, valid for `max_age`.
    pub fn create(&self, username: &str, max_age: Duration) -> String {
        let token = generate_token();
        self.sessions.lock().insert(
            token.clone(),
            SessionRecord {
                username: username.to_string(),
                expires_at: Instant::now() + max_age,
            },
        );
        token
    }

    /// Resolve a token to its username. Unknown or expired tokens yield
    /// `None`; an expired entry is evicted on the spot.
    pub fn lookup(&self, token: &str) -> Option<String> {
        let mut sessions = self.sessions.lock();
        match sessions.get(token) {
            Some(record) if record.expires_at > Instant::now() => Some(record.username.clone()),
            Some(_) => {
                sessions.remove(token);
                None
            }
            None => None,
        }
    }

    /// Destroy a session (logout).
    pub fn delete(&self, token: &str) {
        self.sessions.lock().remove(token);
    }

    /// Evict all expired sessions. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, record| record.expires_at > now);
        before - sessions.len()
    }
}

/// 30 random bytes, hex-encoded.
fn generate_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 30];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Extract a named cookie's value from a `Cookie` request header.
pub fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').map(str::trim).find_map(|part| {
        part.strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_lookup() {
        let store = SessionStore::new();
        let token = store.create("alice", Duration::from_secs(60));
        assert_eq!(store.lookup(&token).as_deref(), Some("alice"));
    }

    #[test]
    fn tokens_are_unique_and_opaque() {
        let store = SessionStore::new();
        let t1 = store.create("alice", Duration::from_secs(60));
        let t2 = store.create("alice", Duration::from_secs(60));
        assert_ne!(t1, t2);
        assert_eq!(t1.len(), 60); // 30 bytes hex-encoded
    }

    #[test]
    fn unknown_token_not_found() {
        let store = SessionStore::new();
        assert!(store.lookup("deadbeef").is_none());
    }

    #[test]
    fn expired_token_not_found() {
        let store = SessionStore::new();
        let token = store.create("alice", Duration::from_millis(0));
        assert!(store.lookup(&token).is_none());
        // The expired entry was evicted, so a sweep finds nothing left
        assert_eq!(store.sweep(), 0);
    }

    #[test]
    fn delete_destroys_session() {
        let store = SessionStore::new();
        let token = store.create("alice", Duration::from_secs(60));
        store.delete(&token);
        assert!(store.lookup(&token).is_none());
    }

    #[test]
    fn sweep_evicts_only_expired() {
        let store = SessionStore::new();
        store.create("old", Duration::from_millis(0));
        let live = store.create("live", Duration::from_secs(60));
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.lookup(&live).as_deref(), Some("live"));
    }

    #[test]
    fn cookie_value_finds_named_cookie() {
        let header = "theme=dark; cpen322-session=abc123; lang=en";
        assert_eq!(
            cookie_value(header, SESSION_COOKIE).as_deref(),
            Some("abc123")
        );
        assert_eq!(cookie_value(header, "theme").as_deref(), Some("dark"));
        assert!(cookie_value(header, "missing").is_none());
    }

    #[test]
    fn cookie_value_ignores_prefix_matches() {
        let header = "xcpen322-session=evil; cpen322-session=good";
        assert_eq!(
            cookie_value(header, SESSION_COOKIE).as_deref(),
            Some("good")
        );
    }
}
