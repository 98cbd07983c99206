//! Cookie sessions, stored-key verification and the process-wide rotating
//! internal key.

use std::sync::RwLock;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::config::{AdminKey, LocalUser};

/// Name of the session cookie set on successful login.
pub const SESSION_COOKIE: &str = "tg_session";

/// Sliding lifetime of a session.
pub const SESSION_LIFETIME_HOURS: i64 = 8;

const INTERNAL_KEY_BYTES: usize = 32;
const INTERNAL_KEY_ROTATION_DAYS: i64 = 30;

#[derive(Clone, Debug)]
pub struct Session {
    pub username: String,
    pub expires: DateTime<Utc>,
}

/// In-memory session table keyed by opaque cookie token. Sessions slide:
/// every successful validation extends the expiry window.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for `username`, returning the cookie token.
    pub fn create(&self, username: &str) -> String {
        let token = random_token();
        self.sessions.insert(
            token.clone(),
            Session {
                username: username.to_string(),
                expires: Utc::now() + Duration::hours(SESSION_LIFETIME_HOURS),
            },
        );
        token
    }

    /// Validate a token and slide its expiry. Expired sessions are removed
    /// on access.
    pub fn validate(&self, token: &str) -> Option<Session> {
        let now = Utc::now();
        let mut entry = self.sessions.get_mut(token)?;
        if entry.expires < now {
            drop(entry);
            self.sessions.remove(token);
            return None;
        }
        entry.expires = now + Duration::hours(SESSION_LIFETIME_HOURS);
        Some(entry.clone())
    }

    pub fn remove(&self, token: &str) {
        self.sessions.remove(token);
    }

    /// Drop all expired sessions; called from the purge worker.
    pub fn purge_expired(&self) {
        let now = Utc::now();
        self.sessions.retain(|_, session| session.expires >= now);
    }
}

/// Verify a submitted password against the configured local users.
pub fn verify_user(users: &[LocalUser], username: &str, password: &str) -> bool {
    for user in users {
        if user.username == username {
            return bcrypt::verify(password, &user.password_hash).unwrap_or(false);
        }
    }
    // Burn a verification anyway so unknown usernames cost the same.
    let _ = bcrypt::verify(password, DUMMY_HASH);
    false
}

/// Verify a candidate admin key against every stored hash. Hash
/// verification is fixed-time per entry; the loop does not short-circuit
/// on username-style hints because keys carry none.
pub fn verify_admin_key(keys: &[AdminKey], candidate: &str) -> Option<String> {
    let mut matched = None;
    for key in keys {
        if bcrypt::verify(candidate, &key.key_hash).unwrap_or(false) && matched.is_none() {
            matched = Some(key.id.clone());
        }
    }
    matched
}

const DUMMY_HASH: &str = "$2b$12$C6UzMDM.H6dfI/f/IKcEeO7az3vUnq0mUxwLRiCzYmuxbRxpEBSC2";

struct InternalKeyState {
    value: String,
    rotated_at: DateTime<Utc>,
}

/// The process-wide internal key: 32 random bytes, base64url without
/// padding, rotated every 30 days. Used to authenticate in-process calls to
/// the node and accepted from external callers who know it.
pub struct RotatingKey {
    state: RwLock<InternalKeyState>,
}

impl Default for RotatingKey {
    fn default() -> Self {
        Self::new()
    }
}

impl RotatingKey {
    pub fn new() -> Self {
        RotatingKey {
            state: RwLock::new(InternalKeyState {
                value: random_token(),
                rotated_at: Utc::now(),
            }),
        }
    }

    /// The current key value, rotating first if the rotation window lapsed.
    pub fn current(&self) -> String {
        self.rotate_if_due();
        self.state
            .read()
            .map(|state| state.value.clone())
            .unwrap_or_default()
    }

    /// Fixed-time comparison against the current key.
    pub fn verify(&self, candidate: &str) -> bool {
        let current = self.current();
        current.as_bytes().ct_eq(candidate.as_bytes()).into()
    }

    fn rotate_if_due(&self) {
        let due = self
            .state
            .read()
            .map(|state| Utc::now() - state.rotated_at > Duration::days(INTERNAL_KEY_ROTATION_DAYS))
            .unwrap_or(false);
        if due {
            if let Ok(mut state) = self.state.write() {
                if Utc::now() - state.rotated_at > Duration::days(INTERNAL_KEY_ROTATION_DAYS) {
                    state.value = random_token();
                    state.rotated_at = Utc::now();
                    info!("internal API key rotated");
                }
            }
        }
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; INTERNAL_KEY_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_slide_and_expire() {
        let store = SessionStore::new();
        let token = store.create("alice");

        let session = store.validate(&token).expect("session should be valid");
        assert_eq!(session.username, "alice");

        // Force expiry and confirm removal on access.
        store.sessions.get_mut(&token).unwrap().expires = Utc::now() - Duration::minutes(1);
        assert!(store.validate(&token).is_none());
        assert!(store.validate(&token).is_none());
    }

    #[test]
    fn rotating_key_is_base64url_and_verifies() {
        let key = RotatingKey::new();
        let value = key.current();
        assert_eq!(URL_SAFE_NO_PAD.decode(&value).unwrap().len(), 32);
        assert!(key.verify(&value));
        assert!(!key.verify("not-the-key"));
    }

    #[test]
    fn admin_key_verification_matches_hashes() {
        let hash = bcrypt::hash("sekrit", 4).unwrap();
        let keys = vec![AdminKey {
            id: "ops".into(),
            key_hash: hash,
        }];
        assert_eq!(verify_admin_key(&keys, "sekrit").as_deref(), Some("ops"));
        assert!(verify_admin_key(&keys, "wrong").is_none());
    }

    #[test]
    fn unknown_user_fails_closed() {
        let users = vec![LocalUser {
            username: "alice".into(),
            password_hash: bcrypt::hash("pw", 4).unwrap(),
        }];
        assert!(verify_user(&users, "alice", "pw"));
        assert!(!verify_user(&users, "alice", "nope"));
        assert!(!verify_user(&users, "bob", "pw"));
    }
}
