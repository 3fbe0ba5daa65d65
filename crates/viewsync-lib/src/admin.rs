// ============================
// viewsync-lib/src/admin.rs
// ============================
//! Admin authority and CSRF protection.
//!
//! The first fingerprint to register as admin is persisted; with
//! `ADMIN_FINGERPRINT_LOCK` enabled, every later device presenting a
//! different fingerprint is refused and disconnected shortly after.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::DashMap;
use rand::{rngs::OsRng, RngCore};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::sessions::ConnectionId;

/// CSRF tokens expire this long after issue.
pub const CSRF_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// The token table is swept once it grows past this many entries.
pub const CSRF_GC_THRESHOLD: usize = 1000;
/// Grace before a refused admin connection is dropped.
pub const REJECT_DISCONNECT_DELAY: Duration = Duration::from_millis(1000);

const TOKEN_BYTES: usize = 32;

/// Generate a cryptographically secure random token: 32 bytes of OS entropy,
/// base64 URL-safe without padding.
pub fn generate_secure_token() -> String {
    let mut buffer = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut buffer);
    URL_SAFE_NO_PAD.encode(buffer)
}

/// Outcome of an admin registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminRegistration {
    /// Accepted. `newly_locked` is set when this fingerprint became the
    /// persisted first-admin fingerprint and should be written to disk.
    Accepted { newly_locked: bool },
    /// Refused because the fingerprint lock is enabled and another device
    /// already holds the lock.
    Rejected,
}

/// Process-wide admin identity: the first-admin fingerprint plus the set of
/// connections that have proven it.
pub struct AdminAuthority {
    lock_enabled: bool,
    locked_fingerprint: RwLock<Option<String>>,
    verified: DashMap<ConnectionId, String>,
}

impl AdminAuthority {
    /// `initial` is the decrypted fingerprint recovered from the memory
    /// file, if any.
    pub fn new(lock_enabled: bool, initial: Option<String>) -> Self {
        Self {
            lock_enabled,
            locked_fingerprint: RwLock::new(initial),
            verified: DashMap::new(),
        }
    }

    /// Register a connection as admin. First fingerprint wins the lock;
    /// with the lock enabled, mismatching fingerprints are rejected.
    pub async fn register(&self, conn_id: &str, fingerprint: &str) -> AdminRegistration {
        let mut locked = self.locked_fingerprint.write().await;
        match locked.as_deref() {
            None => {
                *locked = Some(fingerprint.to_string());
                self.verified
                    .insert(conn_id.to_string(), fingerprint.to_string());
                AdminRegistration::Accepted { newly_locked: true }
            },
            Some(existing) if existing == fingerprint => {
                self.verified
                    .insert(conn_id.to_string(), fingerprint.to_string());
                AdminRegistration::Accepted {
                    newly_locked: false,
                }
            },
            Some(_) if self.lock_enabled => AdminRegistration::Rejected,
            Some(_) => {
                // Lock disabled: a different device may still administer.
                self.verified
                    .insert(conn_id.to_string(), fingerprint.to_string());
                AdminRegistration::Accepted {
                    newly_locked: false,
                }
            },
        }
    }

    /// Mark a connection verified without consulting the lock. Used when a
    /// fingerprint has already proven room-level admin authority (e.g. a
    /// rejoin matching the room's persisted admin record).
    pub fn grant(&self, conn_id: &str, fingerprint: &str) {
        self.verified
            .insert(conn_id.to_string(), fingerprint.to_string());
    }

    pub fn is_verified(&self, conn_id: &str) -> bool {
        self.verified.contains_key(conn_id)
    }

    pub fn revoke(&self, conn_id: &str) {
        self.verified.remove(conn_id);
    }

    pub async fn locked_fingerprint(&self) -> Option<String> {
        self.locked_fingerprint.read().await.clone()
    }
}

#[derive(Debug, Clone)]
struct CsrfEntry {
    token: String,
    issued_at: Instant,
}

/// Session-bound CSRF tokens for the mutating HTTP endpoints.
pub struct CsrfTokens {
    tokens: DashMap<String, CsrfEntry>,
    ttl: Duration,
}

impl Default for CsrfTokens {
    fn default() -> Self {
        Self::new()
    }
}

impl CsrfTokens {
    pub fn new() -> Self {
        Self::with_ttl(CSRF_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            tokens: DashMap::new(),
            ttl,
        }
    }

    /// Issue (or re-issue) the token bound to a session cookie.
    pub fn issue(&self, session_id: &str) -> String {
        self.maybe_gc();
        let token = generate_secure_token();
        self.tokens.insert(
            session_id.to_string(),
            CsrfEntry {
                token: token.clone(),
                issued_at: Instant::now(),
            },
        );
        token
    }

    /// The unexpired token for a session, if one exists.
    pub fn current(&self, session_id: &str) -> Option<String> {
        let entry = self.tokens.get(session_id)?;
        if entry.issued_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.token.clone())
    }

    /// Verify a presented token against the session binding. Expired
    /// tokens fail verification; the client refreshes via the token
    /// endpoint.
    pub fn verify(&self, session_id: &str, presented: &str) -> bool {
        match self.tokens.get(session_id) {
            Some(entry) => {
                entry.issued_at.elapsed() <= self.ttl && entry.token == presented
            },
            None => false,
        }
    }

    fn maybe_gc(&self) {
        if self.tokens.len() > CSRF_GC_THRESHOLD {
            let ttl = self.ttl;
            self.tokens
                .retain(|_, entry| entry.issued_at.elapsed() <= ttl);
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_long() {
        let a = generate_secure_token();
        let b = generate_secure_token();
        assert_ne!(a, b);
        assert!(a.len() >= 42);
    }

    #[tokio::test]
    async fn first_admin_wins_the_lock() {
        let authority = AdminAuthority::new(true, None);
        assert_eq!(
            authority.register("c1", "F1").await,
            AdminRegistration::Accepted { newly_locked: true }
        );
        assert_eq!(authority.register("c2", "F2").await, AdminRegistration::Rejected);
        assert!(authority.is_verified("c1"));
        assert!(!authority.is_verified("c2"));
        assert_eq!(authority.locked_fingerprint().await.as_deref(), Some("F1"));
    }

    #[tokio::test]
    async fn same_fingerprint_reconnects_fine() {
        let authority = AdminAuthority::new(true, Some("F1".to_string()));
        assert_eq!(
            authority.register("c9", "F1").await,
            AdminRegistration::Accepted {
                newly_locked: false
            }
        );
        assert!(authority.is_verified("c9"));
    }

    #[tokio::test]
    async fn lock_disabled_accepts_other_devices() {
        let authority = AdminAuthority::new(false, Some("F1".to_string()));
        assert_eq!(
            authority.register("c2", "F2").await,
            AdminRegistration::Accepted {
                newly_locked: false
            }
        );
    }

    #[tokio::test]
    async fn revoke_clears_verification() {
        let authority = AdminAuthority::new(false, None);
        authority.register("c1", "F1").await;
        authority.revoke("c1");
        assert!(!authority.is_verified("c1"));
    }

    #[test]
    fn csrf_issue_and_verify() {
        let tokens = CsrfTokens::new();
        let token = tokens.issue("session-1");
        assert!(tokens.verify("session-1", &token));
        assert!(!tokens.verify("session-1", "forged"));
        assert!(!tokens.verify("session-2", &token));
        assert_eq!(tokens.current("session-1").as_deref(), Some(token.as_str()));
    }

    #[test]
    fn expired_tokens_fail_verification() {
        let tokens = CsrfTokens::with_ttl(Duration::from_millis(0));
        let token = tokens.issue("session-1");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!tokens.verify("session-1", &token));
        assert!(tokens.current("session-1").is_none());
    }

    #[test]
    fn gc_sweeps_expired_entries() {
        let tokens = CsrfTokens::with_ttl(Duration::from_millis(0));
        for i in 0..(CSRF_GC_THRESHOLD + 1) {
            tokens.issue(&format!("session-{i}"));
        }
        std::thread::sleep(Duration::from_millis(5));
        // next issue triggers the sweep of everything expired
        tokens.issue("fresh");
        assert!(tokens.len() <= 2);
    }
}
