// src/source/session.rs
//! Encrypted on-disk cache of the Moodle web-service token.
//!
//! Envelope: `{"version":1,"nonce":"<b64>","ciphertext":"<b64>"}`, AES-256-GCM
//! with a key derived from the configured secret via SHA-256. Without a
//! secret the cache is disabled and every process start logs in fresh.

use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::persist::write_atomic;

const ENVELOPE_VERSION: u32 = 1;
const NONCE_LEN: usize = 12;

/// An authenticated web-service session.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    /// The Moodle account the token belongs to.
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token_len", &self.token.len())
            .field("user_id", &self.user_id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl Session {
    pub fn age_hours(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.created_at).num_hours()
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    nonce: String,
    ciphertext: String,
}

pub struct SessionCache {
    path: PathBuf,
    cipher: Option<Aes256Gcm>,
}

impl SessionCache {
    pub fn new(path: impl Into<PathBuf>, secret: Option<&str>) -> Self {
        let cipher = secret
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                let digest = Sha256::digest(s.as_bytes());
                Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(digest.as_slice()))
            });
        Self {
            path: path.into(),
            cipher,
        }
    }

    pub fn disabled(path: impl Into<PathBuf>) -> Self {
        Self::new(path, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the cached session, or `None` when absent, disabled, or unreadable.
    pub fn load(&self) -> Option<Session> {
        let cipher = self.cipher.as_ref()?;
        let raw = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "session cache unreadable");
                return None;
            }
        };
        match decrypt(cipher, &raw) {
            Ok(session) => {
                debug!(path = %self.path.display(), "loaded cached session");
                Some(session)
            }
            Err(reason) => {
                warn!(path = %self.path.display(), %reason, "ignoring invalid session cache");
                None
            }
        }
    }

    /// Best-effort persist. Failures are logged, never returned.
    pub fn store(&self, session: &Session) {
        let Some(cipher) = self.cipher.as_ref() else {
            return;
        };
        let result = encrypt(cipher, session).and_then(|bytes| {
            write_atomic(&self.path, &bytes).map_err(|e| e.to_string())
        });
        if let Err(reason) = result {
            warn!(path = %self.path.display(), %reason, "failed to persist session cache");
        }
    }

    pub fn clear(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "session cache cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to clear session cache"),
        }
    }
}

fn encrypt(cipher: &Aes256Gcm, session: &Session) -> Result<Vec<u8>, String> {
    let plain = serde_json::to_vec(session).map_err(|e| e.to_string())?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plain.as_slice())
        .map_err(|_| "encryption failed".to_string())?;
    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        nonce: BASE64.encode(nonce.as_slice()),
        ciphertext: BASE64.encode(ciphertext),
    };
    serde_json::to_vec_pretty(&envelope).map_err(|e| e.to_string())
}

fn decrypt(cipher: &Aes256Gcm, raw: &str) -> Result<Session, String> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| format!("not a session envelope: {e}"))?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(format!("unsupported version {}", envelope.version));
    }
    let nonce = BASE64
        .decode(envelope.nonce.as_bytes())
        .map_err(|e| format!("bad nonce: {e}"))?;
    if nonce.len() != NONCE_LEN {
        return Err(format!("nonce has {} bytes", nonce.len()));
    }
    let ciphertext = BASE64
        .decode(envelope.ciphertext.as_bytes())
        .map_err(|e| format!("bad ciphertext: {e}"))?;
    let plain = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| "decryption failed (wrong key or tampered file)".to_string())?;
    serde_json::from_slice(&plain).map_err(|e| format!("bad session payload: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Session {
        Session {
            token: "abc123".into(),
            user_id: 77,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn store_then_load_returns_same_session() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SessionCache::new(dir.path().join("s.json"), Some("secret"));
        let s = sample();
        cache.store(&s);
        assert_eq!(cache.load(), Some(s));
    }

    #[test]
    fn file_does_not_contain_plain_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let cache = SessionCache::new(&path, Some("secret"));
        cache.store(&sample());
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("abc123"));
    }

    #[test]
    fn wrong_key_and_garbage_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        SessionCache::new(&path, Some("one")).store(&sample());
        assert!(SessionCache::new(&path, Some("two")).load().is_none());

        fs::write(&path, "{not json").unwrap();
        assert!(SessionCache::new(&path, Some("one")).load().is_none());
    }

    #[test]
    fn disabled_cache_never_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let cache = SessionCache::disabled(&path);
        assert!(!cache.is_enabled());
        cache.store(&sample());
        assert!(!path.exists());
        assert!(cache.load().is_none());
    }

    #[test]
    fn clear_removes_file_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let cache = SessionCache::new(&path, Some("k"));
        cache.store(&sample());
        cache.clear();
        assert!(!path.exists());
        cache.clear();
    }

    #[test]
    fn debug_hides_token() {
        assert!(!format!("{:?}", sample()).contains("abc123"));
    }
}
