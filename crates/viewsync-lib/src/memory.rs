// ============================
// viewsync-lib/src/memory.rs
// ============================
//! The memory file: a single JSON document holding the encrypted admin
//! fingerprint, the fingerprint -> display-name map, and the persisted BSL
//! match memory. Rewritten whole and atomically on every mutation.
//!
//! Only the admin fingerprint is encrypted (AES-256-GCM, `iv:tag:ct` with
//! every part hex). The key comes from the `VIEWSYNC_MEMORY_KEY`
//! environment variable (SHA-256 of its value) when set, otherwise from a
//! `0600` key file, otherwise it is generated on first boot.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::fs as tokio_fs;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::AppError;

/// Environment variable whose SHA-256 becomes the encryption key.
pub const MEMORY_KEY_ENV: &str = "VIEWSYNC_MEMORY_KEY";
const MEMORY_FILE: &str = "memory.json";
const KEY_FILE: &str = "memory.key";
const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// On-disk document. `encrypted` is the admin fingerprint in
/// `hex(iv):hex(tag):hex(ciphertext)` form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoryDoc {
    #[serde(default)]
    encrypted: Option<String>,
    #[serde(default)]
    client_names: HashMap<String, String>,
    /// fingerprint -> lowercase client file name -> lowercase playlist file
    /// name.
    #[serde(default)]
    bsl_matches: HashMap<String, HashMap<String, String>>,
}

/// Pre-split layout: the whole document was one encrypted blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyDoc {
    #[serde(default)]
    admin_fingerprint: Option<String>,
    #[serde(default)]
    client_names: HashMap<String, String>,
    #[serde(default)]
    bsl_matches: HashMap<String, HashMap<String, String>>,
}

/// Encrypt a fingerprint into the `iv:tag:ct` hex wire form.
pub fn encrypt_fingerprint(key: &[u8; 32], plaintext: &str) -> Result<String, AppError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| AppError::Internal(format!("cipher init failed: {e}")))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let sealed = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| AppError::Internal("encryption failed".to_string()))?;
    // aes-gcm appends the 16-byte tag to the ciphertext
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    Ok(format!(
        "{}:{}:{}",
        hex::encode(nonce_bytes),
        hex::encode(tag),
        hex::encode(ciphertext)
    ))
}

/// Decrypt the `iv:tag:ct` hex wire form back to the fingerprint.
pub fn decrypt_fingerprint(key: &[u8; 32], encoded: &str) -> Result<String, AppError> {
    let parts: Vec<&str> = encoded.split(':').collect();
    if parts.len() != 3 {
        return Err(AppError::Validation(
            "encrypted fingerprint must have iv:tag:ciphertext parts".to_string(),
        ));
    }
    let decode = |part: &str, what: &str| {
        hex::decode(part).map_err(|_| AppError::Validation(format!("bad hex in {what}")))
    };
    let nonce_bytes = decode(parts[0], "iv")?;
    let tag = decode(parts[1], "tag")?;
    let ciphertext = decode(parts[2], "ciphertext")?;
    if nonce_bytes.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(AppError::Validation("bad iv or tag length".to_string()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| AppError::Internal(format!("cipher init failed: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    let plaintext = cipher
        .decrypt(nonce, sealed.as_ref())
        .map_err(|_| AppError::Validation("fingerprint decryption failed".to_string()))?;
    String::from_utf8(plaintext)
        .map_err(|_| AppError::Validation("decrypted fingerprint is not UTF-8".to_string()))
}

/// Resolve the encryption key: env var (hashed), existing key file, or a
/// fresh key written to the key file.
fn resolve_key(env_value: Option<String>, key_path: &Path) -> Result<[u8; 32], AppError> {
    if let Some(value) = env_value {
        let digest = Sha256::digest(value.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        return Ok(key);
    }

    if key_path.exists() {
        let data = fs::read(key_path)?;
        if data.len() != 32 {
            return Err(AppError::Internal("invalid key file length".to_string()));
        }
        warn_if_permissive(key_path);
        let mut key = [0u8; 32];
        key.copy_from_slice(&data);
        return Ok(key);
    }

    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    fs::write(key_path, key)?;
    restrict_permissions(key_path)?;
    info!(
        path = %key_path.display(),
        "generated a new memory encryption key; back it up to keep admin identity across reinstalls"
    );
    Ok(key)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn warn_if_permissive(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        if meta.permissions().mode() & 0o077 != 0 {
            warn!(path = %path.display(), "memory key file is readable by other users; chmod 600 recommended");
        }
    }
}

#[cfg(not(unix))]
fn warn_if_permissive(_path: &Path) {}

/// The persistent memory store.
pub struct MemoryStore {
    path: PathBuf,
    key: [u8; 32],
    doc: RwLock<MemoryDoc>,
    admin_fingerprint: RwLock<Option<String>>,
}

impl MemoryStore {
    /// Load (or initialize) the store under `data_dir`. Corruption beyond
    /// what migration can repair is fatal.
    pub fn load(data_dir: &Path) -> Result<Self, AppError> {
        let key = resolve_key(
            std::env::var(MEMORY_KEY_ENV).ok(),
            &data_dir.join(KEY_FILE),
        )?;
        Self::load_with_key(data_dir, key)
    }

    /// Load with an explicit key (tests).
    pub fn load_with_key(data_dir: &Path, key: [u8; 32]) -> Result<Self, AppError> {
        let path = data_dir.join(MEMORY_FILE);
        let mut doc = MemoryDoc::default();
        let mut migrated = false;

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let trimmed = content.trim();
            if trimmed.is_empty() {
                // fresh file, nothing to do
            } else if trimmed.starts_with('{') {
                doc = serde_json::from_str(trimmed)?;
            } else {
                // format probe says pre-split layout: one encrypted blob
                let json = decrypt_fingerprint(&key, trimmed)?;
                let legacy: LegacyDoc = serde_json::from_str(&json)?;
                doc = MemoryDoc {
                    encrypted: legacy
                        .admin_fingerprint
                        .as_deref()
                        .map(|fp| encrypt_fingerprint(&key, fp))
                        .transpose()?,
                    client_names: legacy.client_names,
                    bsl_matches: legacy.bsl_matches,
                };
                migrated = true;
                info!("migrated memory file from the legacy encrypted-blob format");
            }
        }

        let admin_fingerprint = doc
            .encrypted
            .as_deref()
            .map(|enc| decrypt_fingerprint(&key, enc))
            .transpose()?;

        if migrated {
            let json = serde_json::to_string_pretty(&doc)?;
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, json)?;
            fs::rename(&tmp, &path)?;
        }

        Ok(Self {
            path,
            key,
            doc: RwLock::new(doc),
            admin_fingerprint: RwLock::new(admin_fingerprint),
        })
    }

    /// Atomic whole-document rewrite: write a sibling temp file, then
    /// rename over the live one.
    async fn rewrite(&self) -> Result<(), AppError> {
        let json = {
            let doc = self.doc.read().await;
            serde_json::to_string_pretty(&*doc)?
        };
        let tmp = self.path.with_extension("json.tmp");
        tokio_fs::write(&tmp, json).await?;
        tokio_fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn admin_fingerprint(&self) -> Option<String> {
        self.admin_fingerprint.read().await.clone()
    }

    pub async fn set_admin_fingerprint(&self, fingerprint: &str) -> Result<(), AppError> {
        let encrypted = encrypt_fingerprint(&self.key, fingerprint)?;
        {
            let mut doc = self.doc.write().await;
            doc.encrypted = Some(encrypted);
        }
        *self.admin_fingerprint.write().await = Some(fingerprint.to_string());
        self.rewrite().await
    }

    pub async fn client_name(&self, fingerprint: &str) -> Option<String> {
        self.doc.read().await.client_names.get(fingerprint).cloned()
    }

    pub async fn set_client_name(
        &self,
        fingerprint: &str,
        display_name: &str,
    ) -> Result<(), AppError> {
        {
            let mut doc = self.doc.write().await;
            doc.client_names
                .insert(fingerprint.to_string(), display_name.to_string());
        }
        self.rewrite().await
    }

    /// Persisted match memory for one fingerprint: lowercase client file
    /// name -> lowercase playlist file name.
    pub async fn bsl_matches_for(&self, fingerprint: &str) -> HashMap<String, String> {
        self.doc
            .read()
            .await
            .bsl_matches
            .get(fingerprint)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn remember_bsl_match(
        &self,
        fingerprint: &str,
        client_file: &str,
        playlist_file: &str,
    ) -> Result<(), AppError> {
        {
            let mut doc = self.doc.write().await;
            doc.bsl_matches
                .entry(fingerprint.to_string())
                .or_default()
                .insert(client_file.to_lowercase(), playlist_file.to_lowercase());
        }
        self.rewrite().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_key() -> [u8; 32] {
        let digest = Sha256::digest(b"test-passphrase");
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        key
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = test_key();
        let encoded = encrypt_fingerprint(&key, "F1-device").unwrap();
        let parts: Vec<&str> = encoded.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), NONCE_LEN * 2);
        assert_eq!(parts[1].len(), TAG_LEN * 2);
        assert_eq!(decrypt_fingerprint(&key, &encoded).unwrap(), "F1-device");
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let encoded = encrypt_fingerprint(&test_key(), "F1").unwrap();
        let other = {
            let digest = Sha256::digest(b"other");
            let mut key = [0u8; 32];
            key.copy_from_slice(&digest);
            key
        };
        assert!(decrypt_fingerprint(&other, &encoded).is_err());
    }

    #[test]
    fn malformed_encoding_is_rejected() {
        let key = test_key();
        assert!(decrypt_fingerprint(&key, "nope").is_err());
        assert!(decrypt_fingerprint(&key, "aa:bb").is_err());
        assert!(decrypt_fingerprint(&key, "zz:zz:zz").is_err());
    }

    #[tokio::test]
    async fn store_roundtrips_across_reload() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = MemoryStore::load_with_key(temp_dir.path(), test_key()).unwrap();
            store.set_admin_fingerprint("F1").await.unwrap();
            store.set_client_name("fp-viewer", "Alice").await.unwrap();
            store
                .remember_bsl_match("fp-viewer", "My.Rip.MKV", "Movie.mkv")
                .await
                .unwrap();
        }

        let store = MemoryStore::load_with_key(temp_dir.path(), test_key()).unwrap();
        assert_eq!(store.admin_fingerprint().await.as_deref(), Some("F1"));
        assert_eq!(
            store.client_name("fp-viewer").await.as_deref(),
            Some("Alice")
        );
        let matches = store.bsl_matches_for("fp-viewer").await;
        assert_eq!(
            matches.get("my.rip.mkv").map(String::as_str),
            Some("movie.mkv")
        );
    }

    #[tokio::test]
    async fn on_disk_document_has_split_fields() {
        let temp_dir = TempDir::new().unwrap();
        let store = MemoryStore::load_with_key(temp_dir.path(), test_key()).unwrap();
        store.set_admin_fingerprint("F1").await.unwrap();
        store.set_client_name("fp", "Bob").await.unwrap();

        let raw = fs::read_to_string(temp_dir.path().join(MEMORY_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        // names and matches stay plain; only the fingerprint is sealed
        assert_eq!(value["clientNames"]["fp"], "Bob");
        let encrypted = value["encrypted"].as_str().unwrap();
        assert_eq!(encrypted.split(':').count(), 3);
        assert_eq!(
            decrypt_fingerprint(&test_key(), encrypted).unwrap(),
            "F1"
        );
    }

    #[tokio::test]
    async fn legacy_blob_is_migrated() {
        let temp_dir = TempDir::new().unwrap();
        let key = test_key();
        let legacy_json = serde_json::json!({
            "adminFingerprint": "F1",
            "clientNames": { "fp": "Carol" },
            "bslMatches": { "fp": { "a.mkv": "b.mkv" } }
        })
        .to_string();
        let blob = encrypt_fingerprint(&key, &legacy_json).unwrap();
        fs::write(temp_dir.path().join(MEMORY_FILE), blob).unwrap();

        let store = MemoryStore::load_with_key(temp_dir.path(), key).unwrap();
        assert_eq!(store.admin_fingerprint().await.as_deref(), Some("F1"));
        assert_eq!(store.client_name("fp").await.as_deref(), Some("Carol"));

        // the file is rewritten in the split format
        let raw = fs::read_to_string(temp_dir.path().join(MEMORY_FILE)).unwrap();
        assert!(raw.trim_start().starts_with('{'));
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(MEMORY_FILE), "not:valid:at-all").unwrap();
        assert!(MemoryStore::load_with_key(temp_dir.path(), test_key()).is_err());
    }

    #[test]
    fn env_key_is_sha256_of_value() {
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join(KEY_FILE);
        let key = resolve_key(Some("passphrase".to_string()), &key_path).unwrap();
        let expected = Sha256::digest(b"passphrase");
        assert_eq!(&key[..], &expected[..]);
        // env path never touches the key file
        assert!(!key_path.exists());
    }

    #[test]
    fn fresh_key_is_generated_and_reused() {
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join(KEY_FILE);
        let first = resolve_key(None, &key_path).unwrap();
        assert!(key_path.exists());
        let second = resolve_key(None, &key_path).unwrap();
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn generated_key_file_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join(KEY_FILE);
        resolve_key(None, &key_path).unwrap();
        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
