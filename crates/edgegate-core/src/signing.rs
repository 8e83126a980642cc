//! Ed25519 signing-key management for evidence bundles.
//!
//! Key records are never deleted. Rotation creates a new versioned key and
//! makes it current; revocation stamps `revoked_at` on the record so old
//! bundles stay attributable. Private keys live either in memory (tests) or
//! as 0600 files under a 0700 directory.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of an Ed25519 secret key in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Errors from signing-key operations.
#[derive(Debug, Error)]
pub enum SigningError {
    /// I/O error during key file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No key exists under the given id.
    #[error("signing key not found: {key_id}")]
    KeyNotFound {
        /// The missing key id.
        key_id: String,
    },

    /// No key is currently active for signing.
    #[error("no active signing key")]
    NoActiveKey,

    /// Key material on disk is malformed.
    #[error("invalid key material: {message}")]
    InvalidKeyMaterial {
        /// Description of the problem.
        message: String,
    },

    /// Key file or directory has group/other permissions.
    #[error("insecure permissions on {path}")]
    InsecurePermissions {
        /// The offending path.
        path: String,
    },

    /// Signature verification failed.
    #[error("signature verification failed for key {key_id}")]
    VerifyFailed {
        /// The key id used for verification.
        key_id: String,
    },
}

/// Public metadata for a signing key. Never deleted; revocation only sets
/// `revoked_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKeyRecord {
    /// Stable key id, e.g. `key-v1718000000`.
    pub key_id: String,
    /// Hex-encoded Ed25519 public key.
    pub public_key_hex: String,
    /// When the key was created.
    pub created_at: DateTime<Utc>,
    /// When the key was revoked, if ever.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl SigningKeyRecord {
    /// Returns `true` while the key may be used for new signatures.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

struct KeyEntry {
    signing_key: SigningKey,
    record: SigningKeyRecord,
}

enum KeyStorage {
    /// In-memory storage for tests.
    Memory,
    /// File-based storage with 0600 key files.
    File { keys_dir: PathBuf },
}

/// Manager for bundle signing keys.
pub struct SigningKeyManager {
    storage: KeyStorage,
    keys: RwLock<BTreeMap<String, KeyEntry>>,
    current: RwLock<Option<String>>,
}

impl SigningKeyManager {
    /// Creates an in-memory manager for tests. Keys are lost on drop.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            storage: KeyStorage::Memory,
            keys: RwLock::new(BTreeMap::new()),
            current: RwLock::new(None),
        }
    }

    /// Creates a file-backed manager, loading any keys already present.
    ///
    /// The most recent key id (lexicographically greatest, which matches
    /// the timestamped naming) becomes current.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, has insecure
    /// permissions, or contains malformed key files.
    pub fn open(keys_dir: impl AsRef<Path>) -> Result<Self, SigningError> {
        let keys_dir = keys_dir.as_ref().to_path_buf();

        if !keys_dir.exists() {
            fs::create_dir_all(&keys_dir)?;
            fs::set_permissions(&keys_dir, fs::Permissions::from_mode(0o700))?;
        }
        let mode = fs::metadata(&keys_dir)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(SigningError::InsecurePermissions {
                path: keys_dir.display().to_string(),
            });
        }

        let manager = Self {
            storage: KeyStorage::File { keys_dir },
            keys: RwLock::new(BTreeMap::new()),
            current: RwLock::new(None),
        };
        manager.load_existing()?;
        Ok(manager)
    }

    /// Generates a new keypair, stores it, and makes it current.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be persisted.
    pub fn generate(&self, key_id: impl Into<String>) -> Result<SigningKeyRecord, SigningError> {
        let key_id = key_id.into();
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        self.install(key_id, signing_key, Utc::now())
    }

    /// Rotates to a fresh key named by timestamp. The previous key stays
    /// usable for verification.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be persisted.
    pub fn rotate(&self) -> Result<SigningKeyRecord, SigningError> {
        let key_id = format!("key-v{}", Utc::now().timestamp());
        self.generate(key_id)
    }

    /// Marks a key revoked. Revoked keys still verify old bundles but are
    /// never selected for new signatures.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::KeyNotFound`] for unknown ids.
    pub fn revoke(&self, key_id: &str) -> Result<SigningKeyRecord, SigningError> {
        let mut keys = self.keys.write().expect("lock poisoned");
        let entry = keys.get_mut(key_id).ok_or_else(|| SigningError::KeyNotFound {
            key_id: key_id.to_string(),
        })?;
        entry.record.revoked_at = Some(Utc::now());

        let mut current = self.current.write().expect("lock poisoned");
        if current.as_deref() == Some(key_id) {
            // Fall back to the newest unrevoked key, if any.
            *current = keys
                .iter()
                .rev()
                .find(|(_, e)| e.record.is_active())
                .map(|(id, _)| id.clone());
        }
        Ok(keys[key_id].record.clone())
    }

    /// Signs `data` with the current key; returns `(key_id, signature)`.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::NoActiveKey`] when every key is revoked or
    /// none exists.
    pub fn sign(&self, data: &[u8]) -> Result<(String, Signature), SigningError> {
        // Clone the id so the two locks are never held together (revoke
        // acquires them in the opposite order).
        let key_id = self
            .current
            .read()
            .expect("lock poisoned")
            .clone()
            .ok_or(SigningError::NoActiveKey)?;
        let keys = self.keys.read().expect("lock poisoned");
        let entry = keys.get(&key_id).ok_or(SigningError::NoActiveKey)?;
        Ok((key_id.clone(), entry.signing_key.sign(data)))
    }

    /// Verifies a signature made by the named key (revoked keys included).
    ///
    /// # Errors
    ///
    /// - [`SigningError::KeyNotFound`] for unknown ids
    /// - [`SigningError::VerifyFailed`] on mismatch
    pub fn verify(
        &self,
        key_id: &str,
        data: &[u8],
        signature: &Signature,
    ) -> Result<(), SigningError> {
        let keys = self.keys.read().expect("lock poisoned");
        let entry = keys.get(key_id).ok_or_else(|| SigningError::KeyNotFound {
            key_id: key_id.to_string(),
        })?;
        entry
            .signing_key
            .verifying_key()
            .verify(data, signature)
            .map_err(|_| SigningError::VerifyFailed {
                key_id: key_id.to_string(),
            })
    }

    /// Returns the record for a key id.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::KeyNotFound`] for unknown ids.
    pub fn record(&self, key_id: &str) -> Result<SigningKeyRecord, SigningError> {
        let keys = self.keys.read().expect("lock poisoned");
        keys.get(key_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| SigningError::KeyNotFound {
                key_id: key_id.to_string(),
            })
    }

    /// Lists all key records, oldest id first.
    #[must_use]
    pub fn records(&self) -> Vec<SigningKeyRecord> {
        let keys = self.keys.read().expect("lock poisoned");
        keys.values().map(|e| e.record.clone()).collect()
    }

    /// Returns the current key id, if one is active.
    #[must_use]
    pub fn current_key_id(&self) -> Option<String> {
        self.current.read().expect("lock poisoned").clone()
    }

    fn install(
        &self,
        key_id: String,
        signing_key: SigningKey,
        created_at: DateTime<Utc>,
    ) -> Result<SigningKeyRecord, SigningError> {
        if let KeyStorage::File { keys_dir } = &self.storage {
            write_key_file(keys_dir, &key_id, &signing_key)?;
        }

        let record = SigningKeyRecord {
            key_id: key_id.clone(),
            public_key_hex: hex::encode(signing_key.verifying_key().to_bytes()),
            created_at,
            revoked_at: None,
        };

        let mut keys = self.keys.write().expect("lock poisoned");
        keys.insert(
            key_id.clone(),
            KeyEntry {
                signing_key,
                record: record.clone(),
            },
        );
        *self.current.write().expect("lock poisoned") = Some(key_id);
        Ok(record)
    }

    fn load_existing(&self) -> Result<(), SigningError> {
        let KeyStorage::File { keys_dir } = &self.storage else {
            return Ok(());
        };

        let mut loaded: Vec<(String, SigningKey, DateTime<Utc>)> = Vec::new();
        for entry in fs::read_dir(keys_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "key") {
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let signing_key = read_key_file(&path)?;
                let created_at = fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                loaded.push((stem.to_string(), signing_key, created_at));
            }
        }

        loaded.sort_by(|a, b| a.0.cmp(&b.0));
        for (key_id, signing_key, created_at) in loaded {
            self.install(key_id, signing_key, created_at)?;
        }
        Ok(())
    }
}

/// Verifies a signature given only the hex public key, for offline bundle
/// verification without a key manager.
///
/// # Errors
///
/// Returns [`SigningError`] for malformed key material or a bad signature.
pub fn verify_detached(
    public_key_hex: &str,
    data: &[u8],
    signature_bytes: &[u8],
) -> Result<(), SigningError> {
    let key_bytes: [u8; PUBLIC_KEY_SIZE] = hex::decode(public_key_hex)
        .map_err(|e| SigningError::InvalidKeyMaterial {
            message: format!("public key hex: {e}"),
        })?
        .try_into()
        .map_err(|_| SigningError::InvalidKeyMaterial {
            message: "public key must be 32 bytes".to_string(),
        })?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|e| SigningError::InvalidKeyMaterial {
            message: e.to_string(),
        })?;
    let signature =
        Signature::from_slice(signature_bytes).map_err(|e| SigningError::InvalidKeyMaterial {
            message: e.to_string(),
        })?;
    verifying_key
        .verify(data, &signature)
        .map_err(|_| SigningError::VerifyFailed {
            key_id: String::new(),
        })
}

fn write_key_file(keys_dir: &Path, key_id: &str, key: &SigningKey) -> Result<(), SigningError> {
    let key_path = keys_dir.join(format!("{key_id}.key"));
    let secret = Zeroizing::new(key.to_bytes());

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&key_path)?;
    file.write_all(&*secret)?;
    file.sync_all()?;

    let mode = fs::metadata(&key_path)?.permissions().mode();
    if mode & 0o077 != 0 {
        let _ = fs::remove_file(&key_path);
        return Err(SigningError::InsecurePermissions {
            path: key_path.display().to_string(),
        });
    }
    Ok(())
}

fn read_key_file(path: &Path) -> Result<SigningKey, SigningError> {
    let mode = fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(SigningError::InsecurePermissions {
            path: path.display().to_string(),
        });
    }
    let mut file = File::open(path)?;
    let mut secret = Zeroizing::new([0u8; SECRET_KEY_SIZE]);
    file.read_exact(&mut *secret)
        .map_err(|_| SigningError::InvalidKeyMaterial {
            message: format!("key file {} is not {SECRET_KEY_SIZE} bytes", path.display()),
        })?;
    Ok(SigningKey::from_bytes(&secret))
}
