//! Envelope encryption for backend tokens and other workspace secrets.
//!
//! Each record gets a fresh 256-bit data-encryption key (DEK). The plaintext
//! is sealed with ChaCha20-Poly1305 under the DEK, and the DEK is wrapped
//! under a long-lived master key. The wrapped DEK carries the master key id,
//! so master rotation only requires keeping old masters loadable.
//!
//! # Secret hygiene
//!
//! - Plaintext returned by [`MasterKeyRing::open`] is `Zeroizing` and lives
//!   only in the caller's scope; nothing here caches it.
//! - [`BackendToken`] renders as `"****" + last4` in `Display` and `Debug`;
//!   serializing the plaintext form is not possible without going through
//!   [`MasterKeyRing::seal`].
//!
//! # Wire format
//!
//! `ciphertext` = `nonce (12) || aead_ciphertext`.
//! `wrapped_dek` = `key_id_len (1) || key_id || nonce (12) || aead(dek)`.

mod token;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

pub use token::BackendToken;

/// Size of the per-record data-encryption key.
pub const DEK_SIZE: usize = 32;

/// AEAD nonce size for ChaCha20-Poly1305.
const NONCE_SIZE: usize = 12;

/// Errors from envelope operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EnvelopeError {
    /// No master key is loaded, or the wrapped DEK names an unknown master.
    #[error("master key unavailable: {key_id}")]
    KeyUnavailable {
        /// The missing master key id.
        key_id: String,
    },

    /// The master key material is malformed.
    #[error("invalid master key: {message}")]
    InvalidMasterKey {
        /// Description of the problem.
        message: String,
    },

    /// Decryption failed - wrong key, truncated blob, or tampered tag.
    /// Deliberately carries no detail beyond the classification.
    #[error("decryption failed")]
    DecryptFailed,
}

/// A sealed secret: ciphertext plus the wrapped DEK that opens it.
///
/// Both halves are stored; neither is sensitive on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    /// `nonce || aead_ciphertext` of the plaintext under the DEK.
    pub ciphertext: Vec<u8>,
    /// `key_id_len || key_id || nonce || aead(dek)` under a master key.
    pub wrapped_dek: Vec<u8>,
}

/// A single master key with a stable identifier.
pub struct MasterKey {
    key_id: String,
    key: Zeroizing<[u8; DEK_SIZE]>,
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl MasterKey {
    /// Loads a master key from its base64 form (url-safe alphabet; padding
    /// optional). The decoded key must be exactly 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::InvalidMasterKey`] for malformed input.
    pub fn from_base64(key_id: impl Into<String>, encoded: &str) -> Result<Self, EnvelopeError> {
        use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
        use base64::Engine as _;

        let key_id = key_id.into();
        if key_id.is_empty() || key_id.len() > 255 {
            return Err(EnvelopeError::InvalidMasterKey {
                message: "master key id must be 1..=255 bytes".to_string(),
            });
        }

        let decoded = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .or_else(|_| URL_SAFE.decode(encoded))
            .map_err(|e| EnvelopeError::InvalidMasterKey {
                message: format!("base64 decode failed: {e}"),
            })?;

        let key: [u8; DEK_SIZE] =
            decoded
                .as_slice()
                .try_into()
                .map_err(|_| EnvelopeError::InvalidMasterKey {
                    message: format!("master key must be {DEK_SIZE} bytes, got {}", decoded.len()),
                })?;

        Ok(Self {
            key_id,
            key: Zeroizing::new(key),
        })
    }

    /// Returns the stable master key id.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

/// Holds the current master key plus any previous masters needed to open
/// old records.
///
/// Rotation appends a new current master; previous masters are never
/// removed while records sealed under them exist.
pub struct MasterKeyRing {
    current: usize,
    masters: Vec<MasterKey>,
}

impl MasterKeyRing {
    /// Creates a ring with a single master key.
    #[must_use]
    pub fn new(master: MasterKey) -> Self {
        Self {
            current: 0,
            masters: vec![master],
        }
    }

    /// Adds a new master and makes it current. Existing masters stay
    /// loadable for `open`.
    pub fn rotate(&mut self, master: MasterKey) {
        self.masters.push(master);
        self.current = self.masters.len() - 1;
    }

    /// Returns the id of the current master key.
    #[must_use]
    pub fn current_key_id(&self) -> &str {
        self.masters[self.current].key_id()
    }

    /// Seals a plaintext under a fresh DEK wrapped by the current master.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::DecryptFailed`] only on internal AEAD
    /// failure, which indicates a broken RNG or key; callers may treat it
    /// as unrecoverable.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedSecret, EnvelopeError> {
        let mut dek = Zeroizing::new([0u8; DEK_SIZE]);
        OsRng.fill_bytes(&mut *dek);

        let ciphertext = aead_seal(&dek, plaintext)?;

        let master = &self.masters[self.current];
        let wrapped = aead_seal(&master.key, &*dek)?;

        let key_id = master.key_id.as_bytes();
        let mut wrapped_dek = Vec::with_capacity(1 + key_id.len() + wrapped.len());
        wrapped_dek.push(u8::try_from(key_id.len()).expect("key id bounded at construction"));
        wrapped_dek.extend_from_slice(key_id);
        wrapped_dek.extend_from_slice(&wrapped);

        Ok(SealedSecret {
            ciphertext,
            wrapped_dek,
        })
    }

    /// Opens a sealed secret. The returned plaintext zeroizes on drop.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::KeyUnavailable`] if the wrapped DEK names a master
    ///   this ring does not hold
    /// - [`EnvelopeError::DecryptFailed`] on any shape or tag mismatch,
    ///   which is treated as tamper
    pub fn open(&self, sealed: &SealedSecret) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
        let (key_id, wrapped) = split_wrapped_dek(&sealed.wrapped_dek)?;

        let master = self
            .masters
            .iter()
            .find(|m| m.key_id == key_id)
            .ok_or_else(|| EnvelopeError::KeyUnavailable {
                key_id: key_id.to_string(),
            })?;

        let dek_bytes = aead_open(&master.key, wrapped)?;
        if dek_bytes.len() != DEK_SIZE {
            return Err(EnvelopeError::DecryptFailed);
        }
        let mut dek = Zeroizing::new([0u8; DEK_SIZE]);
        dek.copy_from_slice(&dek_bytes);

        aead_open(&dek, &sealed.ciphertext)
    }
}

/// Encrypts `plaintext` under `key` with a random nonce; returns
/// `nonce || ciphertext`.
fn aead_seal(key: &[u8; DEK_SIZE], plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| EnvelopeError::DecryptFailed)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts `nonce || ciphertext` under `key`.
fn aead_open(key: &[u8; DEK_SIZE], blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
    if blob.len() < NONCE_SIZE {
        return Err(EnvelopeError::DecryptFailed);
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| EnvelopeError::DecryptFailed)
}

/// Splits `key_id_len || key_id || wrapped` and validates the framing.
fn split_wrapped_dek(wrapped_dek: &[u8]) -> Result<(&str, &[u8]), EnvelopeError> {
    let (&len, rest) = wrapped_dek
        .split_first()
        .ok_or(EnvelopeError::DecryptFailed)?;
    let len = usize::from(len);
    if rest.len() <= len {
        return Err(EnvelopeError::DecryptFailed);
    }
    let (key_id, wrapped) = rest.split_at(len);
    let key_id = std::str::from_utf8(key_id).map_err(|_| EnvelopeError::DecryptFailed)?;
    Ok((key_id, wrapped))
}
