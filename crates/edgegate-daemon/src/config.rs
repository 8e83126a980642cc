//! Daemon configuration from environment variables.
//!
//! | Variable | Meaning |
//! |---|---|
//! | `DATABASE_URL` | Path to the SQLite database file |
//! | `OBJECT_STORE_DIR` | Root directory of the artifact store |
//! | `MASTER_KEY` | base64 master key, 32 bytes decoded |
//! | `MASTER_KEY_ID` | Stable id for the current master (default `mk-1`) |
//! | `SIGNING_KEYS_DIR` | Directory of Ed25519 signing keys |
//! | `SIGNING_KEY_ID` | Key id to create on first start |
//! | `BIND_ADDR` | Ingress listen address (default `127.0.0.1:8080`) |
//! | `BACKEND_BASE_URL` | Optional compute-hub override |

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors surface at startup, before anything binds.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required variable is missing.
    #[error("missing required environment variable {name}")]
    Missing {
        /// The variable name.
        name: &'static str,
    },

    /// A variable failed to parse.
    #[error("invalid value for {name}: {message}")]
    Invalid {
        /// The variable name.
        name: &'static str,
        /// What was wrong.
        message: String,
    },
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path.
    pub database_path: PathBuf,
    /// Artifact store root.
    pub object_store_dir: PathBuf,
    /// base64 master key material.
    pub master_key_b64: String,
    /// Current master key id.
    pub master_key_id: String,
    /// Signing keys directory.
    pub signing_keys_dir: PathBuf,
    /// Signing key id created on first start.
    pub signing_key_id: String,
    /// Ingress bind address.
    pub bind_addr: SocketAddr,
    /// Optional compute-hub base URL override.
    pub backend_base_url: Option<String>,
    /// Worker threads draining the run queue.
    pub worker_threads: usize,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for missing or malformed variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let required = |name: &'static str| {
            std::env::var(name).map_err(|_| ConfigError::Missing { name })
        };

        let bind_addr = std::env::var("BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .map_err(|e| ConfigError::Invalid {
                name: "BIND_ADDR",
                message: format!("{e}"),
            })?;

        let worker_threads = match std::env::var("WORKER_THREADS") {
            Ok(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
                name: "WORKER_THREADS",
                message: format!("{e}"),
            })?,
            Err(_) => 4,
        };

        Ok(Self {
            database_path: PathBuf::from(required("DATABASE_URL")?),
            object_store_dir: PathBuf::from(required("OBJECT_STORE_DIR")?),
            master_key_b64: required("MASTER_KEY")?,
            master_key_id: std::env::var("MASTER_KEY_ID").unwrap_or_else(|_| "mk-1".to_string()),
            signing_keys_dir: PathBuf::from(required("SIGNING_KEYS_DIR")?),
            signing_key_id: std::env::var("SIGNING_KEY_ID")
                .unwrap_or_else(|_| "key-v1".to_string()),
            bind_addr,
            backend_base_url: std::env::var("BACKEND_BASE_URL").ok(),
            worker_threads,
        })
    }
}
