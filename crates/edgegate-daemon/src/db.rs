//! SQLite persistence for the daemon.
//!
//! One [`Store`] wraps a single connection behind a mutex. All tables are
//! created idempotently at open; there is no destructive migration path.
//!
//! Tenant scoping is structural: every query on a workspace-owned table
//! carries the workspace id in its WHERE clause, and lookups that miss -
//! including cross-workspace ids - report [`DbError::NotFound`].

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use edgegate_core::audit::{Actor, AuditEvent};
use edgegate_core::envelope::SealedSecret;
use edgegate_core::error::ErrorCode;
use edgegate_core::ids::{ArtifactId, PipelineId, RunId, WorkspaceId};
use edgegate_core::pipeline::Pipeline;
use edgegate_core::promptpack::PromptPackContent;

use crate::runs::state::{can_transition, RunState};

/// Errors from store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbError {
    /// Row absent in the caller's workspace (including cross-tenant ids).
    #[error("not found")]
    NotFound,

    /// A uniqueness or immutability constraint was violated.
    #[error("conflict: {message}")]
    Conflict {
        /// What collided.
        message: String,
    },

    /// The requested run-state transition is not in the table.
    #[error("invalid run state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: RunState,
        /// Requested state.
        to: RunState,
    },

    /// A nonce was already spent.
    #[error("nonce replay detected")]
    Replay,

    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored value failed to decode.
    #[error("corrupt row: {message}")]
    Corrupt {
        /// What failed to decode.
        message: String,
    },
}

/// How a run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// Started by an interactive user.
    Manual,
    /// Started through the CI ingress.
    Ci,
}

impl RunTrigger {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Ci => "ci",
        }
    }
}

/// A workspace row.
#[derive(Debug, Clone)]
pub struct WorkspaceRow {
    /// Workspace id.
    pub id: WorkspaceId,
    /// Display name.
    pub name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A backend integration row. Token plaintext never appears here.
#[derive(Debug, Clone)]
pub struct IntegrationRow {
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Provider label, e.g. `qaihub`.
    pub provider: String,
    /// `active` or `disabled`.
    pub active: bool,
    /// Envelope-sealed token.
    pub sealed_token: SealedSecret,
    /// Display suffix, the only token substring stored in clear.
    pub token_last4: String,
}

/// The current capabilities record for a workspace.
#[derive(Debug, Clone)]
pub struct CapabilitiesRow {
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Stored capabilities document.
    pub capabilities_blob_id: ArtifactId,
    /// Stored metric mapping document.
    pub metric_mapping_blob_id: ArtifactId,
    /// When the probe ran.
    pub probed_at: DateTime<Utc>,
    /// The probe run that produced this record.
    pub source_probe_run_id: String,
}

/// A promptpack version row.
#[derive(Debug, Clone)]
pub struct PromptPackRow {
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Logical pack id.
    pub logical_id: String,
    /// Version string.
    pub version: String,
    /// Canonical content hash.
    pub sha256: String,
    /// The content itself.
    pub content: PromptPackContent,
    /// Whether the version is published (and therefore immutable).
    pub published: bool,
}

/// A run row.
#[derive(Debug, Clone)]
pub struct RunRow {
    /// Run id.
    pub id: RunId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// The pipeline that ran.
    pub pipeline_id: PipelineId,
    /// How the run was triggered.
    pub trigger: RunTrigger,
    /// Current state.
    pub state: RunState,
    /// The model under test.
    pub model_artifact_id: ArtifactId,
    /// Normalized metric rows, set at evaluation.
    pub normalized_metrics: Option<Value>,
    /// Gate evaluation, set at evaluation.
    pub gates_eval: Option<Value>,
    /// The evidence bundle, set at reporting.
    pub bundle_artifact_id: Option<ArtifactId>,
    /// Error classification for `error` runs.
    pub error_code: Option<ErrorCode>,
    /// Error detail for `error` runs.
    pub error_detail: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Optional fields written together with a state transition.
#[derive(Debug, Default, Clone)]
pub struct RunUpdates {
    /// Normalized metric rows.
    pub normalized_metrics: Option<Value>,
    /// Gate evaluation document.
    pub gates_eval: Option<Value>,
    /// Bundle artifact.
    pub bundle_artifact_id: Option<ArtifactId>,
    /// Error classification.
    pub error_code: Option<ErrorCode>,
    /// Error detail.
    pub error_detail: Option<String>,
}

/// The SQLite-backed store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] on failure.
    pub fn in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS integrations (
                workspace_id TEXT PRIMARY KEY REFERENCES workspaces(id),
                provider TEXT NOT NULL,
                active INTEGER NOT NULL,
                token_ciphertext BLOB NOT NULL,
                wrapped_dek BLOB NOT NULL,
                token_last4 TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ci_secrets (
                workspace_id TEXT PRIMARY KEY REFERENCES workspaces(id),
                secret_ciphertext BLOB NOT NULL,
                wrapped_dek BLOB NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS capabilities (
                workspace_id TEXT PRIMARY KEY REFERENCES workspaces(id),
                capabilities_blob_id TEXT NOT NULL,
                metric_mapping_blob_id TEXT NOT NULL,
                probed_at TEXT NOT NULL,
                source_probe_run_id TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS promptpacks (
                workspace_id TEXT NOT NULL REFERENCES workspaces(id),
                logical_id TEXT NOT NULL,
                version TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                content TEXT NOT NULL,
                published INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (workspace_id, logical_id, version)
            );
            CREATE TABLE IF NOT EXISTS pipelines (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id),
                name TEXT NOT NULL,
                config TEXT NOT NULL,
                UNIQUE (workspace_id, name)
            );
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id),
                pipeline_id TEXT NOT NULL,
                trigger TEXT NOT NULL,
                state TEXT NOT NULL,
                model_artifact_id TEXT NOT NULL,
                normalized_metrics TEXT,
                gates_eval TEXT,
                bundle_artifact_id TEXT,
                error_code TEXT,
                error_detail TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_workspace_state
                ON runs(workspace_id, state);
            CREATE TABLE IF NOT EXISTS audit_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id TEXT NOT NULL,
                actor TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ci_nonces (
                workspace_id TEXT NOT NULL,
                nonce TEXT NOT NULL,
                used_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (workspace_id, nonce)
            );",
        )
    }

    // ------------------------------------------------------------------
    // Workspaces
    // ------------------------------------------------------------------

    /// Creates a workspace.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] on failure.
    pub fn create_workspace(&self, name: &str) -> Result<WorkspaceRow, DbError> {
        let row = WorkspaceRow {
            id: WorkspaceId::generate(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        let conn = self.lock();
        conn.execute(
            "INSERT INTO workspaces (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![row.id.to_string(), row.name, row.created_at.to_rfc3339()],
        )?;
        Ok(row)
    }

    /// Fetches a workspace by id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for unknown ids.
    pub fn get_workspace(&self, id: WorkspaceId) -> Result<WorkspaceRow, DbError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, name, created_at FROM workspaces WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?
        .ok_or(DbError::NotFound)
        .and_then(|(id, name, created_at)| {
            Ok(WorkspaceRow {
                id: parse_id(&id)?,
                name,
                created_at: parse_ts(&created_at)?,
            })
        })
    }

    // ------------------------------------------------------------------
    // Integrations
    // ------------------------------------------------------------------

    /// Stores or rotates the backend integration for a workspace.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] on failure.
    pub fn upsert_integration(
        &self,
        workspace_id: WorkspaceId,
        provider: &str,
        sealed: &SealedSecret,
        token_last4: &str,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO integrations
                 (workspace_id, provider, active, token_ciphertext, wrapped_dek,
                  token_last4, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(workspace_id) DO UPDATE SET
                 provider = ?2, active = 1, token_ciphertext = ?3,
                 wrapped_dek = ?4, token_last4 = ?5, updated_at = ?6",
            params![
                workspace_id.to_string(),
                provider,
                sealed.ciphertext,
                sealed.wrapped_dek,
                token_last4,
                now
            ],
        )?;
        Ok(())
    }

    /// Fetches the active integration for a workspace.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] when none exists or it is disabled.
    pub fn get_active_integration(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<IntegrationRow, DbError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT provider, active, token_ciphertext, wrapped_dek, token_last4
             FROM integrations WHERE workspace_id = ?1 AND active = 1",
            params![workspace_id.to_string()],
            |row| {
                Ok(IntegrationRow {
                    workspace_id,
                    provider: row.get(0)?,
                    active: row.get::<_, i64>(1)? != 0,
                    sealed_token: SealedSecret {
                        ciphertext: row.get(2)?,
                        wrapped_dek: row.get(3)?,
                    },
                    token_last4: row.get(4)?,
                })
            },
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Disables a workspace's integration.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] when no integration exists.
    pub fn disable_integration(&self, workspace_id: WorkspaceId) -> Result<(), DbError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE integrations SET active = 0, updated_at = ?2 WHERE workspace_id = ?1",
            params![workspace_id.to_string(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // CI secrets
    // ------------------------------------------------------------------

    /// Stores (or rotates) the envelope-sealed CI secret for a workspace.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] on failure.
    pub fn set_ci_secret(
        &self,
        workspace_id: WorkspaceId,
        sealed: &SealedSecret,
    ) -> Result<(), DbError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO ci_secrets (workspace_id, secret_ciphertext, wrapped_dek, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(workspace_id) DO UPDATE SET
                 secret_ciphertext = ?2, wrapped_dek = ?3, created_at = ?4",
            params![
                workspace_id.to_string(),
                sealed.ciphertext,
                sealed.wrapped_dek,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Fetches the sealed CI secret for a workspace.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] when none is configured.
    pub fn get_ci_secret(&self, workspace_id: WorkspaceId) -> Result<SealedSecret, DbError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT secret_ciphertext, wrapped_dek FROM ci_secrets WHERE workspace_id = ?1",
            params![workspace_id.to_string()],
            |row| {
                Ok(SealedSecret {
                    ciphertext: row.get(0)?,
                    wrapped_dek: row.get(1)?,
                })
            },
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    // ------------------------------------------------------------------
    // Capabilities
    // ------------------------------------------------------------------

    /// Replaces the workspace's current capabilities record atomically.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] on failure.
    pub fn set_capabilities(&self, row: &CapabilitiesRow) -> Result<(), DbError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO capabilities
                 (workspace_id, capabilities_blob_id, metric_mapping_blob_id,
                  probed_at, source_probe_run_id)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(workspace_id) DO UPDATE SET
                 capabilities_blob_id = ?2, metric_mapping_blob_id = ?3,
                 probed_at = ?4, source_probe_run_id = ?5",
            params![
                row.workspace_id.to_string(),
                row.capabilities_blob_id.to_string(),
                row.metric_mapping_blob_id.to_string(),
                row.probed_at.to_rfc3339(),
                row.source_probe_run_id
            ],
        )?;
        Ok(())
    }

    /// Fetches the current capabilities record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] when the workspace was never probed.
    pub fn get_capabilities(&self, workspace_id: WorkspaceId) -> Result<CapabilitiesRow, DbError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT capabilities_blob_id, metric_mapping_blob_id, probed_at,
                    source_probe_run_id
             FROM capabilities WHERE workspace_id = ?1",
            params![workspace_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?
        .ok_or(DbError::NotFound)
        .and_then(|(caps, mapping, probed_at, probe_run)| {
            Ok(CapabilitiesRow {
                workspace_id,
                capabilities_blob_id: parse_id(&caps)?,
                metric_mapping_blob_id: parse_id(&mapping)?,
                probed_at: parse_ts(&probed_at)?,
                source_probe_run_id: probe_run,
            })
        })
    }

    // ------------------------------------------------------------------
    // Promptpacks
    // ------------------------------------------------------------------

    /// Creates or updates a promptpack version.
    ///
    /// Published versions are immutable: rewriting identical content is an
    /// idempotent no-op, differing content is a conflict.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Conflict`] for writes against published content.
    pub fn upsert_promptpack(
        &self,
        workspace_id: WorkspaceId,
        logical_id: &str,
        version: &str,
        content: &PromptPackContent,
        sha256: &str,
    ) -> Result<(), DbError> {
        let content_json =
            serde_json::to_string(content).map_err(|e| DbError::Corrupt {
                message: e.to_string(),
            })?;
        let conn = self.lock();
        let existing: Option<(String, bool)> = conn
            .query_row(
                "SELECT sha256, published FROM promptpacks
                 WHERE workspace_id = ?1 AND logical_id = ?2 AND version = ?3",
                params![workspace_id.to_string(), logical_id, version],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
            )
            .optional()?;

        match existing {
            Some((stored_sha, true)) => {
                if stored_sha == sha256 {
                    Ok(())
                } else {
                    Err(DbError::Conflict {
                        message: format!(
                            "promptpack {logical_id}@{version} is published and immutable"
                        ),
                    })
                }
            }
            Some((_, false)) => {
                conn.execute(
                    "UPDATE promptpacks SET sha256 = ?4, content = ?5
                     WHERE workspace_id = ?1 AND logical_id = ?2 AND version = ?3",
                    params![
                        workspace_id.to_string(),
                        logical_id,
                        version,
                        sha256,
                        content_json
                    ],
                )?;
                Ok(())
            }
            None => {
                conn.execute(
                    "INSERT INTO promptpacks
                         (workspace_id, logical_id, version, sha256, content, published)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                    params![
                        workspace_id.to_string(),
                        logical_id,
                        version,
                        sha256,
                        content_json
                    ],
                )?;
                Ok(())
            }
        }
    }

    /// Publishes a promptpack version, freezing its content.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for unknown versions.
    pub fn publish_promptpack(
        &self,
        workspace_id: WorkspaceId,
        logical_id: &str,
        version: &str,
    ) -> Result<(), DbError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE promptpacks SET published = 1
             WHERE workspace_id = ?1 AND logical_id = ?2 AND version = ?3",
            params![workspace_id.to_string(), logical_id, version],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Fetches one promptpack version.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for unknown versions.
    pub fn get_promptpack(
        &self,
        workspace_id: WorkspaceId,
        logical_id: &str,
        version: &str,
    ) -> Result<PromptPackRow, DbError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT sha256, content, published FROM promptpacks
             WHERE workspace_id = ?1 AND logical_id = ?2 AND version = ?3",
            params![workspace_id.to_string(), logical_id, version],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? != 0,
                ))
            },
        )
        .optional()?
        .ok_or(DbError::NotFound)
        .and_then(|(sha256, content_json, published)| {
            let content =
                serde_json::from_str(&content_json).map_err(|e| DbError::Corrupt {
                    message: format!("promptpack content: {e}"),
                })?;
            Ok(PromptPackRow {
                workspace_id,
                logical_id: logical_id.to_string(),
                version: version.to_string(),
                sha256,
                content,
                published,
            })
        })
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    /// Creates a pipeline. Names are unique per workspace.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Conflict`] for duplicate names.
    pub fn create_pipeline(&self, pipeline: &Pipeline) -> Result<(), DbError> {
        let config = serde_json::to_string(pipeline).map_err(|e| DbError::Corrupt {
            message: e.to_string(),
        })?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO pipelines (id, workspace_id, name, config) VALUES (?1, ?2, ?3, ?4)",
            params![
                pipeline.id.to_string(),
                pipeline.workspace_id.to_string(),
                pipeline.name,
                config
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                DbError::Conflict {
                    message: format!("pipeline name {} already exists", pipeline.name),
                }
            }
            other => DbError::Sqlite(other),
        })?;
        Ok(())
    }

    /// Fetches a pipeline by id within a workspace.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for unknown or cross-tenant ids.
    pub fn get_pipeline(
        &self,
        workspace_id: WorkspaceId,
        pipeline_id: PipelineId,
    ) -> Result<Pipeline, DbError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT config FROM pipelines WHERE id = ?1 AND workspace_id = ?2",
            params![pipeline_id.to_string(), workspace_id.to_string()],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .ok_or(DbError::NotFound)
        .and_then(|config| {
            serde_json::from_str(&config).map_err(|e| DbError::Corrupt {
                message: format!("pipeline config: {e}"),
            })
        })
    }

    /// Fetches a pipeline by name within a workspace.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for unknown names.
    pub fn get_pipeline_by_name(
        &self,
        workspace_id: WorkspaceId,
        name: &str,
    ) -> Result<Pipeline, DbError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT config FROM pipelines WHERE workspace_id = ?1 AND name = ?2",
            params![workspace_id.to_string(), name],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .ok_or(DbError::NotFound)
        .and_then(|config| {
            serde_json::from_str(&config).map_err(|e| DbError::Corrupt {
                message: format!("pipeline config: {e}"),
            })
        })
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Creates a run in `queued`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] on failure.
    pub fn create_run(
        &self,
        workspace_id: WorkspaceId,
        pipeline_id: PipelineId,
        model_artifact_id: ArtifactId,
        trigger: RunTrigger,
    ) -> Result<RunRow, DbError> {
        let now = Utc::now();
        let row = RunRow {
            id: RunId::generate(),
            workspace_id,
            pipeline_id,
            trigger,
            state: RunState::Queued,
            model_artifact_id,
            normalized_metrics: None,
            gates_eval: None,
            bundle_artifact_id: None,
            error_code: None,
            error_detail: None,
            created_at: now,
            updated_at: now,
        };
        let conn = self.lock();
        conn.execute(
            "INSERT INTO runs
                 (id, workspace_id, pipeline_id, trigger, state, model_artifact_id,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                row.id.to_string(),
                workspace_id.to_string(),
                pipeline_id.to_string(),
                trigger.as_str(),
                row.state.as_str(),
                model_artifact_id.to_string(),
                now.to_rfc3339()
            ],
        )?;
        drop(conn);
        self.append_audit(&AuditEvent::new(
            workspace_id,
            match trigger {
                RunTrigger::Manual => Actor::System,
                RunTrigger::Ci => Actor::Ci,
            },
            "run.created",
            serde_json::json!({
                "run_id": row.id,
                "pipeline_id": pipeline_id,
                "trigger": trigger.as_str(),
            }),
        ))?;
        Ok(row)
    }

    /// Fetches a run within a workspace.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for unknown or cross-tenant ids.
    pub fn get_run(&self, workspace_id: WorkspaceId, run_id: RunId) -> Result<RunRow, DbError> {
        let conn = self.lock();
        let raw = conn
            .query_row(
                "SELECT id, workspace_id, pipeline_id, trigger, state, model_artifact_id,
                        normalized_metrics, gates_eval, bundle_artifact_id,
                        error_code, error_detail, created_at, updated_at
                 FROM runs WHERE id = ?1 AND workspace_id = ?2",
                params![run_id.to_string(), workspace_id.to_string()],
                row_to_raw_run,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;
        raw_to_run(raw)
    }

    /// Transitions a run, enforcing the state machine and writing the
    /// audit event inside the same critical section.
    ///
    /// # Errors
    ///
    /// - [`DbError::NotFound`] for unknown runs
    /// - [`DbError::InvalidTransition`] for illegal edges
    pub fn transition_run(
        &self,
        workspace_id: WorkspaceId,
        run_id: RunId,
        to: RunState,
        updates: RunUpdates,
    ) -> Result<RunRow, DbError> {
        let conn = self.lock();

        let current: String = conn
            .query_row(
                "SELECT state FROM runs WHERE id = ?1 AND workspace_id = ?2",
                params![run_id.to_string(), workspace_id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(DbError::NotFound)?;
        let from = RunState::from_str(&current).map_err(|e| DbError::Corrupt {
            message: e.to_string(),
        })?;

        if !can_transition(from, to) {
            return Err(DbError::InvalidTransition { from, to });
        }

        let now = Utc::now();
        conn.execute(
            "UPDATE runs SET
                 state = ?3,
                 normalized_metrics = COALESCE(?4, normalized_metrics),
                 gates_eval = COALESCE(?5, gates_eval),
                 bundle_artifact_id = COALESCE(?6, bundle_artifact_id),
                 error_code = COALESCE(?7, error_code),
                 error_detail = COALESCE(?8, error_detail),
                 updated_at = ?9
             WHERE id = ?1 AND workspace_id = ?2",
            params![
                run_id.to_string(),
                workspace_id.to_string(),
                to.as_str(),
                updates.normalized_metrics.map(|v| v.to_string()),
                updates.gates_eval.map(|v| v.to_string()),
                updates.bundle_artifact_id.map(|id| id.to_string()),
                updates.error_code.map(|c| c.as_str().to_string()),
                updates.error_detail,
                now.to_rfc3339()
            ],
        )?;

        let audit = AuditEvent::run_state_changed(workspace_id, run_id, from.as_str(), to.as_str());
        conn.execute(
            "INSERT INTO audit_events (workspace_id, actor, event_type, payload, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                workspace_id.to_string(),
                serde_json::to_string(&audit.actor).unwrap_or_default(),
                audit.event_type,
                audit.payload.to_string(),
                audit.ts.to_rfc3339()
            ],
        )?;
        info!(run_id = %run_id, from = %from, to = %to, "run state transition");

        drop(conn);
        self.get_run(workspace_id, run_id)
    }

    /// Whether the workspace has a run past `queued` and not yet terminal.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] on failure.
    pub fn has_active_run(&self, workspace_id: WorkspaceId) -> Result<bool, DbError> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs
             WHERE workspace_id = ?1
               AND state NOT IN ('queued', 'passed', 'failed', 'error')",
            params![workspace_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Oldest queued run per workspace with no active run, dispatch order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] on failure.
    pub fn claimable_runs(&self) -> Result<Vec<(WorkspaceId, RunId)>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT r.workspace_id, r.id FROM runs r
             WHERE r.state = 'queued'
               AND NOT EXISTS (
                   SELECT 1 FROM runs a
                   WHERE a.workspace_id = r.workspace_id
                     AND a.state NOT IN ('queued', 'passed', 'failed', 'error'))
               AND r.created_at = (
                   SELECT MIN(q.created_at) FROM runs q
                   WHERE q.workspace_id = r.workspace_id AND q.state = 'queued')
             ORDER BY r.created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (ws, id) = row?;
            out.push((parse_id::<WorkspaceId>(&ws)?, parse_id::<RunId>(&id)?));
        }
        Ok(out)
    }

    /// Runs currently past `queued` and not yet terminal, with their
    /// states. Used for crash recovery at startup.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] on failure.
    pub fn active_runs(&self) -> Result<Vec<(WorkspaceId, RunId, RunState)>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT workspace_id, id, state FROM runs
             WHERE state NOT IN ('queued', 'passed', 'failed', 'error')
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (ws, id, state) = row?;
            out.push((
                parse_id::<WorkspaceId>(&ws)?,
                parse_id::<RunId>(&id)?,
                state.parse().map_err(|e: crate::runs::state::UnknownRunState| {
                    DbError::Corrupt {
                        message: e.to_string(),
                    }
                })?,
            ));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Nonces
    // ------------------------------------------------------------------

    /// Spends a nonce. The row's existence proves the spend; a second
    /// insert with the same `(workspace, nonce)` is a replay.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Replay`] when the nonce was already used.
    pub fn spend_nonce(
        &self,
        workspace_id: WorkspaceId,
        nonce: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO ci_nonces (workspace_id, nonce, used_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                workspace_id.to_string(),
                nonce,
                Utc::now().to_rfc3339(),
                expires_at.to_rfc3339()
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                DbError::Replay
            }
            other => DbError::Sqlite(other),
        })?;
        Ok(())
    }

    /// Deletes nonce rows whose `expires_at` is in the past. Returns how
    /// many were purged.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] on failure.
    pub fn purge_expired_nonces(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.lock();
        Ok(conn.execute(
            "DELETE FROM ci_nonces WHERE expires_at < ?1",
            params![now.to_rfc3339()],
        )?)
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    /// Appends an audit event.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] on failure.
    pub fn append_audit(&self, event: &AuditEvent) -> Result<(), DbError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO audit_events (workspace_id, actor, event_type, payload, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.workspace_id.to_string(),
                serde_json::to_string(&event.actor).map_err(|e| DbError::Corrupt {
                    message: e.to_string()
                })?,
                event.event_type,
                event.payload.to_string(),
                event.ts.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// All audit event types for a workspace, in sequence order. Test and
    /// inspection helper.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlite`] on failure.
    pub fn audit_event_types(&self, workspace_id: WorkspaceId) -> Result<Vec<String>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT event_type FROM audit_events WHERE workspace_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![workspace_id.to_string()], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("connection lock poisoned")
    }
}

type RawRun = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn row_to_raw_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn raw_to_run(raw: RawRun) -> Result<RunRow, DbError> {
    let (
        id,
        workspace_id,
        pipeline_id,
        trigger,
        state,
        model_artifact_id,
        normalized_metrics,
        gates_eval,
        bundle_artifact_id,
        error_code,
        error_detail,
        created_at,
        updated_at,
    ) = raw;

    Ok(RunRow {
        id: parse_id(&id)?,
        workspace_id: parse_id(&workspace_id)?,
        pipeline_id: parse_id(&pipeline_id)?,
        trigger: match trigger.as_str() {
            "manual" => RunTrigger::Manual,
            "ci" => RunTrigger::Ci,
            other => {
                return Err(DbError::Corrupt {
                    message: format!("unknown trigger {other}"),
                })
            }
        },
        state: state.parse().map_err(|e: crate::runs::state::UnknownRunState| {
            DbError::Corrupt {
                message: e.to_string(),
            }
        })?,
        model_artifact_id: parse_id(&model_artifact_id)?,
        normalized_metrics: parse_opt_json(normalized_metrics)?,
        gates_eval: parse_opt_json(gates_eval)?,
        bundle_artifact_id: bundle_artifact_id.map(|s| parse_id(&s)).transpose()?,
        error_code: error_code
            .map(|s| {
                s.parse::<ErrorCode>().map_err(|e| DbError::Corrupt {
                    message: e.to_string(),
                })
            })
            .transpose()?,
        error_detail,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn parse_id<T: FromStr<Err = uuid::Error>>(s: &str) -> Result<T, DbError> {
    s.parse().map_err(|_| DbError::Corrupt {
        message: format!("malformed id {s}"),
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Corrupt {
            message: format!("malformed timestamp {s}: {e}"),
        })
}

fn parse_opt_json(s: Option<String>) -> Result<Option<Value>, DbError> {
    s.map(|raw| {
        serde_json::from_str(&raw).map_err(|e| DbError::Corrupt {
            message: format!("malformed json column: {e}"),
        })
    })
    .transpose()
}
