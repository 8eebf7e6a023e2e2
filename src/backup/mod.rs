pub mod adapters;
pub mod archive;
pub mod backup_manager;
pub mod backup_verification;
pub mod command;
pub mod encryption;
pub mod point_in_time_recovery;
pub mod replication;
pub mod repository;
pub mod retention;
pub mod scheduler;
pub mod services;

pub use adapters::*;
pub use backup_manager::*;
pub use backup_verification::*;
pub use command::*;
pub use encryption::*;
pub use point_in_time_recovery::*;
pub use replication::*;
pub use repository::*;
pub use retention::*;
pub use scheduler::*;
pub use services::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
    Log,
    Differential,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Log => "log",
            BackupType::Differential => "differential",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Success,
    Failed,
}

impl BackupStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BackupStatus::InProgress)
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Success => "success",
            BackupStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The kinds of store a backup can cover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Relational,
    Document,
    KeyValue,
    Filesystem,
}

impl StoreKind {
    /// Order in which stores are backed up and restored
    pub const BACKUP_ORDER: [StoreKind; 4] = [
        StoreKind::Relational,
        StoreKind::Document,
        StoreKind::KeyValue,
        StoreKind::Filesystem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Relational => "relational",
            StoreKind::Document => "document",
            StoreKind::KeyValue => "key_value",
            StoreKind::Filesystem => "filesystem",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StoreKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        StoreKind::BACKUP_ORDER
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| BackupError::Configuration {
                message: format!("Unknown store '{s}'"),
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupLocation {
    pub local_path: PathBuf,
    pub remote_path: Option<String>,
    #[serde(default)]
    pub redundant_copies: Vec<PathBuf>,
}

/// What one store contributed to a backup: a single artifact file
/// relative to the backup's local directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreArtifact {
    pub store: StoreKind,
    pub file_name: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub compressed: bool,
    pub encrypted: bool,
    /// Hex nonce, also embedded in the encrypted file header
    pub iv: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub timestamp: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    pub checksum: String,
    pub encrypted: bool,
    pub compressed: bool,
    pub retention_until: DateTime<Utc>,
    pub databases: BTreeSet<StoreKind>,
    pub status: BackupStatus,
    /// Instant the captured state corresponds to
    pub recovery_point: DateTime<Utc>,
    /// Base full backup of an incremental
    pub parent_id: Option<String>,
    pub location: BackupLocation,
    pub artifacts: Vec<StoreArtifact>,
    pub error_message: Option<String>,
}

impl BackupMetadata {
    pub fn begin(
        id: String,
        backup_type: BackupType,
        timestamp: DateTime<Utc>,
        retention_until: DateTime<Utc>,
        local_path: PathBuf,
    ) -> Self {
        Self {
            id,
            backup_type,
            timestamp,
            completed_at: None,
            size_bytes: 0,
            checksum: String::new(),
            encrypted: false,
            compressed: false,
            retention_until,
            databases: BTreeSet::new(),
            status: BackupStatus::InProgress,
            recovery_point: timestamp,
            parent_id: None,
            location: BackupLocation {
                local_path,
                remote_path: None,
                redundant_copies: Vec::new(),
            },
            artifacts: Vec::new(),
            error_message: None,
        }
    }

    pub fn record_artifact(&mut self, artifact: StoreArtifact) {
        self.databases.insert(artifact.store);
        self.encrypted |= artifact.encrypted;
        self.compressed |= artifact.compressed;
        self.artifacts.push(artifact);
    }

    pub fn artifact_for(&self, store: StoreKind) -> Option<&StoreArtifact> {
        self.artifacts.iter().find(|a| a.store == store)
    }

    pub fn complete(
        &mut self,
        size_bytes: u64,
        checksum: String,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(BackupStatus::Success)?;
        self.size_bytes = size_bytes;
        self.checksum = checksum;
        self.completed_at = Some(at);
        Ok(())
    }

    pub fn fail(&mut self, message: String, at: DateTime<Utc>) -> Result<()> {
        self.transition(BackupStatus::Failed)?;
        self.error_message = Some(message);
        self.completed_at = Some(at);
        Ok(())
    }

    pub fn is_restorable(&self) -> bool {
        self.status == BackupStatus::Success
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.retention_until <= now
    }

    fn transition(&mut self, to: BackupStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BackupError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Precondition failed: {message}")]
    Precondition { message: String },

    #[error("Tool execution failed: {tool} {args} ({status}): {stderr}")]
    ToolExecution {
        tool: String,
        args: String,
        status: String,
        stderr: String,
    },

    #[error("Integrity check failed: {message}")]
    Integrity { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Encryption error: {message}")]
    Encryption { message: String },

    #[error("Archive error: {message}")]
    Archive { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Timeout error: operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: BackupStatus, to: BackupStatus },

    #[error("Store unavailable: {store}: {message}")]
    StoreUnavailable { store: StoreKind, message: String },

    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    #[error("Notification error: {message}")]
    Notification { message: String },
}

impl BackupError {
    /// Errors that mean the artifact itself is bad, as opposed to the
    /// environment failing underneath the check.
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            BackupError::ToolExecution { .. }
                | BackupError::Integrity { .. }
                | BackupError::Encryption { .. }
                | BackupError::Archive { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
