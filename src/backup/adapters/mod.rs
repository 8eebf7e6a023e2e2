//! Store adapters produce one artifact per store per backup and know how to
//! put it back.

pub mod document;
pub mod filesystem;
pub mod key_value;
pub mod relational;

pub use document::DocumentAdapter;
pub use filesystem::FilesystemAdapter;
pub use key_value::KeyValueAdapter;
pub use relational::RelationalAdapter;

use super::{
    decrypted_file_name, ArtifactCipher, BackupError, BackupType, CommandRunner, Result,
    StoreArtifact, StoreKind,
};
use crate::config::BackupConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where one backup run writes
#[derive(Debug, Clone)]
pub struct BackupContext {
    pub backup_id: String,
    pub backup_type: BackupType,
    /// Cutoff for incremental runs (the base full backup's timestamp)
    pub since: Option<DateTime<Utc>>,
    /// Final artifact directory, `<root>/backups/<id>`
    pub artifact_dir: PathBuf,
    /// Scratch space removed after the run, `<root>/work/<id>`
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RestoreContext {
    /// Directory holding the backup's artifacts
    pub artifact_dir: PathBuf,
    /// Scratch space for decrypted and extracted files
    pub scratch_dir: PathBuf,
}

#[async_trait]
pub trait StoreAdapter: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> StoreKind;

    /// Fails fast with `StoreUnavailable` when the store cannot be reached
    async fn check_connection(&self) -> Result<()>;

    async fn backup(&self, ctx: &BackupContext) -> Result<StoreArtifact>;

    async fn restore(&self, artifact: &StoreArtifact, ctx: &RestoreContext) -> Result<()>;

    /// Prove the artifact is restorable without touching the live store
    async fn verify_sandbox(&self, artifact: &StoreArtifact, ctx: &RestoreContext) -> Result<()>;
}

/// Adapters for every enabled store, in backup order
pub fn build_adapters(
    config: &BackupConfig,
    runner: Arc<dyn CommandRunner>,
) -> Result<Vec<Arc<dyn StoreAdapter>>> {
    let mut adapters: Vec<Arc<dyn StoreAdapter>> = Vec::new();

    for store in config.enabled_stores() {
        let cipher = config
            .encryption_key_for(store)
            .map(|key| ArtifactCipher::from_passphrase(key.expose()))
            .transpose()?;

        let adapter: Arc<dyn StoreAdapter> = match store {
            StoreKind::Relational => Arc::new(RelationalAdapter::new(
                config.relational.clone(),
                runner.clone(),
                cipher,
            )),
            StoreKind::Document => Arc::new(DocumentAdapter::new(
                config.document.clone(),
                runner.clone(),
                cipher,
            )),
            StoreKind::KeyValue => Arc::new(KeyValueAdapter::new(
                config.key_value.clone(),
                runner.clone(),
                cipher,
            )),
            StoreKind::Filesystem => {
                Arc::new(FilesystemAdapter::new(config.filesystem.clone(), cipher))
            }
        };
        adapters.push(adapter);
    }

    Ok(adapters)
}

/// Encrypt if a cipher is configured, then measure and hash the file
pub(crate) async fn finalize_artifact(
    store: StoreKind,
    path: PathBuf,
    artifact_dir: &Path,
    compressed: bool,
    cipher: Option<&ArtifactCipher>,
) -> Result<StoreArtifact> {
    let (path, iv) = match cipher {
        Some(cipher) => {
            let encrypted = cipher.encrypt_file_in_place(&path).await?;
            (encrypted.path, Some(encrypted.iv))
        }
        None => (path, None),
    };

    let file_name = path
        .strip_prefix(artifact_dir)
        .map_err(|_| BackupError::Configuration {
            message: format!(
                "Artifact {} is outside {}",
                path.display(),
                artifact_dir.display()
            ),
        })?
        .to_string_lossy()
        .into_owned();

    let size_bytes = tokio::fs::metadata(&path).await?.len();
    let checksum = file_checksum(&path).await?;

    Ok(StoreArtifact {
        store,
        file_name,
        size_bytes,
        checksum,
        compressed,
        encrypted: iv.is_some(),
        iv,
    })
}

/// Plaintext path of an artifact, decrypting into scratch space when needed
pub(crate) async fn prepare_artifact(
    artifact: &StoreArtifact,
    ctx: &RestoreContext,
    cipher: Option<&ArtifactCipher>,
) -> Result<PathBuf> {
    let source = ctx.artifact_dir.join(&artifact.file_name);
    if !artifact.encrypted {
        return Ok(source);
    }

    let cipher = cipher.ok_or_else(|| BackupError::Encryption {
        message: format!(
            "Artifact {} is encrypted but no key is configured for {}",
            artifact.file_name, artifact.store
        ),
    })?;

    let target = ctx
        .scratch_dir
        .join(decrypted_file_name(&artifact.file_name));
    cipher.decrypt_file(&source, &target).await?;
    Ok(target)
}

/// Streaming SHA-256 of a file, hex encoded
pub async fn file_checksum(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    let checksum = tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await??;
    Ok(checksum)
}

/// Wrap a probe failure as `StoreUnavailable`
pub(crate) fn unavailable(store: StoreKind, err: BackupError) -> BackupError {
    match err {
        BackupError::StoreUnavailable { .. } => err,
        other => BackupError::StoreUnavailable {
            store,
            message: other.to_string(),
        },
    }
}
