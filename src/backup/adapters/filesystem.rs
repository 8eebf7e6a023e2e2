use super::{finalize_artifact, prepare_artifact, BackupContext, RestoreContext, StoreAdapter};
use crate::backup::archive::{copy_tree, create_tar_gz, extract_tar_gz};
use crate::backup::{ArtifactCipher, BackupError, BackupType, Result, StoreArtifact, StoreKind};
use crate::config::FilesystemConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const MANIFEST_FILE: &str = "MANIFEST.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub staged_name: String,
    pub original_path: PathBuf,
    pub files: u64,
}

/// Maps staged directory names back to where they came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemManifest {
    pub entries: Vec<ManifestEntry>,
    /// Set for incremental runs: only files modified after this were staged
    pub since: Option<DateTime<Utc>>,
}

/// Copies an allow-list of directories into staging and archives it.
/// Symlinks are kept as links.
#[derive(Debug)]
pub struct FilesystemAdapter {
    config: FilesystemConfig,
    cipher: Option<ArtifactCipher>,
}

impl FilesystemAdapter {
    pub fn new(config: FilesystemConfig, cipher: Option<ArtifactCipher>) -> Self {
        Self { config, cipher }
    }

    fn staged_name(index: usize, dir: &Path) -> String {
        let base = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        format!("{index:02}_{base}")
    }

    async fn extract(
        &self,
        artifact: &StoreArtifact,
        ctx: &RestoreContext,
    ) -> Result<(PathBuf, FilesystemManifest)> {
        let archive = prepare_artifact(artifact, ctx, self.cipher.as_ref()).await?;
        let staging = ctx.scratch_dir.join("filesystem");
        extract_tar_gz(&archive, &staging).await?;

        let raw = tokio::fs::read(staging.join(MANIFEST_FILE))
            .await
            .map_err(|e| BackupError::Integrity {
                message: format!("{} has no readable manifest: {e}", artifact.file_name),
            })?;
        let manifest: FilesystemManifest =
            serde_json::from_slice(&raw).map_err(|e| BackupError::Integrity {
                message: format!("{} has a corrupt manifest: {e}", artifact.file_name),
            })?;
        Ok((staging, manifest))
    }
}

#[async_trait]
impl StoreAdapter for FilesystemAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::Filesystem
    }

    async fn check_connection(&self) -> Result<()> {
        for dir in &self.config.directories {
            let is_dir = tokio::fs::metadata(dir)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if !is_dir {
                return Err(BackupError::StoreUnavailable {
                    store: self.kind(),
                    message: format!("{} is not a readable directory", dir.display()),
                });
            }
        }
        Ok(())
    }

    async fn backup(&self, ctx: &BackupContext) -> Result<StoreArtifact> {
        let staging = ctx.work_dir.join("filesystem");
        tokio::fs::create_dir_all(&staging).await?;

        let since = match ctx.backup_type {
            BackupType::Full => None,
            _ => ctx.since,
        };

        let mut entries = Vec::with_capacity(self.config.directories.len());
        for (index, dir) in self.config.directories.iter().enumerate() {
            let staged_name = Self::staged_name(index, dir);
            let files = copy_tree(dir, &staging.join(&staged_name), since).await?;
            info!(
                "Staged {} files from {} for backup {}",
                files,
                dir.display(),
                ctx.backup_id
            );
            entries.push(ManifestEntry {
                staged_name,
                original_path: dir.clone(),
                files,
            });
        }

        let manifest = FilesystemManifest { entries, since };
        tokio::fs::write(
            staging.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )
        .await?;

        let archive = ctx
            .artifact_dir
            .join(format!("filesystem_{}.tar.gz", ctx.backup_id));
        create_tar_gz(&staging, &archive).await?;
        tokio::fs::remove_dir_all(&staging).await?;

        finalize_artifact(
            self.kind(),
            archive,
            &ctx.artifact_dir,
            true,
            self.cipher.as_ref(),
        )
        .await
    }

    async fn restore(&self, artifact: &StoreArtifact, ctx: &RestoreContext) -> Result<()> {
        let (staging, manifest) = self.extract(artifact, ctx).await?;
        for entry in &manifest.entries {
            let copied = copy_tree(
                &staging.join(&entry.staged_name),
                &entry.original_path,
                None,
            )
            .await?;
            info!(
                "Restored {} files into {}",
                copied,
                entry.original_path.display()
            );
        }
        Ok(())
    }

    async fn verify_sandbox(&self, artifact: &StoreArtifact, ctx: &RestoreContext) -> Result<()> {
        let (staging, manifest) = self.extract(artifact, ctx).await?;
        for entry in &manifest.entries {
            if !staging.join(&entry.staged_name).is_dir() {
                return Err(BackupError::Integrity {
                    message: format!(
                        "{} is missing staged directory {}",
                        artifact.file_name, entry.staged_name
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn adapter(dirs: Vec<PathBuf>) -> FilesystemAdapter {
        FilesystemAdapter::new(
            FilesystemConfig {
                enabled: true,
                directories: dirs,
                encryption_key: None,
            },
            None,
        )
    }

    #[tokio::test]
    async fn backup_then_restore_round_trips_files() {
        let root = TempDir::new().unwrap();
        let source = root.path().join("etc-codex");
        std::fs::create_dir_all(source.join("conf.d")).unwrap();
        std::fs::write(source.join("app.toml"), b"port = 1").unwrap();
        std::fs::write(source.join("conf.d/extra.toml"), b"x = 2").unwrap();

        let artifact_dir = root.path().join("backups/b1");
        std::fs::create_dir_all(&artifact_dir).unwrap();
        let adapter = adapter(vec![source.clone()]);
        adapter.check_connection().await.unwrap();

        let artifact = adapter
            .backup(&BackupContext {
                backup_id: "b1".to_string(),
                backup_type: BackupType::Full,
                since: None,
                artifact_dir: artifact_dir.clone(),
                work_dir: root.path().join("work/b1"),
            })
            .await
            .unwrap();
        assert_eq!(artifact.file_name, "filesystem_b1.tar.gz");
        assert!(artifact.compressed);

        let ctx = RestoreContext {
            artifact_dir,
            scratch_dir: root.path().join("scratch"),
        };
        adapter.verify_sandbox(&artifact, &ctx).await.unwrap();

        std::fs::remove_dir_all(&source).unwrap();
        adapter.restore(&artifact, &ctx).await.unwrap();
        assert_eq!(std::fs::read(source.join("app.toml")).unwrap(), b"port = 1");
        assert_eq!(
            std::fs::read(source.join("conf.d/extra.toml")).unwrap(),
            b"x = 2"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_survive_backup_and_restore() {
        let root = TempDir::new().unwrap();
        let source = root.path().join("etc-app");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("real.conf"), b"level = 3").unwrap();
        std::os::unix::fs::symlink("real.conf", source.join("current.conf")).unwrap();

        let artifact_dir = root.path().join("backups/b1");
        std::fs::create_dir_all(&artifact_dir).unwrap();
        let adapter = adapter(vec![source.clone()]);
        let artifact = adapter
            .backup(&BackupContext {
                backup_id: "b1".to_string(),
                backup_type: BackupType::Full,
                since: None,
                artifact_dir: artifact_dir.clone(),
                work_dir: root.path().join("work/b1"),
            })
            .await
            .unwrap();

        std::fs::remove_dir_all(&source).unwrap();
        let ctx = RestoreContext {
            artifact_dir,
            scratch_dir: root.path().join("scratch"),
        };
        adapter.restore(&artifact, &ctx).await.unwrap();

        let link = source.join("current.conf");
        assert!(std::fs::symlink_metadata(&link)
            .unwrap()
            .file_type()
            .is_symlink());
        assert_eq!(std::fs::read_link(&link).unwrap(), PathBuf::from("real.conf"));
        assert_eq!(std::fs::read(&link).unwrap(), b"level = 3");
    }

    #[tokio::test]
    async fn missing_directory_is_unavailable() {
        let adapter = adapter(vec![PathBuf::from("/definitely/not/here")]);
        let err = adapter.check_connection().await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::StoreUnavailable {
                store: StoreKind::Filesystem,
                ..
            }
        ));
    }
}
