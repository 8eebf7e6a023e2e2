use super::archive::copy_tree;
use super::{CommandRunner, CommandSpec, Result};
use crate::config::RemoteStorageConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Off-site copy of a backup directory
#[async_trait]
pub trait RemoteStorage: Send + Sync + std::fmt::Debug {
    /// Upload the whole directory; returns the remote location
    async fn upload(&self, backup_id: &str, local_dir: &Path) -> Result<String>;

    async fn delete(&self, remote_path: &str) -> Result<()>;
}

/// S3 or S3-compatible storage through the `aws` CLI
#[derive(Debug)]
pub struct S3CliRemoteStorage {
    config: RemoteStorageConfig,
    runner: Arc<dyn CommandRunner>,
}

impl S3CliRemoteStorage {
    pub fn new(config: RemoteStorageConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn remote_path(&self, backup_id: &str) -> String {
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("s3://{}/{}", self.config.bucket, backup_id)
        } else {
            format!("s3://{}/{}/{}", self.config.bucket, prefix, backup_id)
        }
    }

    fn s3(&self, subcommand: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.config.tool)
            .arg("s3")
            .arg(subcommand)
            .arg("--recursive")
            .arg("--only-show-errors")
            .timeout(UPLOAD_TIMEOUT);

        if let Some(endpoint) = &self.config.endpoint_url {
            spec = spec.arg("--endpoint-url").arg(endpoint);
        }
        if let Some(region) = &self.config.region {
            spec = spec.arg("--region").arg(region);
        }
        if let Some(key_id) = &self.config.access_key_id {
            spec = spec.env("AWS_ACCESS_KEY_ID", key_id.expose());
        }
        if let Some(secret) = &self.config.secret_access_key {
            spec = spec.env("AWS_SECRET_ACCESS_KEY", secret.expose());
        }
        spec
    }
}

#[async_trait]
impl RemoteStorage for S3CliRemoteStorage {
    async fn upload(&self, backup_id: &str, local_dir: &Path) -> Result<String> {
        let remote = self.remote_path(backup_id);
        info!("Uploading backup {} to {}", backup_id, remote);

        let spec = self
            .s3("cp")
            .arg(local_dir.to_string_lossy())
            .arg(&remote);
        self.runner.run(&spec).await?;
        Ok(remote)
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        info!("Removing remote copy {}", remote_path);
        let spec = self.s3("rm").arg(remote_path);
        self.runner.run(&spec).await?;
        Ok(())
    }
}

/// Copy a backup directory under each redundant root as `<root>/<id>`
pub async fn replicate_redundant(
    local_dir: &Path,
    backup_id: &str,
    roots: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    let mut copies = Vec::with_capacity(roots.len());
    for root in roots {
        let target = root.join(backup_id);
        let files = copy_tree(local_dir, &target, None).await?;
        info!(
            "Copied {} files of backup {} to {}",
            files,
            backup_id,
            target.display()
        );
        copies.push(target);
    }
    Ok(copies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::ProcessCommandRunner;
    use tempfile::TempDir;

    #[test]
    fn remote_path_joins_bucket_prefix_and_id() {
        let runner = Arc::new(ProcessCommandRunner::new());
        let storage = S3CliRemoteStorage::new(
            RemoteStorageConfig {
                bucket: "dr-bucket".to_string(),
                prefix: "/nightly/".to_string(),
                ..RemoteStorageConfig::default()
            },
            runner.clone(),
        );
        assert_eq!(storage.remote_path("b1"), "s3://dr-bucket/nightly/b1");

        let bare = S3CliRemoteStorage::new(
            RemoteStorageConfig {
                bucket: "dr-bucket".to_string(),
                prefix: String::new(),
                ..RemoteStorageConfig::default()
            },
            runner,
        );
        assert_eq!(bare.remote_path("b1"), "s3://dr-bucket/b1");
    }

    #[tokio::test]
    async fn redundant_copies_mirror_the_backup_directory() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("backups/b1");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join("relational_b1.dump"), b"dump").unwrap();

        let mirror = dir.path().join("mirror");
        let copies = replicate_redundant(&local, "b1", &[mirror.clone()])
            .await
            .unwrap();
        assert_eq!(copies, vec![mirror.join("b1")]);
        assert_eq!(
            std::fs::read(mirror.join("b1/relational_b1.dump")).unwrap(),
            b"dump"
        );
    }
}
