use super::{
    finalize_artifact, prepare_artifact, unavailable, BackupContext, RestoreContext, StoreAdapter,
};
use crate::backup::archive::{create_tar_gz, extract_tar_gz};
use crate::backup::{
    ArtifactCipher, BackupError, CommandRunner, CommandSpec, Result, StoreArtifact, StoreKind,
};
use crate::config::{mask_uri, DocumentConfig};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Tools config holding the connection URI, written next to the dump
pub const TOOLS_CONFIG_FILE: &str = "mongo-tools.yaml";

/// The probe shell reads the URI from here instead of argv
pub const URI_ENV: &str = "CODEX_BACKUP_DOCUMENT_URI";

/// Per-collection dumps through `mongodump`, archived into one tarball
#[derive(Debug)]
pub struct DocumentAdapter {
    config: DocumentConfig,
    runner: Arc<dyn CommandRunner>,
    cipher: Option<ArtifactCipher>,
}

impl DocumentAdapter {
    pub fn new(
        config: DocumentConfig,
        runner: Arc<dyn CommandRunner>,
        cipher: Option<ArtifactCipher>,
    ) -> Self {
        Self {
            config,
            runner,
            cipher,
        }
    }

    /// Write `uri: "<uri>"` into an owner-only file for `--config`
    async fn write_tools_config(&self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(TOOLS_CONFIG_FILE);
        // A JSON string is a valid YAML double-quoted scalar
        let body = format!("uri: {}\n", serde_json::to_string(self.config.uri.expose())?);

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&path).await?;
        file.write_all(body.as_bytes()).await?;
        file.sync_all().await?;
        Ok(path)
    }

    /// Run a dump/restore tool with the URI in a private config file that
    /// is removed whether or not the tool succeeds
    async fn run_with_uri(&self, spec: CommandSpec, config_dir: &Path) -> Result<()> {
        let config_path = self.write_tools_config(config_dir).await?;
        let spec = spec
            .arg(format!("--config={}", config_path.display()))
            .mask(self.config.uri.expose());
        let outcome = self.runner.run(&spec).await;

        if let Err(e) = tokio::fs::remove_file(&config_path).await {
            warn!(
                "Failed to remove tools config {}: {}",
                config_path.display(),
                e
            );
        } else {
            debug!("Removed tools config {}", config_path.display());
        }
        outcome.map(|_| ())
    }

    async fn extract(&self, artifact: &StoreArtifact, ctx: &RestoreContext) -> Result<PathBuf> {
        let archive = prepare_artifact(artifact, ctx, self.cipher.as_ref()).await?;
        let dump_dir = ctx.scratch_dir.join("document");
        extract_tar_gz(&archive, &dump_dir).await?;
        Ok(dump_dir)
    }
}

#[async_trait]
impl StoreAdapter for DocumentAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::Document
    }

    async fn check_connection(&self) -> Result<()> {
        let spec = CommandSpec::new(&self.config.probe_tool)
            .arg("--nodb")
            .arg("--quiet")
            .arg("--eval")
            .arg(format!(
                "connect(process.env.{URI_ENV}).adminCommand('ping').ok"
            ))
            .env(URI_ENV, self.config.uri.expose());
        self.runner
            .run(&spec)
            .await
            .map(|_| ())
            .map_err(|e| unavailable(self.kind(), e))
    }

    async fn backup(&self, ctx: &BackupContext) -> Result<StoreArtifact> {
        let dump_dir = ctx.work_dir.join("document");
        tokio::fs::create_dir_all(&dump_dir).await?;

        info!(
            "Dumping document store {} for backup {}",
            mask_uri(self.config.uri.expose()),
            ctx.backup_id
        );

        let mut spec =
            CommandSpec::new(&self.config.dump_tool).arg(format!("--out={}", dump_dir.display()));
        if let Some(database) = &self.config.database {
            spec = spec.arg(format!("--db={database}"));
        }
        self.run_with_uri(spec, &ctx.work_dir).await?;

        let archive = ctx
            .artifact_dir
            .join(format!("document_{}.tar.gz", ctx.backup_id));
        create_tar_gz(&dump_dir, &archive).await?;
        tokio::fs::remove_dir_all(&dump_dir).await?;

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
        let dump_dir = self.extract(artifact, ctx).await?;
        info!("Restoring document store from {}", artifact.file_name);

        let spec = CommandSpec::new(&self.config.restore_tool)
            .arg("--drop")
            .arg(format!("--dir={}", dump_dir.display()));
        self.run_with_uri(spec, &ctx.scratch_dir).await
    }

    async fn verify_sandbox(&self, artifact: &StoreArtifact, ctx: &RestoreContext) -> Result<()> {
        let dump_dir = self.extract(artifact, ctx).await?;
        let collections = count_collection_dumps(&dump_dir).await?;
        if collections == 0 {
            return Err(BackupError::Integrity {
                message: format!("{} contains no collection dumps", artifact.file_name),
            });
        }
        Ok(())
    }
}

async fn count_collection_dumps(dir: &Path) -> Result<usize> {
    let mut count = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "bson") {
                count += 1;
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupType, CommandOutput};
    use crate::config::Secret;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const URI: &str = "mongodb://admin:s3cret@db:27017";

    /// Records each call and what its `--config` file held at run time
    #[derive(Debug, Default)]
    struct ConfigCapturingRunner {
        calls: Mutex<Vec<(CommandSpec, Option<String>, Option<u32>)>>,
        fail: bool,
    }

    #[async_trait]
    impl CommandRunner for ConfigCapturingRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            let config = spec
                .raw_args()
                .iter()
                .find_map(|arg| arg.strip_prefix("--config=").map(PathBuf::from));
            let contents = config.as_ref().and_then(|p| std::fs::read_to_string(p).ok());
            #[cfg(unix)]
            let mode = config.as_ref().and_then(|p| {
                use std::os::unix::fs::PermissionsExt;
                std::fs::metadata(p).ok().map(|m| m.permissions().mode() & 0o777)
            });
            #[cfg(not(unix))]
            let mode = None;

            if let Some(out) = spec
                .raw_args()
                .iter()
                .find_map(|arg| arg.strip_prefix("--out="))
            {
                let db = Path::new(out).join("codex");
                std::fs::create_dir_all(&db).unwrap();
                std::fs::write(db.join("users.bson"), b"bson").unwrap();
            }

            self.calls
                .lock()
                .unwrap()
                .push((spec.clone(), contents, mode));
            if self.fail {
                return Err(spec.failure("exit status: 1", &format!("cannot reach {URI}")));
            }
            Ok(CommandOutput::default())
        }
    }

    fn adapter(runner: Arc<ConfigCapturingRunner>) -> DocumentAdapter {
        let config = DocumentConfig {
            uri: Secret::new(URI),
            ..DocumentConfig::default()
        };
        DocumentAdapter::new(config, runner, None)
    }

    fn context(root: &Path) -> BackupContext {
        let artifact_dir = root.join("backups/b1");
        std::fs::create_dir_all(&artifact_dir).unwrap();
        BackupContext {
            backup_id: "b1".to_string(),
            backup_type: BackupType::Full,
            since: None,
            artifact_dir,
            work_dir: root.join("work/b1"),
        }
    }

    #[tokio::test]
    async fn dump_reads_uri_from_private_config_file() {
        let root = TempDir::new().unwrap();
        let runner = Arc::new(ConfigCapturingRunner::default());
        let ctx = context(root.path());

        let artifact = adapter(runner.clone()).backup(&ctx).await.unwrap();
        assert_eq!(artifact.file_name, "document_b1.tar.gz");

        let calls = runner.calls.lock().unwrap();
        let (spec, contents, mode) = &calls[0];
        assert!(!spec.raw_args().iter().any(|arg| arg.contains("s3cret")));
        assert_eq!(contents.as_deref(), Some(format!("uri: \"{URI}\"\n").as_str()));
        #[cfg(unix)]
        assert_eq!(*mode, Some(0o600));
        assert!(!ctx.work_dir.join(TOOLS_CONFIG_FILE).exists());
    }

    #[tokio::test]
    async fn failed_restore_still_removes_config_and_masks_uri() {
        let root = TempDir::new().unwrap();
        let ctx = context(root.path());
        let artifact = adapter(Arc::new(ConfigCapturingRunner::default()))
            .backup(&ctx)
            .await
            .unwrap();

        let failing = Arc::new(ConfigCapturingRunner {
            fail: true,
            ..ConfigCapturingRunner::default()
        });
        let restore_ctx = RestoreContext {
            artifact_dir: ctx.artifact_dir.clone(),
            scratch_dir: root.path().join("scratch"),
        };
        let err = adapter(failing)
            .restore(&artifact, &restore_ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::ToolExecution { .. }));
        assert!(!err.to_string().contains("s3cret"));
        assert!(!restore_ctx.scratch_dir.join(TOOLS_CONFIG_FILE).exists());
    }

    #[tokio::test]
    async fn probe_passes_uri_through_the_environment() {
        let runner = Arc::new(ConfigCapturingRunner::default());
        adapter(runner.clone()).check_connection().await.unwrap();

        let calls = runner.calls.lock().unwrap();
        let (spec, _, _) = &calls[0];
        assert_eq!(spec.program(), "mongosh");
        assert!(!spec.raw_args().iter().any(|arg| arg.contains("s3cret")));
        assert!(spec
            .env_vars()
            .iter()
            .any(|(key, value)| key == URI_ENV && value == URI));
    }
}
