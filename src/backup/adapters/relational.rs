use super::{
    finalize_artifact, prepare_artifact, unavailable, BackupContext, RestoreContext, StoreAdapter,
};
use crate::backup::{
    ArtifactCipher, BackupError, CommandRunner, CommandSpec, Result, StoreArtifact, StoreKind,
};
use crate::config::RelationalConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Custom-format dumps through `pg_dump` / `pg_restore`
#[derive(Debug)]
pub struct RelationalAdapter {
    config: RelationalConfig,
    runner: Arc<dyn CommandRunner>,
    cipher: Option<ArtifactCipher>,
}

impl RelationalAdapter {
    pub fn new(
        config: RelationalConfig,
        runner: Arc<dyn CommandRunner>,
        cipher: Option<ArtifactCipher>,
    ) -> Self {
        Self {
            config,
            runner,
            cipher,
        }
    }

    fn command(&self, tool: &str) -> CommandSpec {
        let spec = CommandSpec::new(tool)
            .arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("--username")
            .arg(&self.config.username);

        if self.config.password.is_empty() {
            spec
        } else {
            spec.env("PGPASSWORD", self.config.password.expose())
        }
    }
}

#[async_trait]
impl StoreAdapter for RelationalAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    async fn check_connection(&self) -> Result<()> {
        let spec = self
            .command(&self.config.probe_tool)
            .arg("--dbname")
            .arg(&self.config.database);
        self.runner
            .run(&spec)
            .await
            .map(|_| ())
            .map_err(|e| unavailable(self.kind(), e))
    }

    async fn backup(&self, ctx: &BackupContext) -> Result<StoreArtifact> {
        let path = ctx
            .artifact_dir
            .join(format!("relational_{}.dump", ctx.backup_id));
        let level = if self.config.compress {
            self.config.compression_level
        } else {
            0
        };

        info!(
            "Dumping relational database {} for backup {}",
            self.config.database, ctx.backup_id
        );

        let spec = self
            .command(&self.config.dump_tool)
            .arg("--format=custom")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg(format!("--compress={level}"))
            .arg("--dbname")
            .arg(&self.config.database)
            .arg("--file")
            .arg(path.to_string_lossy());
        self.runner.run(&spec).await?;

        finalize_artifact(
            self.kind(),
            path,
            &ctx.artifact_dir,
            self.config.compress,
            self.cipher.as_ref(),
        )
        .await
    }

    async fn restore(&self, artifact: &StoreArtifact, ctx: &RestoreContext) -> Result<()> {
        let dump = prepare_artifact(artifact, ctx, self.cipher.as_ref()).await?;
        info!(
            "Restoring relational database {} from {}",
            self.config.database, artifact.file_name
        );

        let spec = self
            .command(&self.config.restore_tool)
            .arg("--clean")
            .arg("--if-exists")
            .arg("--no-owner")
            .arg("--dbname")
            .arg(&self.config.database)
            .arg(dump.to_string_lossy());
        self.runner.run(&spec).await?;
        Ok(())
    }

    async fn verify_sandbox(&self, artifact: &StoreArtifact, ctx: &RestoreContext) -> Result<()> {
        let dump = prepare_artifact(artifact, ctx, self.cipher.as_ref()).await?;

        // Reading the table of contents parses the whole archive header
        // without a target database.
        let spec = CommandSpec::new(&self.config.restore_tool)
            .arg("--list")
            .arg(dump.to_string_lossy());
        let output = self.runner.run(&spec).await?;

        let entries = output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.starts_with(';'))
            .count();
        debug!("Relational dump lists {} entries", entries);

        if entries == 0 {
            return Err(BackupError::Integrity {
                message: format!("{} contains no restorable entries", artifact.file_name),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::CommandOutput;
    use crate::config::Secret;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct CannedRunner {
        seen: Mutex<Vec<CommandSpec>>,
        stdout: String,
        refuse: bool,
    }

    #[async_trait]
    impl CommandRunner for CannedRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.seen.lock().unwrap().push(spec.clone());
            if self.refuse {
                return Err(spec.failure("exit status: 2", "no response"));
            }
            Ok(CommandOutput {
                stdout: self.stdout.clone(),
                stderr: String::new(),
            })
        }
    }

    fn adapter(runner: Arc<CannedRunner>) -> RelationalAdapter {
        let config = RelationalConfig {
            password: Secret::new("hunter2"),
            ..RelationalConfig::default()
        };
        RelationalAdapter::new(config, runner, None)
    }

    fn plain_artifact(dir: &Path) -> StoreArtifact {
        std::fs::write(dir.join("relational_b.dump"), b"PGDMP").unwrap();
        StoreArtifact {
            store: StoreKind::Relational,
            file_name: "relational_b.dump".to_string(),
            size_bytes: 5,
            checksum: String::new(),
            compressed: true,
            encrypted: false,
            iv: None,
        }
    }

    #[tokio::test]
    async fn password_travels_in_the_environment_only() {
        let runner = Arc::new(CannedRunner::default());
        adapter(runner.clone()).check_connection().await.unwrap();

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].program(), "pg_isready");
        assert!(seen[0]
            .env_vars()
            .iter()
            .any(|(key, value)| key == "PGPASSWORD" && value == "hunter2"));
        assert!(!seen[0].raw_args().iter().any(|arg| arg.contains("hunter2")));
    }

    #[tokio::test]
    async fn dump_uses_the_configured_compression_level() {
        let dir = TempDir::new().unwrap();
        let ctx = BackupContext {
            backup_id: "b".to_string(),
            backup_type: crate::backup::BackupType::Full,
            since: None,
            artifact_dir: dir.path().to_path_buf(),
            work_dir: dir.path().join("work"),
        };
        // The canned runner writes nothing; the dump file is there already
        std::fs::write(dir.path().join("relational_b.dump"), b"PGDMP").unwrap();

        for (compress, level, expected) in [(true, 4, "--compress=4"), (false, 4, "--compress=0")] {
            let runner = Arc::new(CannedRunner::default());
            let config = RelationalConfig {
                compress,
                compression_level: level,
                ..RelationalConfig::default()
            };
            RelationalAdapter::new(config, runner.clone(), None)
                .backup(&ctx)
                .await
                .unwrap();
            let seen = runner.seen.lock().unwrap();
            assert!(seen[0].raw_args().contains(&expected.to_string()));
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_store_unavailable() {
        let runner = Arc::new(CannedRunner {
            refuse: true,
            ..CannedRunner::default()
        });
        let err = adapter(runner).check_connection().await.unwrap_err();
        assert!(matches!(err, BackupError::StoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn sandbox_rejects_an_empty_table_of_contents() {
        let dir = TempDir::new().unwrap();
        let artifact = plain_artifact(dir.path());
        let ctx = RestoreContext {
            artifact_dir: dir.path().to_path_buf(),
            scratch_dir: dir.path().join("scratch"),
        };

        let empty = Arc::new(CannedRunner {
            stdout: ";\n; Archive created at 2024-01-01\n;\n".to_string(),
            ..CannedRunner::default()
        });
        let err = adapter(empty).verify_sandbox(&artifact, &ctx).await.unwrap_err();
        assert!(matches!(err, BackupError::Integrity { .. }));

        let listed = Arc::new(CannedRunner {
            stdout: "216; 1259 16386 TABLE public memories postgres\n".to_string(),
            ..CannedRunner::default()
        });
        adapter(listed.clone())
            .verify_sandbox(&artifact, &ctx)
            .await
            .unwrap();
        let seen = listed.seen.lock().unwrap();
        assert!(seen[0].raw_args().contains(&"--list".to_string()));
    }
}
