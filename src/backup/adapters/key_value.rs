use super::{
    finalize_artifact, prepare_artifact, unavailable, BackupContext, RestoreContext, StoreAdapter,
};
use crate::backup::{
    ArtifactCipher, BackupError, CommandRunner, CommandSpec, Result, StoreArtifact, StoreKind,
};
use crate::config::KeyValueConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Background snapshots through `redis-cli BGSAVE`
#[derive(Debug)]
pub struct KeyValueAdapter {
    config: KeyValueConfig,
    runner: Arc<dyn CommandRunner>,
    cipher: Option<ArtifactCipher>,
}

impl KeyValueAdapter {
    pub fn new(
        config: KeyValueConfig,
        runner: Arc<dyn CommandRunner>,
        cipher: Option<ArtifactCipher>,
    ) -> Self {
        Self {
            config,
            runner,
            cipher,
        }
    }

    fn cli(&self, command: &str) -> CommandSpec {
        let spec = CommandSpec::new(&self.config.cli_tool)
            .arg("-h")
            .arg(&self.config.host)
            .arg("-p")
            .arg(self.config.port.to_string())
            .arg(command);

        match &self.config.password {
            Some(password) if !password.is_empty() => {
                spec.env("REDISCLI_AUTH", password.expose())
            }
            _ => spec,
        }
    }

    async fn save_state(&self) -> Result<SaveState> {
        let spec = self.cli("INFO").arg("persistence");
        let output = self.runner.run(&spec).await?;
        SaveState::parse(&output.stdout).ok_or_else(|| BackupError::StoreUnavailable {
            store: self.kind(),
            message: format!(
                "Unexpected INFO persistence reply: {}",
                output.stdout.trim()
            ),
        })
    }

    /// Trigger BGSAVE and wait, bounded, for the server to finish writing it
    async fn snapshot(&self) -> Result<()> {
        let spec = self.cli("BGSAVE");
        let output = self.runner.run(&spec).await?;
        let reply = output.stdout.trim();
        debug!("BGSAVE replied: {}", reply);

        if reply.starts_with("ERR") && !reply.contains("in progress") {
            return Err(spec.failure("error reply", reply));
        }
        // A save queued behind an AOF rewrite has not started yet; the
        // in-progress flag must be seen before a finished state counts.
        let must_see_progress = reply.contains("scheduled");

        let limit = Duration::from_secs(self.config.snapshot_timeout_secs);
        tokio::time::timeout(limit, self.wait_for_snapshot(must_see_progress))
            .await
            .map_err(|_| BackupError::Timeout {
                seconds: self.config.snapshot_timeout_secs,
            })?
    }

    async fn wait_for_snapshot(&self, mut must_see_progress: bool) -> Result<()> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            let state = self.save_state().await?;
            if state.in_progress {
                must_see_progress = false;
            } else if !must_see_progress {
                if state.last_ok {
                    debug!("Background save finished");
                    return Ok(());
                }
                return Err(self.cli("INFO").arg("persistence").failure(
                    "rdb_last_bgsave_status:err",
                    "background save failed on the server",
                ));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Background save fields of `INFO persistence`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SaveState {
    in_progress: bool,
    last_ok: bool,
}

impl SaveState {
    fn parse(reply: &str) -> Option<Self> {
        let mut in_progress = None;
        let mut last_ok = None;
        for line in reply.lines() {
            match line.trim().split_once(':') {
                Some(("rdb_bgsave_in_progress", value)) => in_progress = Some(value != "0"),
                Some(("rdb_last_bgsave_status", value)) => last_ok = Some(value == "ok"),
                _ => {}
            }
        }
        Some(Self {
            in_progress: in_progress?,
            last_ok: last_ok?,
        })
    }
}

#[async_trait]
impl StoreAdapter for KeyValueAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::KeyValue
    }

    async fn check_connection(&self) -> Result<()> {
        let output = self
            .runner
            .run(&self.cli("PING"))
            .await
            .map_err(|e| unavailable(self.kind(), e))?;

        if output.stdout.trim() != "PONG" {
            return Err(BackupError::StoreUnavailable {
                store: self.kind(),
                message: format!("Unexpected PING reply: {}", output.stdout.trim()),
            });
        }
        Ok(())
    }

    async fn backup(&self, ctx: &BackupContext) -> Result<StoreArtifact> {
        info!("Triggering key-value snapshot for backup {}", ctx.backup_id);

        self.snapshot().await?;

        let target = ctx
            .artifact_dir
            .join(format!("key_value_{}.rdb", ctx.backup_id));
        tokio::fs::copy(&self.config.snapshot_path, &target).await?;

        // Snapshot files are already LZF-compressed by the server.
        finalize_artifact(
            self.kind(),
            target,
            &ctx.artifact_dir,
            false,
            self.cipher.as_ref(),
        )
        .await
    }

    async fn restore(&self, artifact: &StoreArtifact, ctx: &RestoreContext) -> Result<()> {
        let snapshot = prepare_artifact(artifact, ctx, self.cipher.as_ref()).await?;
        let destination = &self.config.snapshot_path;
        info!(
            "Restoring key-value snapshot {} to {}",
            artifact.file_name,
            destination.display()
        );

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staged = destination.with_extension("rdb.restore-tmp");
        tokio::fs::copy(&snapshot, &staged).await?;
        tokio::fs::rename(&staged, destination).await?;
        Ok(())
    }

    async fn verify_sandbox(&self, artifact: &StoreArtifact, ctx: &RestoreContext) -> Result<()> {
        let snapshot = prepare_artifact(artifact, ctx, self.cipher.as_ref()).await?;
        let spec = CommandSpec::new(&self.config.check_tool).arg(snapshot.to_string_lossy());
        self.runner.run(&spec).await?;
        Ok(())
    }
}
