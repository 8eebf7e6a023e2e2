use super::{CommandRunner, CommandSpec, Result};
use crate::config::ServicesConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const SERVICE_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Quiesces whatever writes to the stores while a restore runs
#[async_trait]
pub trait ServiceController: Send + Sync + std::fmt::Debug {
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
}

/// Runs configured command lines, e.g. `systemctl stop codex-api`
#[derive(Debug)]
pub struct CommandServiceController {
    pause_commands: Vec<Vec<String>>,
    resume_commands: Vec<Vec<String>>,
    runner: Arc<dyn CommandRunner>,
}

impl CommandServiceController {
    pub fn new(config: &ServicesConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            pause_commands: config.pause_commands.clone(),
            resume_commands: config.resume_commands.clone(),
            runner,
        }
    }

    fn spec(line: &[String]) -> Option<CommandSpec> {
        let (program, args) = line.split_first()?;
        Some(
            CommandSpec::new(program)
                .args(args.iter().cloned())
                .timeout(SERVICE_COMMAND_TIMEOUT),
        )
    }
}

#[async_trait]
impl ServiceController for CommandServiceController {
    async fn pause(&self) -> Result<()> {
        for spec in self.pause_commands.iter().filter_map(|line| Self::spec(line)) {
            info!("Pausing services: {} {}", spec.program(), spec.display_args());
            self.runner.run(&spec).await?;
        }
        Ok(())
    }

    /// Runs every resume command even when one fails; reports the first
    /// failure.
    async fn resume(&self) -> Result<()> {
        let mut first_error = None;
        for spec in self.resume_commands.iter().filter_map(|line| Self::spec(line)) {
            info!("Resuming services: {} {}", spec.program(), spec.display_args());
            if let Err(e) = self.runner.run(&spec).await {
                error!("Resume command {} failed: {}", spec.program(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::ProcessCommandRunner;
    use tempfile::TempDir;

    #[tokio::test]
    async fn resume_runs_every_command_and_reports_first_failure() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("resumed");
        let config = ServicesConfig {
            pause_commands: vec![vec!["true".to_string()], vec![]],
            resume_commands: vec![
                vec!["false".to_string()],
                vec![
                    "touch".to_string(),
                    marker.to_string_lossy().into_owned(),
                ],
            ],
        };
        let controller =
            CommandServiceController::new(&config, Arc::new(ProcessCommandRunner::new()));

        controller.pause().await.unwrap();
        let err = controller.resume().await.unwrap_err();
        assert!(err.to_string().contains("false"));
        assert!(marker.exists());
    }
}
