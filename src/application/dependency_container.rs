use crate::backup::{BackupManager, CommandRunner, ProcessCommandRunner};
use crate::config::BackupConfig;
use crate::monitoring::{HealthMonitor, HealthStatus};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Dependency injection container for the application
pub struct DependencyContainer {
    // Core configuration
    pub config: BackupConfig,

    // Infrastructure layer
    pub command_runner: Arc<dyn CommandRunner>,
    pub health_monitor: Arc<HealthMonitor>,

    // Service layer
    pub backup_manager: Arc<BackupManager>,
}

impl DependencyContainer {
    pub async fn new(config_path: Option<&Path>) -> Result<Self> {
        info!("🔧 Initializing dependency container...");

        let config = BackupConfig::load(config_path)?;
        Self::from_config(config, Arc::new(ProcessCommandRunner::new()))
    }

    /// Wire everything around an explicit configuration and command runner
    pub fn from_config(config: BackupConfig, command_runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let backup_manager = Arc::new(
            BackupManager::builder(config.clone())
                .command_runner(command_runner.clone())
                .build()?,
        );

        let health_monitor = Arc::new(HealthMonitor::new(
            &config,
            backup_manager.repository(),
            command_runner.clone(),
            backup_manager.notifier().clone(),
        ));

        info!("✅ Dependency container initialized: {}", config.summary());

        Ok(Self {
            config,
            command_runner,
            health_monitor,
            backup_manager,
        })
    }

    pub async fn health_check(&self) -> Result<bool> {
        let health = self.health_monitor.check_system_health().await?;
        Ok(health.status != HealthStatus::Unhealthy)
    }
}
