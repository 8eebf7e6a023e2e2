use crate::application::{ApplicationLifecycle, DependencyContainer};
use crate::backup::{BackupFilter, StoreKind};
use crate::config::BackupConfig;
use crate::monitoring::HealthStatus;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Clean separation of command handling logic from main.rs
pub struct BackupCommandHandler {
    container: Arc<DependencyContainer>,
}

impl BackupCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn full_backup(&self) -> Result<()> {
        let metadata = self.container.backup_manager.perform_full_backup().await?;
        info!("✅ Full backup created: {} ({} bytes)", metadata.id, metadata.size_bytes);
        println!("{}", metadata.id);
        Ok(())
    }

    pub async fn incremental_backup(&self) -> Result<()> {
        let metadata = self
            .container
            .backup_manager
            .perform_incremental_backup()
            .await?;
        info!(
            "✅ Incremental backup created: {} (base {})",
            metadata.id,
            metadata.parent_id.as_deref().unwrap_or("-")
        );
        println!("{}", metadata.id);
        Ok(())
    }

    pub async fn restore(&self, backup_id: &str, stores: &[StoreKind]) -> Result<()> {
        let targets = (!stores.is_empty()).then_some(stores);
        self.container
            .backup_manager
            .restore_from_backup(backup_id, targets)
            .await?;
        info!("✅ Restore from {} completed", backup_id);
        Ok(())
    }

    pub async fn point_in_time_recovery(&self, target: DateTime<Utc>) -> Result<()> {
        let point = self
            .container
            .backup_manager
            .point_in_time_recovery(target)
            .await?;
        info!(
            "✅ Recovered to {} using backups {:?}",
            point.timestamp, point.backup_ids
        );
        println!("{}", serde_json::to_string_pretty(&point)?);
        Ok(())
    }

    pub async fn verify(&self, backup_id: &str) -> Result<()> {
        let result = self.container.backup_manager.verify_backup(backup_id).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);

        if result.passed() {
            info!("✅ Backup {} passed integrity verification", backup_id);
            Ok(())
        } else {
            for issue in &result.issues_found {
                error!("❌ {}", issue);
            }
            Err(anyhow::anyhow!(
                "Backup {} failed integrity verification",
                backup_id
            ))
        }
    }

    pub async fn list_backups(&self, since: Option<DateTime<Utc>>) -> Result<()> {
        let mut filter = BackupFilter::all();
        if let Some(since) = since {
            filter = filter.since(since);
        }

        let backups = self.container.backup_manager.list_backups(&filter).await?;
        for backup in &backups {
            let stores = backup
                .databases
                .iter()
                .map(StoreKind::as_str)
                .collect::<Vec<_>>()
                .join(",");
            println!(
                "{}  {:<11}  {:<11}  {}  {:>12}  [{}]",
                backup.id,
                backup.backup_type.to_string(),
                backup.status.to_string(),
                backup.timestamp.to_rfc3339(),
                backup.size_bytes,
                stores
            );
        }
        info!("📊 {} backups listed", backups.len());
        Ok(())
    }

    pub async fn statistics(&self, prometheus: bool) -> Result<()> {
        if prometheus {
            print!("{}", self.container.backup_manager.metrics().gather_metrics());
            return Ok(());
        }

        let stats = self.container.backup_manager.get_backup_statistics().await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        if !stats.retention_compliant {
            warn!("⚠️  Some backups are past their retention date; run `purge`");
        }
        Ok(())
    }

    pub async fn purge(&self) -> Result<()> {
        let report = self
            .container
            .backup_manager
            .purge_expired_backups(Utc::now())
            .await?;
        info!(
            "🧹 Purged {} expired backups ({} kept as incremental bases)",
            report.purged.len(),
            report.retained.len()
        );
        for id in &report.purged {
            println!("{id}");
        }
        Ok(())
    }
}

pub struct HealthCommandHandler {
    container: Arc<DependencyContainer>,
}

impl HealthCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn run_health_check(&self) -> Result<()> {
        info!("🏥 Running backup system health check...");

        let health = self.container.health_monitor.check_system_health().await?;
        info!("📊 System Health: {:?}", health.status);

        let mut components: Vec<_> = health.components.iter().collect();
        components.sort_by(|a, b| a.0.cmp(b.0));
        for (component, component_health) in components {
            match component_health.status {
                HealthStatus::Healthy => {
                    info!("✅ {}: Healthy", component);
                }
                HealthStatus::Degraded => {
                    warn!(
                        "⚠️  {}: Degraded - {:?}",
                        component, component_health.message
                    );
                }
                HealthStatus::Unhealthy => {
                    error!(
                        "❌ {}: Unhealthy - {:?}",
                        component, component_health.message
                    );
                }
            }
        }

        println!("{}", serde_json::to_string_pretty(&health)?);
        if health.status == HealthStatus::Unhealthy {
            return Err(anyhow::anyhow!("Backup system is unhealthy"));
        }
        Ok(())
    }
}

/// Long-running mode: scheduler plus health monitor until a signal arrives
pub struct ServiceCommandHandler {
    lifecycle: Arc<ApplicationLifecycle>,
}

impl ServiceCommandHandler {
    pub fn new(lifecycle: Arc<ApplicationLifecycle>) -> Self {
        Self { lifecycle }
    }

    pub async fn run(&self) -> Result<()> {
        self.lifecycle.start_background_services().await?;
        info!("🚀 Backup service running; press Ctrl+C to stop");

        self.lifecycle.wait_for_shutdown().await;
        self.lifecycle.shutdown().await
    }
}

/// Write the default configuration as TOML, to `output` or stdout
pub fn write_sample_config(output: Option<&Path>) -> Result<()> {
    let rendered = BackupConfig::default().to_toml()?;
    match output {
        Some(path) => {
            if path.exists() {
                return Err(anyhow::anyhow!(
                    "{} already exists; refusing to overwrite",
                    path.display()
                ));
            }
            std::fs::write(path, rendered)?;
            info!("📝 Sample configuration written to {}", path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}
