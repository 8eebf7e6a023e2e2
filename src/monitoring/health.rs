use super::{AlertSeverity, BackupEvent, ComponentHealth, HealthStatus, NotificationDispatcher, SystemHealth};
use crate::backup::{
    tool_available, BackupFilter, BackupRepository, BackupStatus, CommandRunner, Result, StoreKind,
};
use crate::config::BackupConfig;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use sysinfo::Disks;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub max_backup_age_hours: u64,
    pub min_free_space_percent: f64,
    /// Failed runs in the last 24 hours before the component is unhealthy
    pub max_recent_failures: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_backup_age_hours: 26,
            min_free_space_percent: 10.0,
            max_recent_failures: 3,
        }
    }
}

/// Periodic self-check of storage, catalog freshness and tooling. Reads a
/// catalog snapshot only; never takes the backup busy flag.
#[derive(Debug)]
pub struct HealthMonitor {
    storage_root: PathBuf,
    tools: Vec<(StoreKind, String)>,
    repository: Arc<dyn BackupRepository>,
    runner: Arc<dyn CommandRunner>,
    notifier: NotificationDispatcher,
    thresholds: HealthThresholds,
    start_time: SystemTime,
    last_status: Mutex<HealthStatus>,
}

impl HealthMonitor {
    pub fn new(
        config: &BackupConfig,
        repository: Arc<dyn BackupRepository>,
        runner: Arc<dyn CommandRunner>,
        notifier: NotificationDispatcher,
    ) -> Self {
        let tools = config
            .enabled_stores()
            .into_iter()
            .filter_map(|store| {
                let tool = match store {
                    StoreKind::Relational => config.relational.dump_tool.clone(),
                    StoreKind::Document => config.document.dump_tool.clone(),
                    StoreKind::KeyValue => config.key_value.cli_tool.clone(),
                    StoreKind::Filesystem => return None,
                };
                Some((store, tool))
            })
            .collect();

        Self {
            storage_root: config.storage.local_root.clone(),
            tools,
            repository,
            runner,
            notifier,
            thresholds: HealthThresholds {
                max_backup_age_hours: config.monitoring.max_backup_age_hours,
                min_free_space_percent: config.monitoring.min_free_space_percent,
                ..HealthThresholds::default()
            },
            start_time: SystemTime::now(),
            last_status: Mutex::new(HealthStatus::Healthy),
        }
    }

    pub async fn check_system_health(&self) -> Result<SystemHealth> {
        let start_check = Instant::now();
        let mut components = HashMap::new();

        components.insert("storage".to_string(), self.check_storage().await);
        components.insert("catalog".to_string(), self.check_catalog().await?);
        components.insert("failures".to_string(), self.check_failures().await?);
        components.insert("tools".to_string(), self.check_tools().await);

        let status = determine_overall_status(&components);
        let uptime = self
            .start_time
            .elapsed()
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_secs();

        debug!(
            "Health check completed in {}ms: {:?}",
            start_check.elapsed().as_millis(),
            status
        );

        Ok(SystemHealth {
            status,
            timestamp: Utc::now(),
            components,
            uptime_seconds: uptime,
        })
    }

    /// Run one check and raise an event when health leaves `Healthy`
    pub async fn run_check(&self) -> Result<SystemHealth> {
        let health = self.check_system_health().await?;

        let previous = {
            let mut last = self
                .last_status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *last, health.status)
        };

        if health.status != HealthStatus::Healthy && health.status != previous {
            let problems: Vec<String> = health
                .components
                .iter()
                .filter(|(_, c)| c.status != HealthStatus::Healthy)
                .map(|(name, c)| format!("{name}: {}", c.message.as_deref().unwrap_or("unknown")))
                .collect();
            let severity = if health.status == HealthStatus::Unhealthy {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            self.notifier
                .dispatch(BackupEvent::health_degraded(problems.join("; "), severity));
        } else if health.status == HealthStatus::Healthy && previous != HealthStatus::Healthy {
            info!("Backup system health recovered");
        }

        Ok(health)
    }

    /// Check every `interval` until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Health monitor running every {}s", interval.as_secs());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_check().await {
                            error!("Health check failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Health monitor stopped");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn check_storage(&self) -> ComponentHealth {
        let start = Instant::now();
        let probe = self.storage_root.join(".health_check");

        if let Err(e) = probe_writable(&self.storage_root, &probe).await {
            return component(
                HealthStatus::Unhealthy,
                Some(format!("{} is not writable: {e}", self.storage_root.display())),
                start,
                1,
            );
        }

        match free_space_percent(&self.storage_root) {
            Some(free) if free < self.thresholds.min_free_space_percent => component(
                HealthStatus::Degraded,
                Some(format!("Only {free:.1}% free space left")),
                start,
                0,
            ),
            Some(free) => component(
                HealthStatus::Healthy,
                Some(format!("{free:.1}% free space")),
                start,
                0,
            ),
            None => component(HealthStatus::Healthy, None, start, 0),
        }
    }

    async fn check_catalog(&self) -> Result<ComponentHealth> {
        let start = Instant::now();
        let latest = self
            .repository
            .latest(&BackupFilter::all().with_status(BackupStatus::Success))
            .await?;

        let max_age = ChronoDuration::hours(self.thresholds.max_backup_age_hours as i64);
        Ok(match latest {
            None => component(
                HealthStatus::Degraded,
                Some("No successful backup recorded".to_string()),
                start,
                0,
            ),
            Some(metadata) => {
                let age = Utc::now() - metadata.completed_at.unwrap_or(metadata.timestamp);
                if age > max_age {
                    component(
                        HealthStatus::Degraded,
                        Some(format!(
                            "Newest successful backup {} is {}h old",
                            metadata.id,
                            age.num_hours()
                        )),
                        start,
                        0,
                    )
                } else {
                    component(
                        HealthStatus::Healthy,
                        Some(format!("Newest successful backup {}", metadata.id)),
                        start,
                        0,
                    )
                }
            }
        })
    }

    async fn check_failures(&self) -> Result<ComponentHealth> {
        let start = Instant::now();
        let failures = self
            .repository
            .list(
                &BackupFilter::all()
                    .with_status(BackupStatus::Failed)
                    .since(Utc::now() - ChronoDuration::hours(24)),
            )
            .await?
            .len();

        let status = if failures >= self.thresholds.max_recent_failures {
            HealthStatus::Unhealthy
        } else if failures > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Ok(component(
            status,
            (failures > 0).then(|| format!("{failures} failed backups in the last 24h")),
            start,
            failures as u64,
        ))
    }

    async fn check_tools(&self) -> ComponentHealth {
        let start = Instant::now();
        let probes = self.tools.iter().map(|(store, tool)| async move {
            let available = tool_available(self.runner.as_ref(), tool).await;
            (!available).then(|| format!("{tool} ({store})"))
        });
        let missing: Vec<String> = futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .collect();

        if missing.is_empty() {
            component(HealthStatus::Healthy, None, start, 0)
        } else {
            component(
                HealthStatus::Unhealthy,
                Some(format!("Unavailable tools: {}", missing.join(", "))),
                start,
                missing.len() as u64,
            )
        }
    }
}

async fn probe_writable(root: &Path, probe: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(root).await?;
    tokio::fs::write(probe, b"ok").await?;
    tokio::fs::remove_file(probe).await
}

fn component(
    status: HealthStatus,
    message: Option<String>,
    start: Instant,
    error_count: u64,
) -> ComponentHealth {
    ComponentHealth {
        status,
        message,
        last_checked: Utc::now(),
        response_time_ms: Some(start.elapsed().as_millis() as u64),
        error_count,
    }
}

fn determine_overall_status(components: &HashMap<String, ComponentHealth>) -> HealthStatus {
    let mut has_unhealthy = false;
    let mut has_degraded = false;

    for (component_name, health) in components {
        match health.status {
            HealthStatus::Unhealthy => {
                has_unhealthy = true;
                error!(
                    "Component {} is unhealthy: {:?}",
                    component_name, health.message
                );
            }
            HealthStatus::Degraded => {
                has_degraded = true;
                warn!(
                    "Component {} is degraded: {:?}",
                    component_name, health.message
                );
            }
            HealthStatus::Healthy => {
                debug!("Component {} is healthy", component_name);
            }
        }
    }

    if has_unhealthy {
        HealthStatus::Unhealthy
    } else if has_degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Free space of the disk holding `path`, by longest mount-point match
fn free_space_percent(path: &Path) -> Option<f64> {
    let path = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()) && disk.total_space() > 0)
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space() as f64 / disk.total_space() as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupMetadata, BackupType, InMemoryBackupRepository, ProcessCommandRunner};
    use tempfile::TempDir;

    fn monitor(root: &Path, repository: Arc<dyn BackupRepository>) -> HealthMonitor {
        let mut config = BackupConfig::default();
        config.storage.local_root = root.to_path_buf();
        config.relational.enabled = false;
        config.document.enabled = false;
        config.key_value.enabled = false;
        config.filesystem.enabled = true;
        config.filesystem.directories = vec![root.to_path_buf()];

        HealthMonitor::new(
            &config,
            repository,
            Arc::new(ProcessCommandRunner::new()),
            NotificationDispatcher::default(),
        )
    }

    fn finished(id: &str, status: BackupStatus, hours_ago: i64) -> BackupMetadata {
        let ts = Utc::now() - ChronoDuration::hours(hours_ago);
        let mut metadata =
            BackupMetadata::begin(id.to_string(), BackupType::Full, ts, ts, PathBuf::from("/b"));
        match status {
            BackupStatus::Success => metadata.complete(1, "x".to_string(), ts).unwrap(),
            _ => metadata.fail("boom".to_string(), ts).unwrap(),
        }
        metadata
    }

    #[tokio::test]
    async fn empty_catalog_is_degraded() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(dir.path(), Arc::new(InMemoryBackupRepository::new()));
        let health = monitor.check_system_health().await.unwrap();

        assert_ne!(health.components["storage"].status, HealthStatus::Unhealthy);
        assert_eq!(health.components["catalog"].status, HealthStatus::Degraded);
        assert_eq!(health.components["tools"].status, HealthStatus::Healthy);
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn fresh_success_is_healthy_and_failures_degrade() {
        let dir = TempDir::new().unwrap();
        let repository = Arc::new(InMemoryBackupRepository::new());
        repository
            .save(&finished("ok", BackupStatus::Success, 1))
            .await
            .unwrap();
        let monitor = monitor(dir.path(), repository.clone());

        let health = monitor.check_system_health().await.unwrap();
        assert_eq!(health.components["catalog"].status, HealthStatus::Healthy);
        assert_eq!(health.components["failures"].status, HealthStatus::Healthy);

        repository
            .save(&finished("bad", BackupStatus::Failed, 2))
            .await
            .unwrap();
        let health = monitor.check_system_health().await.unwrap();
        assert_eq!(health.components["failures"].status, HealthStatus::Degraded);
        assert_eq!(health.components["failures"].error_count, 1);
    }

    #[tokio::test]
    async fn stale_backup_degrades_catalog() {
        let dir = TempDir::new().unwrap();
        let repository = Arc::new(InMemoryBackupRepository::new());
        repository
            .save(&finished("old", BackupStatus::Success, 48))
            .await
            .unwrap();
        let monitor = monitor(dir.path(), repository);

        let health = monitor.check_system_health().await.unwrap();
        assert_eq!(health.components["catalog"].status, HealthStatus::Degraded);
    }

    #[test]
    fn overall_status_takes_the_worst_component() {
        let start = Instant::now();
        let mut components = HashMap::new();
        components.insert("a".to_string(), component(HealthStatus::Healthy, None, start, 0));
        components.insert("b".to_string(), component(HealthStatus::Degraded, None, start, 0));
        assert_eq!(determine_overall_status(&components), HealthStatus::Degraded);

        components.insert("c".to_string(), component(HealthStatus::Unhealthy, None, start, 0));
        assert_eq!(determine_overall_status(&components), HealthStatus::Unhealthy);
    }
}
