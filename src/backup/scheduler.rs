//! Cron-driven full, incremental and retention runs.
//!
//! Jobs never overlap with each other or with manual operations: the
//! manager's busy flag rejects a second run with a conflict, which the
//! scheduler records as a skipped run.

use super::{BackupError, BackupManager, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledTask {
    FullBackup,
    IncrementalBackup,
    RetentionPurge,
}

impl fmt::Display for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScheduledTask::FullBackup => "full backup",
            ScheduledTask::IncrementalBackup => "incremental backup",
            ScheduledTask::RetentionPurge => "retention purge",
        };
        f.write_str(name)
    }
}

/// Counters for scheduled and manually triggered runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatistics {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    /// Runs rejected because another operation held the manager
    pub skipped_runs: u64,
    pub last_successful_run: Option<DateTime<Utc>>,
    pub last_failed_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Skipped,
    Failed,
}

pub struct BackupScheduler {
    manager: Arc<BackupManager>,
    scheduler: Mutex<Option<JobScheduler>>,
    statistics: Arc<RwLock<SchedulerStatistics>>,
    job_ids: Mutex<Vec<(ScheduledTask, Uuid)>>,
}

impl fmt::Debug for BackupScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupScheduler").finish_non_exhaustive()
    }
}

fn scheduler_error(context: &str, err: impl fmt::Display) -> BackupError {
    BackupError::Scheduler {
        message: format!("{context}: {err}"),
    }
}

impl BackupScheduler {
    pub fn new(manager: Arc<BackupManager>) -> Self {
        Self {
            manager,
            scheduler: Mutex::new(None),
            statistics: Arc::new(RwLock::new(SchedulerStatistics::default())),
            job_ids: Mutex::new(Vec::new()),
        }
    }

    /// Register the three cron jobs and start ticking. A disabled schedule
    /// is not an error; nothing is registered.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let config = self.manager.config().await;
        if !config.schedule.enabled {
            info!("Backup schedule is disabled in configuration, not starting");
            return Ok(());
        }

        let mut running = self.scheduler.lock().await;
        if running.is_some() {
            return Err(BackupError::Scheduler {
                message: "Backup scheduler is already running".to_string(),
            });
        }

        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| scheduler_error("Failed to initialize job scheduler", e))?;

        let mut job_ids = Vec::new();
        for (task, expression) in [
            (ScheduledTask::FullBackup, &config.schedule.full_backup),
            (
                ScheduledTask::IncrementalBackup,
                &config.schedule.incremental_backup,
            ),
            (ScheduledTask::RetentionPurge, &config.schedule.retention_purge),
        ] {
            let job = self.job(task, expression)?;
            let job_id = scheduler
                .add(job)
                .await
                .map_err(|e| scheduler_error("Failed to add job to scheduler", e))?;
            info!(job_id = %job_id, cron = %expression, "Scheduled {}", task);
            job_ids.push((task, job_id));
        }

        scheduler
            .start()
            .await
            .map_err(|e| scheduler_error("Failed to start job scheduler", e))?;

        *self.job_ids.lock().await = job_ids;
        *running = Some(scheduler);
        info!("Backup scheduler started");
        Ok(())
    }

    fn job(&self, task: ScheduledTask, expression: &str) -> Result<Job> {
        let manager = self.manager.clone();
        let statistics = self.statistics.clone();

        Job::new_async(expression, move |_uuid, _scheduler| {
            let manager = manager.clone();
            let statistics = statistics.clone();
            Box::pin(async move {
                Self::execute(&manager, &statistics, task).await;
            })
        })
        .map_err(|e| scheduler_error(&format!("Invalid cron expression '{expression}'"), e))
    }

    /// Run a task now, outside the schedule
    pub async fn trigger(&self, task: ScheduledTask) -> RunOutcome {
        info!("Triggering manual {}", task);
        Self::execute(&self.manager, &self.statistics, task).await
    }

    async fn execute(
        manager: &BackupManager,
        statistics: &RwLock<SchedulerStatistics>,
        task: ScheduledTask,
    ) -> RunOutcome {
        let result = match task {
            ScheduledTask::FullBackup => manager.perform_full_backup().await.map(|m| {
                info!("Scheduled full backup {} completed", m.id);
            }),
            ScheduledTask::IncrementalBackup => {
                manager.perform_incremental_backup().await.map(|m| {
                    info!("Scheduled incremental backup {} completed", m.id);
                })
            }
            ScheduledTask::RetentionPurge => manager
                .purge_expired_backups(Utc::now())
                .await
                .map(|report| {
                    info!(
                        "Retention purge removed {} backups ({} retained as incremental bases)",
                        report.purged.len(),
                        report.retained.len()
                    );
                }),
        };

        let now = Utc::now();
        let mut stats = statistics.write().await;
        stats.total_runs += 1;
        match result {
            Ok(()) => {
                stats.successful_runs += 1;
                stats.last_successful_run = Some(now);
                RunOutcome::Succeeded
            }
            Err(BackupError::Conflict { message }) => {
                warn!("Skipping scheduled {}: {}", task, message);
                stats.skipped_runs += 1;
                RunOutcome::Skipped
            }
            Err(e) => {
                error!("Scheduled {} failed: {}", task, e);
                stats.failed_runs += 1;
                stats.last_failed_run = Some(now);
                RunOutcome::Failed
            }
        }
    }

    pub async fn statistics(&self) -> SchedulerStatistics {
        self.statistics.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    pub async fn scheduled_jobs(&self) -> Vec<(ScheduledTask, Uuid)> {
        self.job_ids.lock().await.clone()
    }

    /// Stop ticking. A job already running finishes on its own task.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(mut scheduler) = self.scheduler.lock().await.take() else {
            return Ok(());
        };
        info!("Shutting down backup scheduler");
        scheduler
            .shutdown()
            .await
            .map_err(|e| scheduler_error("Failed to stop job scheduler", e))?;
        self.job_ids.lock().await.clear();
        Ok(())
    }
}
