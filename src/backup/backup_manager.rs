use super::{
    artifact_set_checksum, build_adapters, replicate_redundant, resolve_chain, validate_chain,
    BackupContext, BackupError, BackupFilter, BackupMetadata, BackupRepository, BackupStatus,
    BackupType, CommandRunner, CommandServiceController, FileBackupRepository,
    IntegrityVerifier, ProcessCommandRunner, RecoveryPoint, RecoveryPointIndex, RemoteStorage,
    RestoreContext, Result, S3CliRemoteStorage, ServiceController, StoreAdapter, StoreKind,
    VerificationResult,
};
use crate::config::BackupConfig;
use crate::monitoring::{BackupEvent, BackupMetrics, BackupRunTimer, NotificationDispatcher};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Aggregate view over the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupStatistics {
    pub total_backups: usize,
    pub successful_backups: usize,
    pub failed_backups: usize,
    pub in_progress_backups: usize,
    pub backups_by_type: BTreeMap<String, usize>,
    pub total_size_bytes: u64,
    pub average_size_bytes: u64,
    pub newest_backup: Option<DateTime<Utc>>,
    pub oldest_backup: Option<DateTime<Utc>>,
    /// No record has outlived its retention date
    pub retention_compliant: bool,
}

impl BackupStatistics {
    pub fn from_records(records: &[BackupMetadata], now: DateTime<Utc>) -> Self {
        let count = |status: BackupStatus| records.iter().filter(|m| m.status == status).count();

        let mut backups_by_type = BTreeMap::new();
        for metadata in records {
            *backups_by_type
                .entry(metadata.backup_type.to_string())
                .or_insert(0) += 1;
        }

        let total_size_bytes: u64 = records.iter().map(|m| m.size_bytes).sum();
        let average_size_bytes = if records.is_empty() {
            0
        } else {
            total_size_bytes / records.len() as u64
        };

        Self {
            total_backups: records.len(),
            successful_backups: count(BackupStatus::Success),
            failed_backups: count(BackupStatus::Failed),
            in_progress_backups: count(BackupStatus::InProgress),
            backups_by_type,
            total_size_bytes,
            average_size_bytes,
            newest_backup: records.iter().map(|m| m.timestamp).max(),
            oldest_backup: records.iter().map(|m| m.timestamp).min(),
            retention_compliant: records.iter().all(|m| !m.is_expired(now)),
        }
    }
}

/// Outcome of a retention purge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub purged: Vec<String>,
    /// Expired full backups kept because a live incremental depends on them
    pub retained: Vec<String>,
}

/// Set while a mutating operation runs; cleared on drop
struct BusyGuard {
    flag: Arc<Mutex<bool>>,
}

impl BusyGuard {
    fn acquire(flag: &Arc<Mutex<bool>>, operation: &str) -> Result<Self> {
        let mut busy = flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *busy {
            return Err(BackupError::Conflict {
                message: format!("Cannot start {operation}: another backup operation is in progress"),
            });
        }
        *busy = true;
        Ok(Self { flag: flag.clone() })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut busy = self
            .flag
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *busy = false;
    }
}

async fn remove_dir_if_exists(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Main backup manager responsible for orchestrating all backup operations
#[derive(Debug)]
pub struct BackupManager {
    config: RwLock<Arc<BackupConfig>>,
    repository: Arc<dyn BackupRepository>,
    runner: Arc<dyn CommandRunner>,
    services: Arc<dyn ServiceController>,
    remote: Option<Arc<dyn RemoteStorage>>,
    notifier: NotificationDispatcher,
    metrics: Arc<BackupMetrics>,
    recovery_index: Arc<RecoveryPointIndex>,
    verifier: IntegrityVerifier,
    busy: Arc<Mutex<bool>>,
}

pub struct BackupManagerBuilder {
    config: BackupConfig,
    repository: Option<Arc<dyn BackupRepository>>,
    runner: Option<Arc<dyn CommandRunner>>,
    services: Option<Arc<dyn ServiceController>>,
    remote: Option<Arc<dyn RemoteStorage>>,
    notifier: Option<NotificationDispatcher>,
    metrics: Option<Arc<BackupMetrics>>,
}

impl BackupManagerBuilder {
    pub fn repository(mut self, repository: Arc<dyn BackupRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn service_controller(mut self, services: Arc<dyn ServiceController>) -> Self {
        self.services = Some(services);
        self
    }

    /// Overrides the remote derived from `storage.remote`
    pub fn remote_storage(mut self, remote: Arc<dyn RemoteStorage>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn notifier(mut self, notifier: NotificationDispatcher) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn metrics(mut self, metrics: Arc<BackupMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<BackupManager> {
        let config = self.config;
        config.validate().map_err(|e| BackupError::Configuration {
            message: e.to_string(),
        })?;

        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(ProcessCommandRunner::new()));
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(FileBackupRepository::new(config.metadata_dir())));
        let services = self.services.unwrap_or_else(|| {
            Arc::new(CommandServiceController::new(&config.services, runner.clone()))
        });
        let notifier = match self.notifier {
            Some(notifier) => notifier,
            None => NotificationDispatcher::from_config(&config.monitoring, runner.clone())?,
        };
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(BackupMetrics::new().map_err(|e| BackupError::Configuration {
                message: format!("Failed to register metrics: {e}"),
            })?),
        };

        Ok(BackupManager {
            recovery_index: Arc::new(RecoveryPointIndex::new(config.recovery_index_path())),
            verifier: IntegrityVerifier::new(config.sandbox_dir()),
            config: RwLock::new(Arc::new(config)),
            repository,
            runner,
            services,
            remote: self.remote,
            notifier,
            metrics,
            busy: Arc::new(Mutex::new(false)),
        })
    }
}

impl BackupManager {
    pub fn builder(config: BackupConfig) -> BackupManagerBuilder {
        BackupManagerBuilder {
            config,
            repository: None,
            runner: None,
            services: None,
            remote: None,
            notifier: None,
            metrics: None,
        }
    }

    /// Create directories, load the catalog and the recovery point index
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing backup manager");
        let config = self.config().await;

        for dir in [
            config.storage.local_root.clone(),
            config.artifacts_dir(),
            config.metadata_dir(),
            config.work_dir(),
            config.sandbox_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }

        let count = self.repository.load().await?;
        self.fail_interrupted_runs().await?;

        let loaded = match self.recovery_index.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Recovery point index unreadable, rebuilding: {}", e);
                false
            }
        };
        if !loaded {
            let records = self.repository.list(&BackupFilter::all()).await?;
            self.recovery_index.rebuild_from(&records).await?;
        }

        info!(
            "Backup manager initialized successfully ({} backups in catalog; {})",
            count,
            config.summary()
        );
        Ok(())
    }

    /// Records left in progress by a crashed process can never finish
    async fn fail_interrupted_runs(&self) -> Result<()> {
        let stale = self
            .repository
            .list(&BackupFilter::all().with_status(BackupStatus::InProgress))
            .await?;
        for mut metadata in stale {
            warn!("Marking interrupted backup {} as failed", metadata.id);
            metadata.fail("Interrupted before completion".to_string(), Utc::now())?;
            self.repository.save(&metadata).await?;
        }
        Ok(())
    }

    pub async fn config(&self) -> Arc<BackupConfig> {
        self.config.read().await.clone()
    }

    pub fn repository(&self) -> Arc<dyn BackupRepository> {
        self.repository.clone()
    }

    pub fn command_runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    pub fn notifier(&self) -> &NotificationDispatcher {
        &self.notifier
    }

    pub fn metrics(&self) -> Arc<BackupMetrics> {
        self.metrics.clone()
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn recovery_points(&self) -> Vec<RecoveryPoint> {
        self.recovery_index.points().await
    }

    /// Perform a full backup of every enabled store
    pub async fn perform_full_backup(&self) -> Result<BackupMetadata> {
        self.run_backup(BackupType::Full).await
    }

    /// Capture changes since the latest successful full backup
    pub async fn perform_incremental_backup(&self) -> Result<BackupMetadata> {
        self.run_backup(BackupType::Incremental).await
    }

    async fn run_backup(&self, backup_type: BackupType) -> Result<BackupMetadata> {
        let _guard = BusyGuard::acquire(&self.busy, &format!("{backup_type} backup"))?;
        let config = self.config().await;
        let now = Utc::now();

        let base = match backup_type {
            BackupType::Full => None,
            _ => Some(
                self.repository
                    .latest(
                        &BackupFilter::all()
                            .with_type(BackupType::Full)
                            .with_status(BackupStatus::Success),
                    )
                    .await?
                    .ok_or_else(|| BackupError::Precondition {
                        message: "No full backup found; run a full backup first".to_string(),
                    })?,
            ),
        };

        let adapters = build_adapters(&config, self.runner.clone())?;
        if adapters.is_empty() {
            return Err(BackupError::Configuration {
                message: "No stores are enabled".to_string(),
            });
        }

        let backup_id = Uuid::new_v4().to_string();
        let artifact_dir = config.artifacts_dir().join(&backup_id);
        let work_dir = config.work_dir().join(&backup_id);
        let retention_until = config.retention.calculate_retention_date(backup_type, now);

        let mut metadata = BackupMetadata::begin(
            backup_id.clone(),
            backup_type,
            now,
            retention_until,
            artifact_dir.clone(),
        );
        metadata.parent_id = base.as_ref().map(|b| b.id.clone());

        info!("Starting {} backup: {}", backup_type, backup_id);
        let timer = BackupRunTimer::new(self.metrics.clone());
        self.repository.save(&metadata).await?;

        let ctx = BackupContext {
            backup_id: backup_id.clone(),
            backup_type,
            since: base.as_ref().map(|b| b.timestamp),
            artifact_dir: artifact_dir.clone(),
            work_dir: work_dir.clone(),
        };

        let outcome = self
            .execute_backup(&config, &adapters, &ctx, &mut metadata)
            .await;
        remove_dir_if_exists(&work_dir).await;

        match outcome {
            Ok(()) => {
                info!(
                    "{} backup completed successfully: {} ({} bytes, stores: {:?})",
                    backup_type, backup_id, metadata.size_bytes, metadata.databases
                );

                if let Err(e) = self.register_recovery_point(&metadata).await {
                    warn!(
                        "Backup {} succeeded but its recovery point was not registered: {}",
                        backup_id, e
                    );
                }

                self.metrics
                    .record_backup_success(timer.started_at(), &metadata);
                self.notifier
                    .dispatch(BackupEvent::backup_succeeded(&metadata));
                Ok(metadata)
            }
            Err(e) => {
                error!("{} backup {} failed: {}", backup_type, backup_id, e);

                match metadata.fail(e.to_string(), Utc::now()) {
                    Ok(()) => {
                        if let Err(save_error) = self.repository.save(&metadata).await {
                            error!(
                                "Failed to record failure of backup {}: {}",
                                backup_id, save_error
                            );
                        }
                    }
                    Err(transition) => error!("{}", transition),
                }
                remove_dir_if_exists(&artifact_dir).await;

                self.metrics
                    .record_backup_failure(timer.started_at(), backup_type);
                self.notifier
                    .dispatch(BackupEvent::backup_failed(&backup_id, backup_type, &e));
                Err(e)
            }
        }
    }

    async fn execute_backup(
        &self,
        config: &BackupConfig,
        adapters: &[Arc<dyn StoreAdapter>],
        ctx: &BackupContext,
        metadata: &mut BackupMetadata,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&ctx.artifact_dir).await?;
        tokio::fs::create_dir_all(&ctx.work_dir).await?;

        for adapter in adapters {
            adapter.check_connection().await?;
            let artifact = adapter.backup(ctx).await?;
            debug!(
                "Store {} contributed {} ({} bytes)",
                artifact.store, artifact.file_name, artifact.size_bytes
            );
            metadata.record_artifact(artifact);
            self.repository.save(metadata).await?;
        }

        let size_bytes: u64 = metadata.artifacts.iter().map(|a| a.size_bytes).sum();
        let checksum = artifact_set_checksum(&metadata.artifacts);

        if let Some(remote) = self.remote_for(config) {
            let remote_path = remote.upload(&ctx.backup_id, &ctx.artifact_dir).await?;
            metadata.location.remote_path = Some(remote_path);
        }
        if !config.storage.redundant_paths.is_empty() {
            metadata.location.redundant_copies = replicate_redundant(
                &ctx.artifact_dir,
                &ctx.backup_id,
                &config.storage.redundant_paths,
            )
            .await?;
        }

        // Only adopt the terminal state once it is durable
        let mut completed = metadata.clone();
        completed.complete(size_bytes, checksum, Utc::now())?;
        self.repository.save(&completed).await?;
        *metadata = completed;
        Ok(())
    }

    fn remote_for(&self, config: &BackupConfig) -> Option<Arc<dyn RemoteStorage>> {
        if let Some(remote) = &self.remote {
            return Some(remote.clone());
        }
        config.storage.remote.as_ref().map(|remote| {
            Arc::new(S3CliRemoteStorage::new(remote.clone(), self.runner.clone()))
                as Arc<dyn RemoteStorage>
        })
    }

    async fn register_recovery_point(&self, metadata: &BackupMetadata) -> Result<()> {
        let records = self.repository.list(&BackupFilter::all()).await?;
        let chain = resolve_chain(metadata, &records).ok_or_else(|| BackupError::Precondition {
            message: format!("Backup {} has no restorable chain", metadata.id),
        })?;

        let previous = self.recovery_index.latest().await.map(|p| p.timestamp);
        let point = RecoveryPoint::from_chain(&chain, previous).ok_or_else(|| {
            BackupError::Precondition {
                message: format!("Backup {} produced an empty chain", metadata.id),
            }
        })?;
        self.recovery_index.register(point).await
    }

    /// Restore the chosen stores (default: every store in the backup)
    pub async fn restore_from_backup(
        &self,
        backup_id: &str,
        target_stores: Option<&[StoreKind]>,
    ) -> Result<()> {
        let _guard = BusyGuard::acquire(&self.busy, "restore")?;

        let metadata = self.get_backup(backup_id).await?;
        if !metadata.is_restorable() {
            return Err(BackupError::Precondition {
                message: format!(
                    "Backup {} is {}; only successful backups can be restored",
                    backup_id, metadata.status
                ),
            });
        }

        let targets = resolve_targets(&metadata, target_stores)?;
        let records = self.repository.list(&BackupFilter::all()).await?;
        let chain = resolve_chain(&metadata, &records).ok_or_else(|| BackupError::Precondition {
            message: format!("Backup {backup_id} has no restorable chain"),
        })?;

        info!(
            "Starting restore from backup {} ({} backups in chain, stores: {:?})",
            backup_id,
            chain.len(),
            targets
        );

        let result = self.restore_chain(&chain, &targets).await;
        self.metrics.record_restore("backup", result.is_ok());
        match &result {
            Ok(()) => {
                info!("Restore from backup {} completed successfully", backup_id);
                self.notifier
                    .dispatch(BackupEvent::restore_succeeded(backup_id));
            }
            Err(e) => {
                error!("Restore from backup {} failed: {}", backup_id, e);
                self.notifier
                    .dispatch(BackupEvent::restore_failed(backup_id, e));
            }
        }
        result
    }

    /// Restore to the newest recovery point at or before `target_time`
    pub async fn point_in_time_recovery(
        &self,
        target_time: DateTime<Utc>,
    ) -> Result<RecoveryPoint> {
        let _guard = BusyGuard::acquire(&self.busy, "point-in-time recovery")?;
        info!("Starting point-in-time recovery to {}", target_time);

        let records = self.repository.list(&BackupFilter::all()).await?;
        let (point, chain) = self
            .recovery_index
            .candidates_at(target_time)
            .await
            .into_iter()
            .find_map(|point| {
                let chain = chain_for_point(&point, &records)?;
                Some((point, chain))
            })
            .ok_or_else(|| BackupError::NotFound {
                message: format!("No restorable recovery point at or before {target_time}"),
            })?;

        validate_chain(&chain, target_time)?;

        let tip = chain
            .last()
            .map(|m| m.id.clone())
            .unwrap_or_default();
        let targets: Vec<StoreKind> = point.databases.iter().copied().collect();
        info!(
            "Recovering to {} using chain {:?}",
            point.timestamp, point.backup_ids
        );

        let result = self.restore_chain(&chain, &targets).await;
        self.metrics.record_restore("point_in_time", result.is_ok());
        match result {
            Ok(()) => {
                info!("Point-in-time recovery to {} completed", point.timestamp);
                self.notifier.dispatch(BackupEvent::restore_succeeded(&tip));
                Ok(point)
            }
            Err(e) => {
                error!("Point-in-time recovery to {} failed: {}", target_time, e);
                self.notifier
                    .dispatch(BackupEvent::restore_failed(&tip, &e));
                Err(e)
            }
        }
    }

    /// Integrity check, pause, apply the chain, resume, verify
    async fn restore_chain(&self, chain: &[BackupMetadata], targets: &[StoreKind]) -> Result<()> {
        let config = self.config().await;
        let adapters = build_adapters(&config, self.runner.clone())?;

        let mut selected = Vec::with_capacity(targets.len());
        for store in targets {
            let adapter = adapters
                .iter()
                .find(|a| a.kind() == *store)
                .ok_or_else(|| BackupError::Precondition {
                    message: format!("Store {store} is not enabled in the current configuration"),
                })?;
            selected.push(adapter.clone());
        }

        for metadata in chain {
            let issues = self.verifier.verify_checksums(metadata).await?;
            if !issues.is_empty() {
                return Err(BackupError::Integrity {
                    message: format!(
                        "Backup {} failed integrity verification: {}",
                        metadata.id,
                        issues.join("; ")
                    ),
                });
            }
        }

        let scratch_root = config
            .work_dir()
            .join(format!("restore-{}", Uuid::new_v4()));

        info!("Pausing dependent services");
        let applied = match self.services.pause().await {
            Ok(()) => self.apply_chain(chain, &selected, &scratch_root).await,
            Err(e) => {
                error!("Failed to pause services: {}", e);
                Err(e)
            }
        };

        info!("Resuming dependent services");
        let resumed = self.services.resume().await;
        remove_dir_if_exists(&scratch_root).await;

        match (applied, resumed) {
            (Err(e), Err(resume_error)) => {
                error!(
                    "Services could not be resumed after a failed restore: {}",
                    resume_error
                );
                return Err(e);
            }
            (Err(e), Ok(())) => return Err(e),
            (Ok(()), Err(resume_error)) => return Err(resume_error),
            (Ok(()), Ok(())) => {}
        }

        for adapter in &selected {
            adapter.check_connection().await.map_err(|e| {
                error!("Post-restore verification of {} failed: {}", adapter.kind(), e);
                e
            })?;
        }
        Ok(())
    }

    async fn apply_chain(
        &self,
        chain: &[BackupMetadata],
        adapters: &[Arc<dyn StoreAdapter>],
        scratch_root: &Path,
    ) -> Result<()> {
        for metadata in chain {
            for adapter in adapters {
                let Some(artifact) = metadata.artifact_for(adapter.kind()) else {
                    debug!("Backup {} has no {} artifact", metadata.id, adapter.kind());
                    continue;
                };

                let ctx = RestoreContext {
                    artifact_dir: metadata.location.local_path.clone(),
                    scratch_dir: scratch_root
                        .join(&metadata.id)
                        .join(adapter.kind().as_str()),
                };
                tokio::fs::create_dir_all(&ctx.scratch_dir).await?;

                info!("Restoring {} from backup {}", adapter.kind(), metadata.id);
                adapter.restore(artifact, &ctx).await?;
            }
        }
        Ok(())
    }

    /// Checksums plus a sandbox restore; `false` for a backup that fails
    /// validation, `Err` only when the check itself could not run.
    pub async fn test_backup_integrity(&self, backup_id: &str) -> Result<bool> {
        let metadata = self.get_backup(backup_id).await?;
        if !metadata.is_restorable() {
            warn!(
                "Backup {} is {}; integrity test fails",
                backup_id, metadata.status
            );
            return Ok(false);
        }
        Ok(self.verify_record(&metadata).await?.passed())
    }

    /// Detailed report behind [`Self::test_backup_integrity`]
    pub async fn verify_backup(&self, backup_id: &str) -> Result<VerificationResult> {
        let metadata = self.get_backup(backup_id).await?;
        if !metadata.is_restorable() {
            return Ok(VerificationResult {
                backup_id: metadata.id.clone(),
                verification_time: Utc::now(),
                checksum_verified: false,
                sandbox_restore_passed: false,
                duration_ms: 0,
                issues_found: vec![format!("Backup status is {}", metadata.status)],
            });
        }
        self.verify_record(&metadata).await
    }

    async fn verify_record(&self, metadata: &BackupMetadata) -> Result<VerificationResult> {
        let config = self.config().await;
        let adapters = build_adapters(&config, self.runner.clone())?;
        let result = self.verifier.verify_backup(metadata, &adapters).await?;

        self.metrics.record_verification(result.passed());
        if result.passed() {
            if let Err(e) = self.recovery_index.mark_verified(&metadata.id).await {
                warn!(
                    "Failed to mark recovery points of {} verified: {}",
                    metadata.id, e
                );
            }
        } else {
            self.notifier.dispatch(BackupEvent::integrity_check_failed(
                &metadata.id,
                &result.issues_found,
            ));
        }
        Ok(result)
    }

    pub async fn get_backup_statistics(&self) -> Result<BackupStatistics> {
        let records = self.repository.list(&BackupFilter::all()).await?;
        Ok(BackupStatistics::from_records(&records, Utc::now()))
    }

    pub async fn list_backups(&self, filter: &BackupFilter) -> Result<Vec<BackupMetadata>> {
        self.repository.list(filter).await
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<BackupMetadata> {
        self.repository
            .get(backup_id)
            .await?
            .ok_or_else(|| BackupError::NotFound {
                message: format!("Backup {backup_id} not found"),
            })
    }

    /// Remove backups past their retention date. A full backup that a
    /// live incremental still builds on is kept.
    pub async fn purge_expired_backups(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        let _guard = BusyGuard::acquire(&self.busy, "retention purge")?;
        let config = self.config().await;
        let records = self.repository.list(&BackupFilter::all()).await?;

        let live_parents: HashSet<&str> = records
            .iter()
            .filter(|m| m.backup_type == BackupType::Incremental && !m.is_expired(now))
            .filter_map(|m| m.parent_id.as_deref())
            .collect();

        let mut report = PurgeReport::default();
        for metadata in records.iter().filter(|m| m.is_expired(now)) {
            if metadata.status == BackupStatus::InProgress {
                continue;
            }
            if live_parents.contains(metadata.id.as_str()) {
                debug!("Keeping expired base backup {}", metadata.id);
                report.retained.push(metadata.id.clone());
                continue;
            }

            remove_dir_if_exists(&metadata.location.local_path).await;
            for copy in &metadata.location.redundant_copies {
                remove_dir_if_exists(copy).await;
            }
            if let (Some(remote_path), Some(remote)) =
                (&metadata.location.remote_path, self.remote_for(&config))
            {
                if let Err(e) = remote.delete(remote_path).await {
                    warn!("Failed to delete remote copy {}: {}", remote_path, e);
                }
            }

            self.repository.delete(&metadata.id).await?;
            self.recovery_index.remove_referencing(&metadata.id).await?;
            info!(
                "Purged expired {} backup {} (retention until {})",
                metadata.backup_type, metadata.id, metadata.retention_until
            );
            report.purged.push(metadata.id.clone());
        }

        self.metrics.record_purged(report.purged.len());
        Ok(report)
    }

    /// Swap in a new configuration. Refused while an operation runs; the
    /// storage root cannot move because the catalog lives under it.
    pub async fn reconfigure(&self, new_config: BackupConfig) -> Result<()> {
        new_config
            .validate()
            .map_err(|e| BackupError::Configuration {
                message: e.to_string(),
            })?;
        let _guard = BusyGuard::acquire(&self.busy, "reconfiguration")?;

        let mut current = self.config.write().await;
        if current.storage.local_root != new_config.storage.local_root {
            return Err(BackupError::Configuration {
                message: "storage.local_root cannot change at runtime".to_string(),
            });
        }

        info!("Backup configuration updated: {}", new_config.summary());
        *current = Arc::new(new_config);
        Ok(())
    }
}

fn resolve_targets(
    metadata: &BackupMetadata,
    requested: Option<&[StoreKind]>,
) -> Result<Vec<StoreKind>> {
    let Some(requested) = requested else {
        return Ok(metadata.databases.iter().copied().collect());
    };

    if let Some(missing) = requested.iter().find(|s| !metadata.databases.contains(s)) {
        return Err(BackupError::Precondition {
            message: format!("Backup {} does not contain store {}", metadata.id, missing),
        });
    }

    Ok(StoreKind::BACKUP_ORDER
        .into_iter()
        .filter(|s| requested.contains(s))
        .collect())
}

/// Catalog records behind a recovery point, if every one is restorable
fn chain_for_point(point: &RecoveryPoint, records: &[BackupMetadata]) -> Option<Vec<BackupMetadata>> {
    let chain: Option<Vec<BackupMetadata>> = point
        .backup_ids
        .iter()
        .map(|id| {
            records
                .iter()
                .find(|m| &m.id == id && m.is_restorable())
                .cloned()
        })
        .collect();
    let chain = chain?;
    validate_chain(&chain, point.timestamp).ok()?;
    Some(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::PathBuf;

    fn record(id: &str, status: BackupStatus, size: u64, days_left: i64) -> BackupMetadata {
        let now = Utc::now();
        let mut metadata = BackupMetadata::begin(
            id.to_string(),
            BackupType::Full,
            now,
            now + Duration::days(days_left),
            PathBuf::from("/b"),
        );
        match status {
            BackupStatus::Success => metadata.complete(size, "x".to_string(), now).unwrap(),
            BackupStatus::Failed => metadata.fail("boom".to_string(), now).unwrap(),
            BackupStatus::InProgress => {}
        }
        metadata
    }

    #[test]
    fn statistics_of_empty_catalog() {
        let stats = BackupStatistics::from_records(&[], Utc::now());
        assert_eq!(stats.total_backups, 0);
        assert_eq!(stats.average_size_bytes, 0);
        assert!(stats.newest_backup.is_none());
        assert!(stats.retention_compliant);
    }

    #[test]
    fn statistics_aggregate_counts_and_sizes() {
        let records = vec![
            record("a", BackupStatus::Success, 100, 10),
            record("b", BackupStatus::Failed, 0, 10),
            record("c", BackupStatus::InProgress, 0, 10),
            record("d", BackupStatus::Success, 50, -1),
        ];
        let stats = BackupStatistics::from_records(&records, Utc::now());

        assert_eq!(stats.total_backups, 4);
        assert_eq!(stats.successful_backups, 2);
        assert_eq!(stats.failed_backups, 1);
        assert_eq!(stats.in_progress_backups, 1);
        assert!(stats.successful_backups + stats.failed_backups <= stats.total_backups);
        assert_eq!(stats.total_size_bytes, 150);
        assert_eq!(stats.average_size_bytes, 150 / 4);
        assert_eq!(stats.backups_by_type.get("full"), Some(&4));
        assert!(!stats.retention_compliant);
    }

    #[test]
    fn busy_guard_is_exclusive_and_released_on_drop() {
        let flag = Arc::new(Mutex::new(false));
        let guard = BusyGuard::acquire(&flag, "backup").unwrap();
        assert!(matches!(
            BusyGuard::acquire(&flag, "backup"),
            Err(BackupError::Conflict { .. })
        ));
        drop(guard);
        assert!(BusyGuard::acquire(&flag, "backup").is_ok());
    }

    #[test]
    fn targets_must_be_in_the_backup() {
        let mut metadata = record("a", BackupStatus::Success, 1, 1);
        metadata.databases.insert(StoreKind::Document);
        metadata.databases.insert(StoreKind::Relational);

        assert_eq!(
            resolve_targets(&metadata, None).unwrap(),
            vec![StoreKind::Relational, StoreKind::Document]
        );
        assert_eq!(
            resolve_targets(&metadata, Some(&[StoreKind::Document])).unwrap(),
            vec![StoreKind::Document]
        );
        assert!(matches!(
            resolve_targets(&metadata, Some(&[StoreKind::KeyValue])),
            Err(BackupError::Precondition { .. })
        ));
    }
}
