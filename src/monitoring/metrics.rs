use crate::backup::{BackupMetadata, BackupType};
use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Prometheus metrics for backup, restore and verification runs
pub struct BackupMetrics {
    registry: Arc<Registry>,

    // Backup runs
    pub backups_total: IntCounterVec,
    pub backup_duration_seconds: Histogram,
    pub backups_in_progress: IntGauge,
    pub last_success_timestamp_seconds: IntGauge,
    pub last_backup_size_bytes: IntGauge,

    // Restores
    pub restores_total: IntCounterVec,

    // Verification
    pub verifications_total: IntCounterVec,

    // Retention
    pub purged_backups_total: IntCounter,
}

impl std::fmt::Debug for BackupMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupMetrics").finish_non_exhaustive()
    }
}

impl BackupMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let backups_total = IntCounterVec::new(
            Opts::new("codex_backups_total", "Backup runs by type and outcome"),
            &["type", "status"],
        )?;
        registry.register(Box::new(backups_total.clone()))?;

        let backup_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "codex_backup_duration_seconds",
                "Duration of backup runs in seconds",
            )
            .buckets(exponential_buckets(1.0, 2.0, 14)?),
        )?;
        registry.register(Box::new(backup_duration_seconds.clone()))?;

        let backups_in_progress = IntGauge::with_opts(Opts::new(
            "codex_backups_in_progress",
            "Backup runs currently executing",
        ))?;
        registry.register(Box::new(backups_in_progress.clone()))?;

        let last_success_timestamp_seconds = IntGauge::with_opts(Opts::new(
            "codex_backup_last_success_timestamp_seconds",
            "Unix time of the newest successful backup",
        ))?;
        registry.register(Box::new(last_success_timestamp_seconds.clone()))?;

        let last_backup_size_bytes = IntGauge::with_opts(Opts::new(
            "codex_backup_last_size_bytes",
            "Size of the newest successful backup",
        ))?;
        registry.register(Box::new(last_backup_size_bytes.clone()))?;

        let restores_total = IntCounterVec::new(
            Opts::new("codex_restores_total", "Restore runs by kind and outcome"),
            &["kind", "status"],
        )?;
        registry.register(Box::new(restores_total.clone()))?;

        let verifications_total = IntCounterVec::new(
            Opts::new("codex_backup_verifications_total", "Integrity tests by outcome"),
            &["status"],
        )?;
        registry.register(Box::new(verifications_total.clone()))?;

        let purged_backups_total = IntCounter::with_opts(Opts::new(
            "codex_backups_purged_total",
            "Backups removed by the retention reaper",
        ))?;
        registry.register(Box::new(purged_backups_total.clone()))?;

        Ok(Self {
            registry,
            backups_total,
            backup_duration_seconds,
            backups_in_progress,
            last_success_timestamp_seconds,
            last_backup_size_bytes,
            restores_total,
            verifications_total,
            purged_backups_total,
        })
    }

    pub fn record_backup_success(&self, start_time: Instant, metadata: &BackupMetadata) {
        self.backup_duration_seconds
            .observe(start_time.elapsed().as_secs_f64());
        let backup_type = metadata.backup_type.to_string();
        self.backups_total
            .with_label_values(&[backup_type.as_str(), "success"])
            .inc();
        self.last_success_timestamp_seconds
            .set(metadata.completed_at.unwrap_or(metadata.timestamp).timestamp());
        self.last_backup_size_bytes
            .set(i64::try_from(metadata.size_bytes).unwrap_or(i64::MAX));
    }

    pub fn record_backup_failure(&self, start_time: Instant, backup_type: BackupType) {
        self.backup_duration_seconds
            .observe(start_time.elapsed().as_secs_f64());
        let backup_type = backup_type.to_string();
        self.backups_total
            .with_label_values(&[backup_type.as_str(), "failed"])
            .inc();
    }

    /// `kind` is `backup` or `point_in_time`
    pub fn record_restore(&self, kind: &str, success: bool) {
        let status = if success { "success" } else { "failed" };
        self.restores_total.with_label_values(&[kind, status]).inc();
    }

    pub fn record_verification(&self, passed: bool) {
        let status = if passed { "passed" } else { "failed" };
        self.verifications_total.with_label_values(&[status]).inc();
    }

    pub fn record_purged(&self, count: usize) {
        self.purged_backups_total.inc_by(count as u64);
    }

    /// Get metrics in Prometheus format
    pub fn gather_metrics(&self) -> String {
        use prometheus::TextEncoder;
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_else(|e| {
                error!("Failed to encode metrics: {}", e);
                String::new()
            })
    }
}

/// Keeps `backups_in_progress` accurate for the lifetime of a run
pub struct BackupRunTimer {
    start: Instant,
    metrics: Arc<BackupMetrics>,
}

impl BackupRunTimer {
    pub fn new(metrics: Arc<BackupMetrics>) -> Self {
        metrics.backups_in_progress.inc();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.start
    }
}

impl Drop for BackupRunTimer {
    fn drop(&mut self) {
        self.metrics.backups_in_progress.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    #[test]
    fn test_metrics_collector_creation() {
        let metrics = BackupMetrics::new().unwrap();
        assert_eq!(metrics.backups_in_progress.get(), 0);
        assert_eq!(metrics.purged_backups_total.get(), 0);
    }

    #[test]
    fn records_show_up_in_exposition() {
        let metrics = Arc::new(BackupMetrics::new().unwrap());
        let now = Utc::now();
        let mut metadata = BackupMetadata::begin(
            "b1".to_string(),
            BackupType::Full,
            now,
            now,
            PathBuf::from("/b1"),
        );
        metadata.complete(2048, "sum".to_string(), now).unwrap();

        {
            let timer = BackupRunTimer::new(metrics.clone());
            assert_eq!(metrics.backups_in_progress.get(), 1);
            metrics.record_backup_success(timer.started_at(), &metadata);
        }
        assert_eq!(metrics.backups_in_progress.get(), 0);

        metrics.record_restore("backup", false);
        let text = metrics.gather_metrics();
        let has_line = |parts: &[&str]| {
            text.lines()
                .any(|line| parts.iter().all(|part| line.contains(part)))
        };
        assert!(has_line(&["codex_backups_total{", "type=\"full\"", "status=\"success\"", "} 1"]));
        assert!(has_line(&["codex_backup_last_size_bytes 2048"]));
        assert!(has_line(&["codex_restores_total{", "kind=\"backup\"", "status=\"failed\"", "} 1"]));
    }
}
