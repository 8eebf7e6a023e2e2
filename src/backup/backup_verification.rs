use super::{
    file_checksum, BackupError, BackupMetadata, RestoreContext, Result, StoreAdapter,
    StoreArtifact,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationStats {
    pub total_verifications: u64,
    pub successful_verifications: u64,
    pub failed_verifications: u64,
    pub last_verification_time: Option<DateTime<Utc>>,
    pub average_verification_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub backup_id: String,
    pub verification_time: DateTime<Utc>,
    pub checksum_verified: bool,
    pub sandbox_restore_passed: bool,
    pub duration_ms: u64,
    pub issues_found: Vec<String>,
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        self.checksum_verified && self.sandbox_restore_passed && self.issues_found.is_empty()
    }
}

/// Digest over the per-artifact checksums, in recorded order
pub fn artifact_set_checksum(artifacts: &[StoreArtifact]) -> String {
    let mut hasher = Sha256::new();
    for artifact in artifacts {
        hasher.update(format!("{}:{}:{}\n", artifact.store, artifact.file_name, artifact.checksum));
    }
    format!("{:x}", hasher.finalize())
}

/// Checksum and sandbox-restore checks that never touch live stores
#[derive(Debug)]
pub struct IntegrityVerifier {
    sandbox_root: PathBuf,
    stats: Arc<RwLock<VerificationStats>>,
}

impl IntegrityVerifier {
    pub fn new(sandbox_root: impl Into<PathBuf>) -> Self {
        Self {
            sandbox_root: sandbox_root.into(),
            stats: Arc::new(RwLock::new(VerificationStats::default())),
        }
    }

    pub async fn stats(&self) -> VerificationStats {
        self.stats.read().await.clone()
    }

    /// Compare every artifact on disk against the catalog. Mismatches come
    /// back as issues; only unexpected I/O failures are errors.
    pub async fn verify_checksums(&self, metadata: &BackupMetadata) -> Result<Vec<String>> {
        let mut issues = Vec::new();

        for store in &metadata.databases {
            if metadata.artifact_for(*store).is_none() {
                issues.push(format!("No artifact recorded for {store}"));
            }
        }

        for artifact in &metadata.artifacts {
            let path = metadata.location.local_path.join(&artifact.file_name);
            let size = match tokio::fs::metadata(&path).await {
                Ok(m) => m.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    issues.push(format!("Artifact {} is missing", artifact.file_name));
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if size != artifact.size_bytes {
                issues.push(format!(
                    "Artifact {} is {} bytes, expected {}",
                    artifact.file_name, size, artifact.size_bytes
                ));
            }

            let actual = file_checksum(&path).await?;
            if actual != artifact.checksum {
                issues.push(format!(
                    "Checksum mismatch for {}: expected {}, found {}",
                    artifact.file_name, artifact.checksum, actual
                ));
            }
        }

        let expected_set = artifact_set_checksum(&metadata.artifacts);
        if metadata.checksum != expected_set {
            issues.push(format!(
                "Backup checksum {} does not match its artifacts ({})",
                metadata.checksum, expected_set
            ));
        }

        let expected_size: u64 = metadata.artifacts.iter().map(|a| a.size_bytes).sum();
        if metadata.size_bytes != expected_size {
            issues.push(format!(
                "Backup size {} does not match its artifacts ({})",
                metadata.size_bytes, expected_size
            ));
        }

        Ok(issues)
    }

    /// Checksums, then a restore of every artifact into a throwaway
    /// sandbox directory.
    pub async fn verify_backup(
        &self,
        metadata: &BackupMetadata,
        adapters: &[Arc<dyn StoreAdapter>],
    ) -> Result<VerificationResult> {
        let started = Instant::now();
        info!("Verifying backup {}", metadata.id);

        let mut issues = self.verify_checksums(metadata).await?;
        let checksum_verified = issues.is_empty();

        let sandbox_restore_passed = if checksum_verified {
            let sandbox = self.sandbox_root.join(Uuid::new_v4().to_string());
            tokio::fs::create_dir_all(&sandbox).await?;
            let outcome = self
                .sandbox_restore(metadata, adapters, &sandbox, &mut issues)
                .await;
            remove_sandbox(&sandbox).await;
            outcome?
        } else {
            false
        };

        let result = VerificationResult {
            backup_id: metadata.id.clone(),
            verification_time: Utc::now(),
            checksum_verified,
            sandbox_restore_passed,
            duration_ms: started.elapsed().as_millis() as u64,
            issues_found: issues,
        };

        self.record(&result).await;
        if result.passed() {
            info!("Backup {} verified in {}ms", metadata.id, result.duration_ms);
        } else {
            warn!(
                "Backup {} failed verification: {}",
                metadata.id,
                result.issues_found.join("; ")
            );
        }
        Ok(result)
    }

    async fn sandbox_restore(
        &self,
        metadata: &BackupMetadata,
        adapters: &[Arc<dyn StoreAdapter>],
        sandbox: &Path,
        issues: &mut Vec<String>,
    ) -> Result<bool> {
        let mut passed = true;

        for artifact in &metadata.artifacts {
            let Some(adapter) = adapters.iter().find(|a| a.kind() == artifact.store) else {
                issues.push(format!("No adapter configured for {}", artifact.store));
                passed = false;
                continue;
            };

            let ctx = RestoreContext {
                artifact_dir: metadata.location.local_path.clone(),
                scratch_dir: sandbox.join(artifact.store.as_str()),
            };
            tokio::fs::create_dir_all(&ctx.scratch_dir).await?;

            match adapter.verify_sandbox(artifact, &ctx).await {
                Ok(()) => debug!("Sandbox restore of {} passed", artifact.file_name),
                Err(e) if e.is_validation_failure() => {
                    issues.push(format!("Sandbox restore of {} failed: {e}", artifact.store));
                    passed = false;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(passed)
    }

    async fn record(&self, result: &VerificationResult) {
        let mut stats = self.stats.write().await;
        let previous_total = stats.total_verifications as f64;
        stats.total_verifications += 1;
        if result.passed() {
            stats.successful_verifications += 1;
        } else {
            stats.failed_verifications += 1;
        }
        stats.last_verification_time = Some(result.verification_time);
        stats.average_verification_duration_ms = (stats.average_verification_duration_ms
            * previous_total
            + result.duration_ms as f64)
            / stats.total_verifications as f64;
    }
}

async fn remove_sandbox(sandbox: &Path) {
    match tokio::fs::remove_dir_all(sandbox).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to clean sandbox {}: {}", sandbox.display(), e),
    }
}

impl From<&VerificationResult> for BackupError {
    fn from(result: &VerificationResult) -> Self {
        BackupError::Integrity {
            message: format!(
                "Backup {} failed verification: {}",
                result.backup_id,
                result.issues_found.join("; ")
            ),
        }
    }
}
