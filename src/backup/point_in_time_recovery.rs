use super::repository::write_json_atomic;
use super::{BackupError, BackupMetadata, BackupType, Result, StoreKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Restore throughput assumed by RTO estimates
const RESTORE_BYTES_PER_MINUTE: u64 = 100 * 1024 * 1024;

/// A point the system can be recovered to, and the chain that gets there
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub databases: BTreeSet<StoreKind>,
    /// One full backup followed by zero or more incrementals
    pub backup_ids: Vec<String>,
    pub verified: bool,
    pub estimated_rto_minutes: u64,
    pub estimated_rpo_minutes: u64,
}

impl RecoveryPoint {
    /// Build the point reached by restoring `chain` in order
    pub fn from_chain(chain: &[BackupMetadata], previous: Option<DateTime<Utc>>) -> Option<Self> {
        let last = chain.last()?;
        let total_bytes: u64 = chain.iter().map(|m| m.size_bytes).sum();

        Some(Self {
            timestamp: last.recovery_point,
            backup_type: last.backup_type,
            databases: last.databases.clone(),
            backup_ids: chain.iter().map(|m| m.id.clone()).collect(),
            verified: false,
            estimated_rto_minutes: estimate_rto_minutes(total_bytes, chain.len()),
            estimated_rpo_minutes: previous
                .map(|prev| (last.recovery_point - prev).num_minutes().max(0) as u64)
                .unwrap_or(0),
        })
    }

    pub fn tip(&self) -> Option<&str> {
        self.backup_ids.last().map(String::as_str)
    }
}

/// Transfer time at the assumed throughput plus a minute per chain link
pub fn estimate_rto_minutes(total_bytes: u64, chain_len: usize) -> u64 {
    total_bytes.div_ceil(RESTORE_BYTES_PER_MINUTE) + chain_len as u64
}

/// Backups needed to restore `target`: the target itself for a full backup,
/// otherwise its base full backup, the intermediate incrementals of the
/// same base, then the target. `None` when a link is missing or not
/// restorable.
pub fn resolve_chain(target: &BackupMetadata, records: &[BackupMetadata]) -> Option<Vec<BackupMetadata>> {
    if !target.is_restorable() {
        return None;
    }

    match target.backup_type {
        BackupType::Full => Some(vec![target.clone()]),
        BackupType::Incremental => {
            let parent_id = target.parent_id.as_deref()?;
            let base = records
                .iter()
                .find(|m| m.id == parent_id && m.backup_type == BackupType::Full)
                .filter(|m| m.is_restorable())?;

            let mut intermediates: Vec<BackupMetadata> = records
                .iter()
                .filter(|m| {
                    m.backup_type == BackupType::Incremental
                        && m.parent_id.as_deref() == Some(parent_id)
                        && m.is_restorable()
                        && m.id != target.id
                        && m.timestamp > base.timestamp
                        && m.timestamp < target.timestamp
                })
                .cloned()
                .collect();
            intermediates.sort_by_key(|m| m.timestamp);

            let mut chain = Vec::with_capacity(intermediates.len() + 2);
            chain.push(base.clone());
            chain.extend(intermediates);
            chain.push(target.clone());
            Some(chain)
        }
        BackupType::Log | BackupType::Differential => None,
    }
}

/// Full first with timestamp <= `point`, then incrementals in strictly
/// increasing timestamp order, none after `point`.
pub fn validate_chain(chain: &[BackupMetadata], point: DateTime<Utc>) -> Result<()> {
    let invalid = |message: String| BackupError::Precondition { message };

    let first = chain
        .first()
        .ok_or_else(|| invalid("Recovery chain is empty".to_string()))?;
    if first.backup_type != BackupType::Full {
        return Err(invalid(format!(
            "Recovery chain must start with a full backup, found {} ({})",
            first.id, first.backup_type
        )));
    }

    let mut previous: Option<&BackupMetadata> = None;
    for metadata in chain {
        if !metadata.is_restorable() {
            return Err(invalid(format!(
                "Backup {} in recovery chain is {}",
                metadata.id, metadata.status
            )));
        }
        if metadata.timestamp > point {
            return Err(invalid(format!(
                "Backup {} is later than the recovery target {}",
                metadata.id, point
            )));
        }
        if let Some(prev) = previous {
            if metadata.backup_type != BackupType::Incremental {
                return Err(invalid(format!(
                    "Backup {} after the base must be incremental",
                    metadata.id
                )));
            }
            if metadata.timestamp <= prev.timestamp {
                return Err(invalid(format!(
                    "Backup {} is not newer than {}",
                    metadata.id, prev.id
                )));
            }
        }
        previous = Some(metadata);
    }
    Ok(())
}

/// Recovery points ordered by timestamp, persisted as one JSON file
#[derive(Debug)]
pub struct RecoveryPointIndex {
    path: Option<PathBuf>,
    points: RwLock<Vec<RecoveryPoint>>,
}

impl RecoveryPointIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            points: RwLock::new(Vec::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            points: RwLock::new(Vec::new()),
        }
    }

    /// Returns `false` when there is no index file yet
    pub async fn load(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(true);
        };

        match tokio::fs::read(path).await {
            Ok(raw) => {
                let mut points: Vec<RecoveryPoint> = serde_json::from_slice(&raw)?;
                points.sort_by_key(|p| p.timestamp);
                debug!("Loaded {} recovery points", points.len());
                *self.points.write().await = points;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, points: &[RecoveryPoint]) -> Result<()> {
        match &self.path {
            Some(path) => write_json_atomic(path, &points).await,
            None => Ok(()),
        }
    }

    pub async fn register(&self, point: RecoveryPoint) -> Result<()> {
        let mut points = self.points.write().await;
        let position = points.partition_point(|p| p.timestamp <= point.timestamp);
        info!(
            "Registering recovery point {} ({} backups)",
            point.timestamp,
            point.backup_ids.len()
        );
        points.insert(position, point);
        self.persist(&points).await
    }

    pub async fn points(&self) -> Vec<RecoveryPoint> {
        self.points.read().await.clone()
    }

    pub async fn latest(&self) -> Option<RecoveryPoint> {
        self.points.read().await.last().cloned()
    }

    /// Points at or before `target`, newest first
    pub async fn candidates_at(&self, target: DateTime<Utc>) -> Vec<RecoveryPoint> {
        self.points
            .read()
            .await
            .iter()
            .rev()
            .filter(|p| p.timestamp <= target)
            .cloned()
            .collect()
    }

    /// Mark points whose chain ends at `backup_id` as verified
    pub async fn mark_verified(&self, backup_id: &str) -> Result<usize> {
        let mut points = self.points.write().await;
        let mut updated = 0;
        for point in points.iter_mut() {
            if point.tip() == Some(backup_id) && !point.verified {
                point.verified = true;
                updated += 1;
            }
        }
        if updated > 0 {
            self.persist(&points).await?;
        }
        Ok(updated)
    }

    /// Drop every point whose chain includes `backup_id`
    pub async fn remove_referencing(&self, backup_id: &str) -> Result<usize> {
        let mut points = self.points.write().await;
        let before = points.len();
        points.retain(|p| !p.backup_ids.iter().any(|id| id == backup_id));
        let removed = before - points.len();
        if removed > 0 {
            self.persist(&points).await?;
        }
        Ok(removed)
    }

    /// Recompute every point from catalog records, keeping verified flags
    /// of points that still exist.
    pub async fn rebuild_from(&self, records: &[BackupMetadata]) -> Result<usize> {
        let mut points = self.points.write().await;
        let verified: BTreeSet<Vec<String>> = points
            .iter()
            .filter(|p| p.verified)
            .map(|p| p.backup_ids.clone())
            .collect();

        let mut ordered: Vec<&BackupMetadata> =
            records.iter().filter(|m| m.is_restorable()).collect();
        ordered.sort_by_key(|m| m.recovery_point);

        let mut rebuilt: Vec<RecoveryPoint> = Vec::new();
        for metadata in ordered {
            match resolve_chain(metadata, records) {
                Some(chain) => {
                    let previous = rebuilt.last().map(|p| p.timestamp);
                    if let Some(mut point) = RecoveryPoint::from_chain(&chain, previous) {
                        point.verified = verified.contains(&point.backup_ids);
                        rebuilt.push(point);
                    }
                }
                None => warn!(
                    "Backup {} has no restorable chain; skipping recovery point",
                    metadata.id
                ),
            }
        }

        let count = rebuilt.len();
        *points = rebuilt;
        self.persist(&points).await?;
        info!("Rebuilt {} recovery points from the catalog", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupStatus;
    use chrono::Duration;
    use tempfile::TempDir;

    fn success(id: &str, backup_type: BackupType, ts: DateTime<Utc>, parent: Option<&str>) -> BackupMetadata {
        let mut metadata = BackupMetadata::begin(
            id.to_string(),
            backup_type,
            ts,
            ts + Duration::days(30),
            PathBuf::from(format!("/backups/{id}")),
        );
        metadata.parent_id = parent.map(str::to_string);
        metadata.complete(10, "sum".to_string(), ts).unwrap();
        metadata
    }

    #[test]
    fn incremental_chain_includes_base_and_intermediates() {
        let t0 = Utc::now() - Duration::hours(10);
        let full = success("full", BackupType::Full, t0, None);
        let inc1 = success("inc1", BackupType::Incremental, t0 + Duration::hours(1), Some("full"));
        let inc2 = success("inc2", BackupType::Incremental, t0 + Duration::hours(2), Some("full"));
        let inc3 = success("inc3", BackupType::Incremental, t0 + Duration::hours(3), Some("full"));
        let records = vec![inc3.clone(), full.clone(), inc2.clone(), inc1.clone()];

        let chain = resolve_chain(&inc2, &records).unwrap();
        let ids: Vec<_> = chain.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["full", "inc1", "inc2"]);
        validate_chain(&chain, inc2.timestamp).unwrap();

        assert!(validate_chain(&chain, inc1.timestamp).is_err());
        assert_eq!(resolve_chain(&full, &records).unwrap().len(), 1);
    }

    #[test]
    fn chain_is_unresolvable_without_a_restorable_base() {
        let t0 = Utc::now();
        let mut base = BackupMetadata::begin(
            "full".to_string(),
            BackupType::Full,
            t0,
            t0,
            PathBuf::from("/b"),
        );
        base.fail("boom".to_string(), t0).unwrap();
        assert_eq!(base.status, BackupStatus::Failed);

        let inc = success("inc", BackupType::Incremental, t0 + Duration::hours(1), Some("full"));
        assert!(resolve_chain(&inc, &[base, inc.clone()]).is_none());
    }

    #[test]
    fn validate_rejects_out_of_order_chains() {
        let t0 = Utc::now() - Duration::hours(5);
        let full = success("full", BackupType::Full, t0, None);
        let inc = success("inc", BackupType::Incremental, t0 + Duration::hours(1), Some("full"));

        assert!(validate_chain(&[inc.clone(), full.clone()], Utc::now()).is_err());
        assert!(validate_chain(&[full.clone(), inc.clone(), inc.clone()], Utc::now()).is_err());
        assert!(validate_chain(&[], Utc::now()).is_err());
        validate_chain(&[full, inc], Utc::now()).unwrap();
    }

    #[test]
    fn rto_estimate_scales_with_size_and_length() {
        assert_eq!(estimate_rto_minutes(0, 1), 1);
        assert_eq!(estimate_rto_minutes(RESTORE_BYTES_PER_MINUTE + 1, 2), 4);
    }

    #[tokio::test]
    async fn index_persists_and_tracks_verification() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("recovery_points.json");
        let t0 = Utc::now() - Duration::hours(4);
        let full = success("full", BackupType::Full, t0, None);
        let inc = success("inc", BackupType::Incremental, t0 + Duration::hours(1), Some("full"));

        let index = RecoveryPointIndex::new(&path);
        assert!(!index.load().await.unwrap());
        index
            .register(RecoveryPoint::from_chain(&[full.clone()], None).unwrap())
            .await
            .unwrap();
        index
            .register(
                RecoveryPoint::from_chain(&[full.clone(), inc.clone()], Some(full.recovery_point))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(index.mark_verified("inc").await.unwrap(), 1);

        let reopened = RecoveryPointIndex::new(&path);
        assert!(reopened.load().await.unwrap());
        let points = reopened.points().await;
        assert_eq!(points.len(), 2);
        assert!(!points[0].verified);
        assert!(points[1].verified);
        assert_eq!(points[1].estimated_rpo_minutes, 60);

        let at = reopened.candidates_at(t0 + Duration::minutes(30)).await;
        assert_eq!(at.len(), 1);
        assert_eq!(at[0].backup_ids, vec!["full".to_string()]);

        assert_eq!(reopened.remove_referencing("full").await.unwrap(), 2);
        assert!(reopened.points().await.is_empty());
    }

    #[tokio::test]
    async fn rebuild_recovers_points_from_records() {
        let index = RecoveryPointIndex::in_memory();
        let t0 = Utc::now() - Duration::hours(3);
        let records = vec![
            success("full", BackupType::Full, t0, None),
            success("inc", BackupType::Incremental, t0 + Duration::hours(1), Some("full")),
        ];

        assert_eq!(index.rebuild_from(&records).await.unwrap(), 2);
        let latest = index.latest().await.unwrap();
        assert_eq!(latest.backup_ids, vec!["full".to_string(), "inc".to_string()]);
    }
}
