use super::{BackupError, BackupMetadata, BackupStatus, BackupType, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub backup_type: Option<BackupType>,
    pub status: Option<BackupStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl BackupFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, backup_type: BackupType) -> Self {
        self.backup_type = Some(backup_type);
        self
    }

    pub fn with_status(mut self, status: BackupStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn matches(&self, metadata: &BackupMetadata) -> bool {
        self.backup_type.map_or(true, |t| metadata.backup_type == t)
            && self.status.map_or(true, |s| metadata.status == s)
            && self.since.map_or(true, |since| metadata.timestamp >= since)
            && self.until.map_or(true, |until| metadata.timestamp <= until)
    }
}

/// Repository abstraction for the backup catalog
#[async_trait]
pub trait BackupRepository: Send + Sync + std::fmt::Debug {
    /// Populate the index from durable storage; returns the record count
    async fn load(&self) -> Result<usize>;

    /// Insert or replace one record. Terminal records are immutable.
    async fn save(&self, metadata: &BackupMetadata) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<BackupMetadata>>;

    /// Matching records ordered by timestamp, oldest first
    async fn list(&self, filter: &BackupFilter) -> Result<Vec<BackupMetadata>>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn latest(&self, filter: &BackupFilter) -> Result<Option<BackupMetadata>> {
        Ok(self.list(filter).await?.pop())
    }
}

fn ensure_mutable(existing: Option<&BackupMetadata>, update: &BackupMetadata) -> Result<()> {
    match existing {
        Some(current) if current.status.is_terminal() && current != update => {
            Err(BackupError::Precondition {
                message: format!(
                    "Backup {} is {} and can no longer be modified",
                    current.id, current.status
                ),
            })
        }
        _ => Ok(()),
    }
}

fn sorted(mut records: Vec<BackupMetadata>) -> Vec<BackupMetadata> {
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    records
}

/// Write JSON next to the target, fsync, then rename over it
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let target = path.to_path_buf();
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staged = target.with_file_name(format!(".{file_name}.tmp"));

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut file = std::fs::File::create(&staged)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&staged, &target)?;
        Ok(())
    })
    .await?
}

/// One JSON document per backup under `<root>/metadata/<id>.json`, with a
/// write-through in-memory index.
#[derive(Debug)]
pub struct FileBackupRepository {
    metadata_dir: PathBuf,
    cache: RwLock<HashMap<String, BackupMetadata>>,
}

impl FileBackupRepository {
    pub fn new(metadata_dir: impl Into<PathBuf>) -> Self {
        Self {
            metadata_dir: metadata_dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.metadata_dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl BackupRepository for FileBackupRepository {
    async fn load(&self) -> Result<usize> {
        tokio::fs::create_dir_all(&self.metadata_dir).await?;

        let mut loaded = HashMap::new();
        let mut entries = tokio::fs::read_dir(&self.metadata_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }

            let parsed = tokio::fs::read(&path)
                .await
                .map_err(BackupError::from)
                .and_then(|raw| {
                    serde_json::from_slice::<BackupMetadata>(&raw).map_err(BackupError::from)
                });
            match parsed {
                Ok(metadata) => {
                    loaded.insert(metadata.id.clone(), metadata);
                }
                Err(e) => warn!("Skipping unreadable catalog record {}: {}", path.display(), e),
            }
        }

        let count = loaded.len();
        *self.cache.write().await = loaded;
        info!(
            "Loaded {} backup records from {}",
            count,
            self.metadata_dir.display()
        );
        Ok(count)
    }

    async fn save(&self, metadata: &BackupMetadata) -> Result<()> {
        let path = self
            .path_for(&metadata.id)
            .ok_or_else(|| BackupError::Precondition {
                message: format!("Invalid backup id '{}'", metadata.id),
            })?;

        // Holding the write lock across the durable write keeps the file and
        // the index in the same order.
        let mut cache = self.cache.write().await;
        ensure_mutable(cache.get(&metadata.id), metadata)?;

        tokio::fs::create_dir_all(&self.metadata_dir).await?;
        write_json_atomic(&path, metadata).await?;
        cache.insert(metadata.id.clone(), metadata.clone());

        debug!("Saved backup record {} ({})", metadata.id, metadata.status);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<BackupMetadata>> {
        Ok(self.cache.read().await.get(id).cloned())
    }

    async fn list(&self, filter: &BackupFilter) -> Result<Vec<BackupMetadata>> {
        let cache = self.cache.read().await;
        Ok(sorted(
            cache.values().filter(|m| filter.matches(m)).cloned().collect(),
        ))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Some(path) = self.path_for(id) else {
            return Ok(false);
        };

        let mut cache = self.cache.write().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(cache.remove(id).is_some())
    }
}

/// Catalog kept only in memory
#[derive(Debug, Default)]
pub struct InMemoryBackupRepository {
    records: RwLock<HashMap<String, BackupMetadata>>,
}

impl InMemoryBackupRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupRepository for InMemoryBackupRepository {
    async fn load(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }

    async fn save(&self, metadata: &BackupMetadata) -> Result<()> {
        let mut records = self.records.write().await;
        ensure_mutable(records.get(&metadata.id), metadata)?;
        records.insert(metadata.id.clone(), metadata.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<BackupMetadata>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self, filter: &BackupFilter) -> Result<Vec<BackupMetadata>> {
        let records = self.records.read().await;
        Ok(sorted(
            records.values().filter(|m| filter.matches(m)).cloned().collect(),
        ))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{StoreArtifact, StoreKind};
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(id: &str, backup_type: BackupType, offset_minutes: i64) -> BackupMetadata {
        let ts = Utc::now() - Duration::minutes(offset_minutes);
        let mut metadata = BackupMetadata::begin(
            id.to_string(),
            backup_type,
            ts,
            ts + Duration::days(30),
            PathBuf::from(format!("/backups/{id}")),
        );
        metadata.record_artifact(StoreArtifact {
            store: StoreKind::Relational,
            file_name: format!("relational_{id}.dump"),
            size_bytes: 42,
            checksum: "abc".to_string(),
            compressed: true,
            encrypted: false,
            iv: None,
        });
        metadata
    }

    #[tokio::test]
    async fn records_survive_a_fresh_instance() {
        let dir = TempDir::new().unwrap();
        let repo = FileBackupRepository::new(dir.path().join("metadata"));
        repo.load().await.unwrap();

        let mut metadata = record("b-1", BackupType::Full, 10);
        repo.save(&metadata).await.unwrap();
        metadata
            .complete(42, "digest".to_string(), Utc::now())
            .unwrap();
        repo.save(&metadata).await.unwrap();

        let reopened = FileBackupRepository::new(dir.path().join("metadata"));
        assert_eq!(reopened.load().await.unwrap(), 1);
        assert_eq!(reopened.get("b-1").await.unwrap(), Some(metadata));
    }

    #[tokio::test]
    async fn terminal_records_are_immutable() {
        let repo = InMemoryBackupRepository::new();
        let mut metadata = record("b-1", BackupType::Full, 0);
        metadata.complete(1, "x".to_string(), Utc::now()).unwrap();
        repo.save(&metadata).await.unwrap();

        // Saving the identical record again is harmless
        repo.save(&metadata).await.unwrap();

        let mut changed = metadata.clone();
        changed.checksum = "tampered".to_string();
        assert!(matches!(
            repo.save(&changed).await,
            Err(BackupError::Precondition { .. })
        ));
    }

    #[tokio::test]
    async fn list_filters_and_orders_by_timestamp() {
        let dir = TempDir::new().unwrap();
        let repo = FileBackupRepository::new(dir.path());
        repo.load().await.unwrap();

        repo.save(&record("newest", BackupType::Incremental, 1))
            .await
            .unwrap();
        repo.save(&record("oldest", BackupType::Full, 30))
            .await
            .unwrap();
        repo.save(&record("middle", BackupType::Full, 15))
            .await
            .unwrap();

        let ids: Vec<_> = repo
            .list(&BackupFilter::all())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["oldest", "middle", "newest"]);

        let fulls = repo
            .list(&BackupFilter::all().with_type(BackupType::Full))
            .await
            .unwrap();
        assert_eq!(fulls.len(), 2);

        let window = BackupFilter::all()
            .since(Utc::now() - Duration::minutes(20))
            .until(Utc::now() - Duration::minutes(5));
        let in_window = repo.list(&window).await.unwrap();
        assert_eq!(in_window.len(), 1);
        assert_eq!(in_window[0].id, "middle");

        let latest_full = repo
            .latest(&BackupFilter::all().with_type(BackupType::Full))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest_full.id, "middle");

        assert!(repo.delete("middle").await.unwrap());
        assert!(!repo.delete("middle").await.unwrap());
        assert!(!dir.path().join("middle.json").exists());
    }

    #[tokio::test]
    async fn corrupt_files_are_skipped_on_load() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();

        let repo = FileBackupRepository::new(dir.path());
        repo.save(&record("good", BackupType::Full, 0)).await.unwrap();

        let reopened = FileBackupRepository::new(dir.path());
        assert_eq!(reopened.load().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let repo = FileBackupRepository::new(dir.path());
        let metadata = record("../escape", BackupType::Full, 0);
        assert!(repo.save(&metadata).await.is_err());
        assert_eq!(repo.get("../escape").await.unwrap(), None);
    }
}
