pub mod application;
pub mod backup;
pub mod config;
pub mod monitoring;

pub use config::{BackupConfig, Secret};

// Re-export monitoring types
pub use monitoring::{
    BackupEvent, BackupEventKind, BackupMetrics, HealthMonitor, HealthStatus,
    NotificationDispatcher, NotificationSink, SystemHealth,
};

// Re-export backup types
pub use backup::{
    BackupError, BackupManager, BackupMetadata, BackupScheduler, BackupStatistics, BackupStatus,
    BackupType, RecoveryPoint, StoreKind, VerificationResult,
};
