use super::BackupType;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How many units of each tier a backup is kept for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub yearly: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 4,
            monthly: 12,
            yearly: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionTier {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RetentionTier {
    pub fn for_backup_type(backup_type: BackupType) -> Self {
        match backup_type {
            BackupType::Full => RetentionTier::Monthly,
            BackupType::Incremental => RetentionTier::Weekly,
            BackupType::Log | BackupType::Differential => RetentionTier::Daily,
        }
    }

    /// Days represented by one unit of the tier
    pub fn unit_days(&self) -> i64 {
        match self {
            RetentionTier::Daily => 1,
            RetentionTier::Weekly => 7,
            RetentionTier::Monthly => 30,
            RetentionTier::Yearly => 365,
        }
    }
}

impl RetentionPolicy {
    pub fn tier_count(&self, tier: RetentionTier) -> u32 {
        match tier {
            RetentionTier::Daily => self.daily,
            RetentionTier::Weekly => self.weekly,
            RetentionTier::Monthly => self.monthly,
            RetentionTier::Yearly => self.yearly,
        }
    }

    pub fn retention_days(&self, backup_type: BackupType) -> i64 {
        let tier = RetentionTier::for_backup_type(backup_type);
        i64::from(self.tier_count(tier)) * tier.unit_days()
    }

    pub fn calculate_retention_date(
        &self,
        backup_type: BackupType,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        now + Duration::days(self.retention_days(backup_type))
    }
}
