use super::AlertSeverity;
use crate::backup::{BackupError, BackupMetadata, BackupType, CommandRunner, CommandSpec, Result};
use crate::config::MonitoringConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupEventKind {
    BackupSucceeded,
    BackupFailed,
    RestoreSucceeded,
    RestoreFailed,
    IntegrityCheckFailed,
    HealthDegraded,
}

/// One structured notification per operation outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEvent {
    pub event_id: Uuid,
    pub kind: BackupEventKind,
    pub backup_id: Option<String>,
    pub backup_type: Option<BackupType>,
    pub size_bytes: Option<u64>,
    pub error: Option<String>,
    pub severity: AlertSeverity,
    pub occurred_at: DateTime<Utc>,
}

impl BackupEvent {
    fn new(kind: BackupEventKind, severity: AlertSeverity) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            backup_id: None,
            backup_type: None,
            size_bytes: None,
            error: None,
            severity,
            occurred_at: Utc::now(),
        }
    }

    pub fn backup_succeeded(metadata: &BackupMetadata) -> Self {
        Self {
            backup_id: Some(metadata.id.clone()),
            backup_type: Some(metadata.backup_type),
            size_bytes: Some(metadata.size_bytes),
            ..Self::new(BackupEventKind::BackupSucceeded, AlertSeverity::Info)
        }
    }

    pub fn backup_failed(backup_id: &str, backup_type: BackupType, error: &BackupError) -> Self {
        Self {
            backup_id: Some(backup_id.to_string()),
            backup_type: Some(backup_type),
            error: Some(error.to_string()),
            ..Self::new(BackupEventKind::BackupFailed, AlertSeverity::Critical)
        }
    }

    pub fn restore_succeeded(backup_id: &str) -> Self {
        Self {
            backup_id: Some(backup_id.to_string()),
            ..Self::new(BackupEventKind::RestoreSucceeded, AlertSeverity::Info)
        }
    }

    pub fn restore_failed(backup_id: &str, error: &BackupError) -> Self {
        Self {
            backup_id: Some(backup_id.to_string()),
            error: Some(error.to_string()),
            ..Self::new(BackupEventKind::RestoreFailed, AlertSeverity::Critical)
        }
    }

    pub fn integrity_check_failed(backup_id: &str, issues: &[String]) -> Self {
        Self {
            backup_id: Some(backup_id.to_string()),
            error: Some(issues.join("; ")),
            ..Self::new(BackupEventKind::IntegrityCheckFailed, AlertSeverity::Warning)
        }
    }

    pub fn health_degraded(message: String, severity: AlertSeverity) -> Self {
        Self {
            error: Some(message),
            ..Self::new(BackupEventKind::HealthDegraded, severity)
        }
    }

    pub fn summary(&self) -> String {
        let subject = match self.kind {
            BackupEventKind::BackupSucceeded => "Backup succeeded",
            BackupEventKind::BackupFailed => "Backup failed",
            BackupEventKind::RestoreSucceeded => "Restore succeeded",
            BackupEventKind::RestoreFailed => "Restore failed",
            BackupEventKind::IntegrityCheckFailed => "Integrity check failed",
            BackupEventKind::HealthDegraded => "Backup health degraded",
        };
        match &self.backup_id {
            Some(id) => format!("{subject}: {id}"),
            None => subject.to_string(),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    async fn deliver(&self, event: &BackupEvent) -> Result<()>;
}

/// Always-on sink writing events to the tracing log
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &BackupEvent) -> Result<()> {
        let detail = event.error.as_deref().unwrap_or("");
        match event.severity {
            AlertSeverity::Critical => error!("🚨 {} {}", event.summary(), detail),
            AlertSeverity::Warning => warn!("⚠️ {} {}", event.summary(), detail),
            AlertSeverity::Info => info!("✅ {}", event.summary()),
        }
        Ok(())
    }
}

/// JSON POST with bounded retries
#[derive(Debug)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: url::Url,
    max_attempts: u32,
    base_delay: Duration,
}

impl WebhookSink {
    pub fn new(url: &str) -> Result<Self> {
        let url = url::Url::parse(url).map_err(|e| BackupError::Configuration {
            message: format!("Invalid webhook URL: {e}"),
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackupError::Notification {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            url,
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        })
    }

    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_delay = base_delay;
        self
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, event: &BackupEvent) -> Result<()> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            let response = self
                .client
                .post(self.url.clone())
                .json(event)
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match response {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Webhook delivery attempt {}/{} failed: {}",
                        attempt, self.max_attempts, e
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < self.max_attempts {
                let jitter = rand::thread_rng().gen_range(0..100);
                let delay = self.base_delay * 2u32.pow(attempt - 1)
                    + Duration::from_millis(jitter);
                tokio::time::sleep(delay).await;
            }
        }

        Err(BackupError::Notification {
            message: format!(
                "Webhook delivery failed after {} attempts: {}",
                self.max_attempts, last_error
            ),
        })
    }
}

/// Mail through a local `sendmail -t`
#[derive(Debug)]
pub struct EmailSink {
    runner: Arc<dyn CommandRunner>,
    tool: String,
    from: String,
    to: Vec<String>,
}

impl EmailSink {
    pub fn new(runner: Arc<dyn CommandRunner>, tool: String, from: String, to: Vec<String>) -> Self {
        Self {
            runner,
            tool,
            from,
            to,
        }
    }

    fn compose(&self, event: &BackupEvent) -> Result<String> {
        Ok(format!(
            "From: {}\nTo: {}\nSubject: [codex-backup] {}\nContent-Type: application/json\n\n{}\n",
            self.from,
            self.to.join(", "),
            event.summary(),
            serde_json::to_string_pretty(event)?
        ))
    }
}

#[async_trait]
impl NotificationSink for EmailSink {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(&self, event: &BackupEvent) -> Result<()> {
        let message = self.compose(event)?;
        let spec = CommandSpec::new(&self.tool)
            .arg("-t")
            .stdin(message.into_bytes())
            .timeout(Duration::from_secs(30));
        self.runner.run(&spec).await?;
        Ok(())
    }
}

/// Fans events out to every configured sink. Delivery is best-effort and
/// never fails the operation that produced the event.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
    notify_on_success: bool,
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new(vec![Arc::new(LogSink)])
    }
}

impl NotificationDispatcher {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self {
            sinks,
            notify_on_success: true,
        }
    }

    pub fn from_config(config: &MonitoringConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];

        if let Some(url) = &config.webhook_url {
            sinks.push(Arc::new(WebhookSink::new(url)?));
        }
        if !config.email_to.is_empty() {
            sinks.push(Arc::new(EmailSink::new(
                runner,
                config.sendmail_tool.clone(),
                config.email_from.clone(),
                config.email_to.clone(),
            )));
        }

        Ok(Self {
            sinks,
            notify_on_success: config.notify_on_success,
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    fn should_send(&self, event: &BackupEvent) -> bool {
        self.notify_on_success
            || !matches!(
                event.kind,
                BackupEventKind::BackupSucceeded | BackupEventKind::RestoreSucceeded
            )
    }

    /// Fire-and-forget: delivery runs on a spawned task
    pub fn dispatch(&self, event: BackupEvent) {
        if !self.should_send(&event) {
            return;
        }
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.deliver(&event).await;
        });
    }

    /// Deliver to every sink; returns how many sinks failed
    pub async fn deliver(&self, event: &BackupEvent) -> usize {
        let mut failures = 0;
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(event).await {
                warn!("Notification via {} failed: {}", sink.name(), e);
                failures += 1;
            }
        }
        failures
    }
}
