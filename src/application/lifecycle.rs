use crate::application::DependencyContainer;
use crate::backup::BackupScheduler;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Manages application lifecycle events and graceful shutdown
pub struct ApplicationLifecycle {
    container: Arc<DependencyContainer>,
    scheduler: Arc<BackupScheduler>,
    shutdown_tx: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ApplicationLifecycle {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        let scheduler = Arc::new(BackupScheduler::new(container.backup_manager.clone()));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            container,
            scheduler,
            shutdown_tx,
            health_task: Mutex::new(None),
        }
    }

    pub fn scheduler(&self) -> Arc<BackupScheduler> {
        self.scheduler.clone()
    }

    /// Initialize the application
    pub async fn initialize(&self) -> Result<()> {
        info!("🚀 Initializing application...");

        self.container.backup_manager.initialize().await?;

        info!("✅ Application initialized successfully");
        Ok(())
    }

    /// Start the cron jobs and the periodic health monitor
    pub async fn start_background_services(&self) -> Result<()> {
        self.scheduler.start().await?;

        let interval = Duration::from_secs(self.container.config.monitoring.health_check_interval_secs);
        let handle = self
            .container
            .health_monitor
            .clone()
            .spawn(interval, self.shutdown_tx.subscribe());
        *self.health_task.lock().await = Some(handle);

        info!("⏰ Background services started");
        Ok(())
    }

    /// Graceful shutdown
    pub async fn shutdown(&self) -> Result<()> {
        info!("🛑 Initiating graceful shutdown...");

        if let Err(e) = self.scheduler.shutdown().await {
            error!("Error stopping backup scheduler: {}", e);
        }

        // Receivers may already be gone; nothing to signal then
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.health_task.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Health monitor task ended abnormally: {}", e);
            }
        }

        info!("🎉 Graceful shutdown completed");
        Ok(())
    }

    /// Wait for shutdown signals
    pub async fn wait_for_shutdown(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install terminate signal handler: {}", e);
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received");
    }
}
