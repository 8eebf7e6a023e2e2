use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

pub mod command_handlers;
pub mod dependency_container;
pub mod lifecycle;

pub use command_handlers::{
    write_sample_config, BackupCommandHandler, HealthCommandHandler, ServiceCommandHandler,
};
pub use dependency_container::DependencyContainer;
pub use lifecycle::ApplicationLifecycle;

/// Application layer - coordinates backup operations without containing backup logic
pub struct Application {
    pub container: Arc<DependencyContainer>,
    pub lifecycle: Arc<ApplicationLifecycle>,
}

impl Application {
    pub async fn new(config_path: Option<&Path>) -> Result<Self> {
        let container = Arc::new(DependencyContainer::new(config_path).await?);
        Ok(Self::from_container(container))
    }

    pub fn from_container(container: Arc<DependencyContainer>) -> Self {
        let lifecycle = Arc::new(ApplicationLifecycle::new(container.clone()));
        Self {
            container,
            lifecycle,
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.lifecycle.initialize().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.lifecycle.shutdown().await
    }
}
