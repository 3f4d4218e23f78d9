use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::events::InProcessEventBus;
use crate::scheduler::ReminderScheduler;

const SCHEDULER_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Graceful shutdown coordinator for the workflow service
pub struct ShutdownCoordinator {
    scheduler: Arc<ReminderScheduler>,
    bus: Option<Arc<InProcessEventBus>>,
}

impl ShutdownCoordinator {
    pub fn new(scheduler: Arc<ReminderScheduler>) -> Self {
        Self {
            scheduler,
            bus: None,
        }
    }

    /// Unsubscribe every bus handler on shutdown.
    pub fn with_event_bus(mut self, bus: Arc<InProcessEventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Wait for Ctrl-C and then shut everything down
    pub async fn wait_for_shutdown(self) -> Result<()> {
        info!("Shutdown coordinator ready - will shutdown gracefully on Ctrl-C");
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await
    }

    /// Wait for `signal` and then shut everything down
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.shutdown_all_services().await
    }

    /// Perform graceful shutdown operations
    pub async fn shutdown_all_services(self) -> Result<()> {
        info!("Initiating graceful shutdown...");

        if let Some(bus) = &self.bus {
            bus.clear();
        }

        timeout(SCHEDULER_STOP_TIMEOUT, self.scheduler.stop())
            .await
            .map_err(|_| anyhow::anyhow!("Timeout waiting for the reminder scheduler to stop"))?;

        info!("Graceful shutdown completed successfully");
        Ok(())
    }
}
