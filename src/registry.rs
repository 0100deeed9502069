//! Process-lifetime registry.
//!
//! Owns the per-cluster lock table and the group view monitor. Whatever
//! builds the controller creates one [`Registry`], hands it to the
//! controller, then starts it with the controller as view change handler.

use crate::config::OperatorConfig;
use crate::db::AdminConnector;
use crate::lock::LockTable;
use crate::monitor::{GroupMonitor, ViewChangeHandler};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Registry {
    locks: Arc<LockTable>,
    monitor: Arc<GroupMonitor>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    pub fn new(connector: Arc<dyn AdminConnector>, config: &OperatorConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            locks: Arc::new(LockTable::new()),
            monitor: Arc::new(GroupMonitor::new(connector, config.monitor.clone())),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn monitor(&self) -> &Arc<GroupMonitor> {
        &self.monitor
    }

    /// Spawn the monitor loop. Calling it again while running is a no-op.
    pub fn start(&self, handler: Arc<dyn ViewChangeHandler>) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let monitor = Arc::clone(&self.monitor);
        let shutdown = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(monitor.run(handler, shutdown)));
        info!("Registry started");
    }

    /// Stop the monitor loop and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Monitor task ended abnormally");
            }
        }
        info!("Registry stopped");
    }
}
