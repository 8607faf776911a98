//! Ensemble node server

use crate::common::{NodeConfig, Result};
use crate::ensemble::http::{create_router, AppState};
use crate::zab::health::{spawn_failure_listener, HealthMonitor, FAILURE_CHANNEL_CAPACITY};
use crate::ztree::ZTree;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Aborts the node's background tasks when the server stops
struct TaskGuard(Vec<JoinHandle<()>>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

pub struct Node {
    config: NodeConfig,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Bind the configured address and serve until Ctrl-C
    pub async fn serve(self) -> Result<()> {
        let bind_addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(bind_addr).await?;
        self.serve_with_listener(listener).await
    }

    /// Serve on an already bound listener until Ctrl-C
    pub async fn serve_with_listener(self, listener: TcpListener) -> Result<()> {
        self.serve_until(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve_until<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let db_path = config.db_path();

        tracing::info!("Starting zooweeper node: {}", config.node_address);
        tracing::info!("  HTTP API: {}", listener.local_addr()?);
        tracing::info!("  DB path: {}", db_path.display());
        tracing::info!("  Ensemble: {:?}", config.peers);

        // Initialize the ZTree and register this node
        let store = Arc::new(ZTree::open(&db_path)?);
        let local = store.ensure_local(&config.node_address, "", &config.peers)?;
        tracing::info!("  Last known leader: {:?}", local.leader);

        let state = AppState::new(config.clone(), store.clone())?;

        // Health monitoring feeds the election
        let (failures_tx, failures_rx) = mpsc::channel(FAILURE_CHANNEL_CAPACITY);
        let monitor = HealthMonitor::new(config.clone(), state.peers.clone(), failures_tx);
        monitor.wake_up().await;

        let _tasks = TaskGuard(vec![
            spawn_failure_listener(failures_rx, store.clone(), state.election.clone()),
            tokio::spawn(monitor.run()),
        ]);

        let router = create_router(state);
        tracing::info!("✓ Node {} ready", config.node_address);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("Shutting down, flushing ztree");
        store.flush()?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
