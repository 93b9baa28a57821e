//! Server wiring: work pool, agent pool and HTTP listener.

use cimple_core::{Error, Result};
use cimple_scheduler::{AgentPool, BuildJob, WorkPool, WorkPoolBuildQueue};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::routes::build_app;
use crate::state::AppState;

/// A running scheduler plus the HTTP surface in front of it.
pub struct Server {
    config: ServerConfig,
    state: Arc<AppState>,
    work_pool: WorkPool<BuildJob>,
}

impl Server {
    /// Start the work pool and agent pool. Must be called inside a runtime.
    pub fn new(config: ServerConfig) -> Self {
        let work_pool = WorkPool::start(config.work_pool_config());
        let agents = AgentPool::start(work_pool.clone());
        let build_queue = Arc::new(WorkPoolBuildQueue::new(work_pool.clone()));

        let state = AppState::new(build_queue, agents).with_perform_timeout(config.perform_timeout());

        Self {
            config,
            state: Arc::new(state),
            work_pool,
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let listener = TcpListener::bind(self.config.socket_addr()).await?;
        self.serve_with_listener(listener, shutdown).await
    }

    pub async fn serve_with_listener(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Cimple server listening");

        let app = build_app(Arc::clone(&self.state));
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Internal(format!("Server error: {}", e)));

        info!("Cimple server shutting down");
        self.work_pool.shutdown();
        result
    }
}
