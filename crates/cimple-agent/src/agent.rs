//! Main agent implementation.

use crate::config::AgentConfig;
use crate::connection::{ConnectionState, ServerConnection};
use crate::executor::{BuildExecutor, BuildRequest, GitBuildExecutor};
use cimple_core::ids::AgentId;
use cimple_core::messages::{
    BuildComplete, BuildRefused, Envelope, Message, MessageKind, RegisterAgentMessage,
};
use cimple_core::ports::MessageChannel;
use cimple_core::router::MessageRouter;
use cimple_core::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The connection builds report to, `None` while disconnected.
type CurrentChannel = Option<Arc<dyn MessageChannel>>;

/// The build agent.
///
/// Keeps one connection to the server open, reconnecting with a fixed delay
/// whenever it drops. The agent id is fixed for the life of the process so
/// the server sees a reconnect as the same agent. A build outlives the
/// connection it was requested on and reports completion on whichever
/// connection is open when it finishes.
pub struct BuildAgent {
    config: AgentConfig,
    agent_id: AgentId,
    hostname: String,
    executor: Arc<dyn BuildExecutor>,
    build: Arc<BuildSlot>,
    current: watch::Sender<CurrentChannel>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// The one build an agent may run at a time.
#[derive(Default)]
struct BuildSlot {
    running: Mutex<Option<BuildRequest>>,
}

enum Claim {
    Started,
    /// The same request is already running, typically re-sent after a reconnect.
    AlreadyRunning,
    Busy(BuildRequest),
}

impl BuildSlot {
    fn lock(&self) -> MutexGuard<'_, Option<BuildRequest>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self, request: &BuildRequest) -> Claim {
        let mut running = self.lock();
        match running.as_ref() {
            None => {
                *running = Some(request.clone());
                Claim::Started
            }
            Some(current) if current == request => Claim::AlreadyRunning,
            Some(current) => Claim::Busy(current.clone()),
        }
    }

    fn release(&self) {
        self.lock().take();
    }

    fn is_busy(&self) -> bool {
        self.lock().is_some()
    }
}

impl BuildAgent {
    pub fn new(config: AgentConfig) -> Self {
        let executor = GitBuildExecutor::new(config.workspace_dir.clone(), config.run_context.clone())
            .with_project_file(config.config_file.clone());
        Self::with_executor(config, Arc::new(executor))
    }

    pub fn with_executor(config: AgentConfig, executor: Arc<dyn BuildExecutor>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (current, _) = watch::channel(None);
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            config,
            agent_id: AgentId::from_uuid(Uuid::new_v4()),
            hostname,
            executor,
            build: Arc::new(BuildSlot::default()),
            current,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn id(&self) -> AgentId {
        self.agent_id
    }

    pub fn is_busy(&self) -> bool {
        self.build.is_busy()
    }

    /// Connect and serve until [`BuildAgent::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown_rx.clone();
        info!(agent_id = %self.agent_id, hostname = %self.hostname, "Starting build agent");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.connect_and_serve().await {
                Ok(()) => info!(agent_id = %self.agent_id, "Connection to server closed"),
                Err(e) => warn!(agent_id = %self.agent_id, error = %e, "Connection to server failed"),
            }

            if *shutdown.borrow() {
                break;
            }

            let delay = self.config.reconnect_delay();
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(agent_id = %self.agent_id, "Agent stopped");
        Ok(())
    }

    /// Stop the agent. A running build keeps going in the background.
    pub fn shutdown(&self) {
        info!("Initiating shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    async fn connect_and_serve(&self) -> Result<()> {
        let url = self.config.connection_url(self.agent_id);
        let connection = Arc::new(ServerConnection::connect(&url, &self.config).await?);
        let keepalive = connection.spawn_keepalive(self.config.ping_period());
        let state = connection.subscribe();
        let channel: Arc<dyn MessageChannel> = connection.clone();

        let result = self.serve_connection(Arc::clone(&channel), Some(state)).await;

        keepalive.abort();
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Error closing connection");
        }
        result
    }

    /// Register, then route messages from the server until the channel
    /// closes or the agent shuts down.
    pub async fn serve(&self, channel: Arc<dyn MessageChannel>) -> Result<()> {
        self.serve_connection(channel, None).await
    }

    /// As [`BuildAgent::serve`], also ending with a transport error as soon
    /// as `state` reports the connection closed.
    async fn serve_connection(
        &self,
        channel: Arc<dyn MessageChannel>,
        state: Option<watch::Receiver<ConnectionState>>,
    ) -> Result<()> {
        channel
            .send_message(Envelope::new(RegisterAgentMessage {
                agent_id: self.agent_id,
                hostname: self.hostname.clone(),
            }))
            .await?;
        info!(agent_id = %self.agent_id, "Registration sent");

        self.current.send_replace(Some(Arc::clone(&channel)));
        let result = self.route_messages(Arc::clone(&channel), state).await;
        self.current.send_if_modified(|current| {
            let ours = current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &channel));
            if ours {
                *current = None;
            }
            ours
        });
        result
    }

    async fn route_messages(
        &self,
        channel: Arc<dyn MessageChannel>,
        mut state: Option<watch::Receiver<ConnectionState>>,
    ) -> Result<()> {
        let router = self.router(Arc::clone(&channel));
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                message = channel.read_message() => match message {
                    Ok(envelope) => {
                        if let Err(e) = router.route(envelope).await {
                            warn!(error = %e, "Failed to handle server message");
                        }
                    }
                    Err(Error::ConnectionClosed) => return Ok(()),
                    Err(Error::Decode(e)) => warn!(error = %e, "Discarding undecodable message"),
                    Err(e) => return Err(e),
                },
                _ = connection_lost(&mut state) => {
                    return Err(Error::Transport("Connection to server lost".to_string()));
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn router(&self, channel: Arc<dyn MessageChannel>) -> MessageRouter {
        let mut router = MessageRouter::new();

        router.on(MessageKind::Confirmation, |envelope| async move {
            if let Message::Confirmation(confirmation) = &envelope.body {
                info!(
                    confirmed_id = %confirmation.confirmed_id,
                    text = %confirmation.text,
                    "Server confirmed"
                );
            }
            Ok(())
        });

        let executor = Arc::clone(&self.executor);
        let build = Arc::clone(&self.build);
        let current = self.current.subscribe();
        router.on(MessageKind::BuildGitRepository, move |envelope| {
            let executor = Arc::clone(&executor);
            let build = Arc::clone(&build);
            let current = current.clone();
            let channel = Arc::clone(&channel);
            async move {
                let Message::BuildGitRepository(request) = envelope.body else {
                    return Ok(());
                };
                let request = BuildRequest {
                    url: request.url,
                    commit: request.commit,
                };

                match build.claim(&request) {
                    Claim::Started => start_build(executor, build, current, request),
                    Claim::AlreadyRunning => info!(
                        url = %request.url,
                        commit = %request.commit,
                        "Build already running, completion will follow on this connection"
                    ),
                    Claim::Busy(running) => {
                        warn!(
                            url = %request.url,
                            commit = %request.commit,
                            running = %running.commit,
                            "Already building, refusing request"
                        );
                        channel
                            .send_message(Envelope::new(BuildRefused {
                                reason: format!(
                                    "Already building {}#{}",
                                    running.url, running.commit
                                ),
                            }))
                            .await?;
                    }
                }
                Ok(())
            }
        });

        router.on_error(|envelope| async move {
            warn!(kind = %envelope.kind(), "Unexpected message from server");
            Ok(())
        });

        router
    }
}

/// Resolves once `state` reports the connection closed. Never resolves when
/// there is no state to watch.
async fn connection_lost(state: &mut Option<watch::Receiver<ConnectionState>>) {
    if let Some(state) = state {
        let closed = state
            .wait_for(|s| *s == ConnectionState::Closed)
            .await
            .is_ok();
        if closed {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// Run the build on its own task so the connection keeps being read.
/// `BuildComplete` is sent whatever the outcome.
fn start_build(
    executor: Arc<dyn BuildExecutor>,
    build: Arc<BuildSlot>,
    current: watch::Receiver<CurrentChannel>,
    request: BuildRequest,
) {
    tokio::spawn(async move {
        match executor.execute(request.clone()).await {
            Ok(summary) if summary.succeeded() => {
                info!(
                    url = %request.url,
                    commit = %request.commit,
                    run_id = %summary.run_id,
                    "Build succeeded"
                );
            }
            Ok(summary) => {
                warn!(
                    url = %request.url,
                    commit = %request.commit,
                    run_id = %summary.run_id,
                    error = summary.error.as_deref().unwrap_or_default(),
                    "Build failed"
                );
            }
            Err(e) => error!(
                url = %request.url,
                commit = %request.commit,
                error = %e,
                "Build could not run"
            ),
        }

        build.release();
        report_completion(current).await;
    });
}

/// Send `BuildComplete` on the open connection, waiting for one if the agent
/// is between connections.
async fn report_completion(mut current: watch::Receiver<CurrentChannel>) {
    loop {
        let channel = match current.wait_for(Option::is_some).await {
            Ok(channel) => channel.clone(),
            Err(_) => {
                warn!("Agent stopped before build completion could be reported");
                return;
            }
        };
        let Some(channel) = channel else {
            continue;
        };

        match channel.send_message(Envelope::new(BuildComplete {})).await {
            Ok(()) => return,
            Err(e) => {
                warn!(error = %e, "Failed to report build completion, waiting for a new connection");
                if current.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}
