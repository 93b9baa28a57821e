//! Server-side proxies for connected agents.

use crate::queue::{BuildJob, BuildSource};
use crate::workpool::{Chore, WorkPool, Worker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cimple_core::ids::AgentId;
use cimple_core::messages::{
    BuildGitRepository, ConfirmationMessage, Envelope, Message, MessageKind,
};
use cimple_core::ports::MessageChannel;
use cimple_core::router::MessageRouter;
use cimple_core::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Proxy for one connected agent. Implements [`Worker`] so the work pool
/// can hand it builds.
pub struct AgentHandle {
    id: AgentId,
    hostname: RwLock<Option<String>>,
    connected_at: DateTime<Utc>,
    busy: AtomicBool,
    closed: AtomicBool,
    disconnected: Notify,
    connection: Arc<dyn MessageChannel>,
    replies_tx: mpsc::UnboundedSender<BuildReply>,
    replies_rx: Mutex<mpsc::UnboundedReceiver<BuildReply>>,
    perform_timeout: Option<Duration>,
}

/// How an agent answered a dispatched build.
#[derive(Debug)]
enum BuildReply {
    Complete,
    Refused(String),
}

/// Point-in-time view of an agent for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub hostname: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub busy: bool,
}

impl AgentHandle {
    pub fn new(id: AgentId, connection: Arc<dyn MessageChannel>) -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        Self {
            id,
            hostname: RwLock::new(None),
            connected_at: Utc::now(),
            busy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            disconnected: Notify::new(),
            connection,
            replies_tx,
            replies_rx: Mutex::new(replies_rx),
            perform_timeout: None,
        }
    }

    /// Give up on a dispatched build after `timeout`.
    pub fn with_perform_timeout(mut self, timeout: Duration) -> Self {
        self.perform_timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id,
            hostname: self.hostname.read().ok().and_then(|h| h.clone()),
            connected_at: self.connected_at,
            busy: self.is_busy(),
        }
    }

    /// Read and route inbound messages until the connection fails.
    ///
    /// A clean close returns `Ok`; any other read error is returned after
    /// the handle has been marked closed.
    pub async fn listen(self: Arc<Self>) -> Result<()> {
        let router = self.router();
        info!(agent_id = %self.id, "Listening to agent");

        let result = loop {
            let envelope = match self.connection.read_message().await {
                Ok(envelope) => envelope,
                Err(Error::ConnectionClosed) => break Ok(()),
                Err(e) => break Err(e),
            };

            debug!(agent_id = %self.id, kind = %envelope.kind(), "Message from agent");
            if let Err(e) = router.route(envelope).await {
                warn!(agent_id = %self.id, error = %e, "Failed to handle agent message");
            }
        };

        self.mark_closed();
        if let Err(e) = self.connection.close().await {
            debug!(agent_id = %self.id, error = %e, "Error closing agent connection");
        }
        info!(agent_id = %self.id, "Agent connection ended");
        result
    }

    fn router(self: &Arc<Self>) -> MessageRouter {
        let mut router = MessageRouter::new();

        let agent = Arc::clone(self);
        router.on(MessageKind::RegisterAgent, move |envelope| {
            let agent = Arc::clone(&agent);
            async move { agent.on_register(envelope).await }
        });

        let agent = Arc::clone(self);
        router.on(MessageKind::BuildComplete, move |_| {
            let agent = Arc::clone(&agent);
            async move {
                agent.on_build_complete();
                Ok(())
            }
        });

        let agent = Arc::clone(self);
        router.on(MessageKind::BuildRefused, move |envelope| {
            let agent = Arc::clone(&agent);
            async move {
                if let Message::BuildRefused(refused) = envelope.body {
                    agent.on_build_refused(refused.reason);
                }
                Ok(())
            }
        });

        let agent_id = self.id;
        router.on_error(move |envelope| async move {
            warn!(agent_id = %agent_id, kind = %envelope.kind(), "Unexpected message from agent");
            Ok(())
        });

        router
    }

    async fn on_register(&self, envelope: Envelope) -> Result<()> {
        let Message::RegisterAgent(register) = &envelope.body else {
            return Ok(());
        };

        if register.agent_id != self.id {
            warn!(
                agent_id = %self.id,
                claimed_id = %register.agent_id,
                "Agent registered with a different id than its connection"
            );
        }
        if let Ok(mut hostname) = self.hostname.write() {
            *hostname = Some(register.hostname.clone());
        }
        info!(agent_id = %self.id, hostname = %register.hostname, "Agent registered");

        self.connection
            .send_message(Envelope::new(ConfirmationMessage {
                confirmed_id: envelope.id,
                text: "Agent registered".to_string(),
            }))
            .await
    }

    fn on_build_complete(&self) {
        info!(agent_id = %self.id, "Agent reported build complete");
        self.busy.store(false, Ordering::SeqCst);
        let _ = self.replies_tx.send(BuildReply::Complete);
    }

    /// The agent is still running an earlier build. It stays busy until
    /// that build reports completion.
    fn on_build_refused(&self, reason: String) {
        warn!(agent_id = %self.id, reason = %reason, "Agent refused build");
        let _ = self.replies_tx.send(BuildReply::Refused(reason));
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.disconnected.notify_waiters();
    }
}

#[async_trait]
impl Worker<BuildJob> for AgentHandle {
    fn id(&self) -> String {
        self.id.to_string()
    }

    fn can_perform(&self, _chore: &Chore<BuildJob>) -> bool {
        !self.is_busy() && !self.is_closed()
    }

    async fn perform(&self, chore: &Chore<BuildJob>) -> Result<()> {
        let disconnected = self.disconnected.notified();
        tokio::pin!(disconnected);
        disconnected.as_mut().enable();

        if self.is_closed() {
            return Err(Error::AgentDisconnected(self.id.to_string()));
        }

        let mut replies = self.replies_rx.lock().await;
        while replies.try_recv().is_ok() {}

        let BuildSource::Git { url, commit } = &chore.job.source;
        self.busy.store(true, Ordering::SeqCst);

        let request = Envelope::new(BuildGitRepository {
            url: url.clone(),
            commit: commit.clone(),
        });
        if let Err(e) = self.connection.send_message(request).await {
            self.busy.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!(
            agent_id = %self.id,
            build_id = %chore.job.id,
            url = %url,
            commit = %commit,
            "Build dispatched to agent"
        );

        let deadline = self.perform_timeout;
        let expired = async move {
            match deadline {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            Some(reply) = replies.recv() => match reply {
                BuildReply::Complete => Ok(()),
                BuildReply::Refused(reason) => Err(Error::BuildRefused {
                    agent: self.id.to_string(),
                    reason,
                }),
            },
            _ = &mut disconnected => Err(Error::AgentDisconnected(self.id.to_string())),
            _ = expired => Err(Error::PerformTimeout {
                seconds: deadline.map(|d| d.as_secs()).unwrap_or_default(),
            }),
        }
    }
}

enum PoolCommand {
    Join(Arc<AgentHandle>),
    Leave(Arc<AgentHandle>),
    List(oneshot::Sender<Vec<AgentSnapshot>>),
}

/// Set of connected agents, owned by a single loop.
///
/// Joining with an id that is already present replaces the previous handle,
/// so a reconnecting agent is indistinguishable from a new one. Leaving only
/// removes the exact handle that joined.
#[derive(Clone)]
pub struct AgentPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
}

impl AgentPool {
    pub fn start(work_pool: WorkPool<BuildJob>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_agent_pool(work_pool, rx));
        Self { commands }
    }

    pub fn join(&self, agent: Arc<AgentHandle>) -> Result<()> {
        self.send(PoolCommand::Join(agent))
    }

    pub fn leave(&self, agent: Arc<AgentHandle>) -> Result<()> {
        self.send(PoolCommand::Leave(agent))
    }

    /// Connected agents, oldest connection first.
    pub async fn list(&self) -> Result<Vec<AgentSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.send(PoolCommand::List(tx))?;
        rx.await
            .map_err(|_| Error::Internal("Agent pool is not running".to_string()))
    }

    /// Join, listen until the connection ends, then leave.
    pub async fn serve(&self, agent: Arc<AgentHandle>) -> Result<()> {
        self.join(Arc::clone(&agent))?;
        let result = Arc::clone(&agent).listen().await;
        self.leave(agent)?;
        result
    }

    fn send(&self, command: PoolCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Internal("Agent pool is not running".to_string()))
    }
}

async fn run_agent_pool(
    work_pool: WorkPool<BuildJob>,
    mut commands: mpsc::UnboundedReceiver<PoolCommand>,
) {
    let mut agents: HashMap<AgentId, Arc<AgentHandle>> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            PoolCommand::Join(agent) => {
                let id = agent.id();
                if agents.insert(id, Arc::clone(&agent)).is_some() {
                    info!(agent_id = %id, "Agent rejoined, replacing previous connection");
                } else {
                    info!(agent_id = %id, agents = agents.len(), "Agent joined");
                }
                if let Err(e) = work_pool.add_worker(agent) {
                    warn!(agent_id = %id, error = %e, "Failed to add agent to work pool");
                }
            }
            PoolCommand::Leave(agent) => {
                let id = agent.id();
                let current = agents.get(&id).is_some_and(|a| Arc::ptr_eq(a, &agent));
                if !current {
                    debug!(agent_id = %id, "Ignoring leave from a replaced connection");
                    continue;
                }
                agents.remove(&id);
                info!(agent_id = %id, agents = agents.len(), "Agent left");
                if let Err(e) = work_pool.remove_worker(&id.to_string()) {
                    warn!(agent_id = %id, error = %e, "Failed to remove agent from work pool");
                }
            }
            PoolCommand::List(reply) => {
                let mut snapshots: Vec<_> = agents.values().map(|a| a.snapshot()).collect();
                snapshots.sort_by_key(|s| s.connected_at);
                let _ = reply.send(snapshots);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{BuildQueue, WorkPoolBuildQueue};
    use crate::workpool::{ChoreOutcome, WorkPoolConfig};
    use cimple_core::messages::{BuildComplete, BuildRefused, RegisterAgentMessage};
    use tokio::time::{sleep, timeout};

    /// In-memory channel standing in for a websocket connection.
    struct MemoryChannel {
        inbound: Mutex<mpsc::UnboundedReceiver<Envelope>>,
        outbound: mpsc::UnboundedSender<Envelope>,
    }

    struct RemoteAgent {
        to_server: mpsc::UnboundedSender<Envelope>,
        from_server: mpsc::UnboundedReceiver<Envelope>,
    }

    fn connection() -> (Arc<MemoryChannel>, RemoteAgent) {
        let (to_server, inbound) = mpsc::unbounded_channel();
        let (outbound, from_server) = mpsc::unbounded_channel();
        (
            Arc::new(MemoryChannel {
                inbound: Mutex::new(inbound),
                outbound,
            }),
            RemoteAgent {
                to_server,
                from_server,
            },
        )
    }

    #[async_trait]
    impl MessageChannel for MemoryChannel {
        async fn send_message(&self, envelope: Envelope) -> Result<()> {
            self.outbound
                .send(envelope)
                .map_err(|_| Error::Transport("peer gone".into()))
        }

        async fn read_message(&self) -> Result<Envelope> {
            self.inbound
                .lock()
                .await
                .recv()
                .await
                .ok_or(Error::ConnectionClosed)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    impl RemoteAgent {
        async fn next(&mut self) -> Envelope {
            timeout(Duration::from_secs(2), self.from_server.recv())
                .await
                .unwrap()
                .unwrap()
        }

        fn send(&self, body: impl Into<Message>) -> Envelope {
            let envelope = Envelope::new(body);
            self.to_server.send(envelope.clone()).unwrap();
            envelope
        }
    }

    fn chore(job: BuildJob) -> Chore<BuildJob> {
        Chore {
            id: Default::default(),
            job,
            queued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_registration_is_confirmed_with_message_id() {
        let (channel, mut remote) = connection();
        let id = AgentId::new();
        let agent = Arc::new(AgentHandle::new(id, channel));
        tokio::spawn(Arc::clone(&agent).listen());

        let register = remote.send(RegisterAgentMessage {
            agent_id: id,
            hostname: "builder-1".into(),
        });
        let reply = remote.next().await;

        match reply.body {
            Message::Confirmation(c) => assert_eq!(c.confirmed_id, register.id),
            other => panic!("expected confirmation, got {:?}", other),
        }
        assert_eq!(agent.snapshot().hostname.as_deref(), Some("builder-1"));
    }

    #[tokio::test]
    async fn test_perform_blocks_until_build_complete() {
        let (channel, mut remote) = connection();
        let agent = Arc::new(AgentHandle::new(AgentId::new(), channel));
        tokio::spawn(Arc::clone(&agent).listen());

        let job = BuildJob::git("https://x", "abc");
        let performing = {
            let agent = Arc::clone(&agent);
            let chore = chore(job);
            tokio::spawn(async move { agent.perform(&chore).await })
        };

        let request = remote.next().await;
        assert_eq!(
            request.body,
            Message::BuildGitRepository(BuildGitRepository {
                url: "https://x".into(),
                commit: "abc".into(),
            })
        );
        assert!(agent.is_busy());
        assert!(!agent.can_perform(&chore(BuildJob::git("https://y", "def"))));

        remote.send(BuildComplete {});
        timeout(Duration::from_secs(2), performing)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!agent.is_busy());
    }

    #[tokio::test]
    async fn test_disconnect_mid_build_releases_perform() {
        let (channel, mut remote) = connection();
        let agent = Arc::new(AgentHandle::new(AgentId::new(), channel));
        tokio::spawn(Arc::clone(&agent).listen());

        let performing = {
            let agent = Arc::clone(&agent);
            let chore = chore(BuildJob::git("https://x", "abc"));
            tokio::spawn(async move { agent.perform(&chore).await })
        };
        remote.next().await;
        drop(remote);

        let err = timeout(Duration::from_secs(2), performing)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::AgentDisconnected(_)));
        assert!(err.is_retryable());
        assert!(agent.is_closed());
    }

    #[tokio::test]
    async fn test_perform_deadline() {
        let (channel, mut remote) = connection();
        let agent = Arc::new(
            AgentHandle::new(AgentId::new(), channel)
                .with_perform_timeout(Duration::from_millis(30)),
        );
        tokio::spawn(Arc::clone(&agent).listen());

        let err = agent
            .perform(&chore(BuildJob::git("https://x", "abc")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PerformTimeout { .. }));
        assert!(!err.is_retryable());

        // Still busy until the agent itself reports completion.
        remote.next().await;
        assert!(agent.is_busy());
        remote.send(BuildComplete {});
        sleep(Duration::from_millis(30)).await;
        assert!(!agent.is_busy());
    }

    #[tokio::test]
    async fn test_refused_build_is_retryable_and_agent_stays_busy() {
        let (channel, mut remote) = connection();
        let agent = Arc::new(AgentHandle::new(AgentId::new(), channel));
        tokio::spawn(Arc::clone(&agent).listen());

        let performing = {
            let agent = Arc::clone(&agent);
            let chore = chore(BuildJob::git("https://x", "new"));
            tokio::spawn(async move { agent.perform(&chore).await })
        };
        remote.next().await;
        remote.send(BuildRefused {
            reason: "already building https://x#old".into(),
        });

        let err = timeout(Duration::from_secs(2), performing)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(&err, Error::BuildRefused { reason, .. } if reason.contains("old")));
        assert!(err.is_retryable());
        assert!(agent.is_busy());

        // The earlier build finishing frees the agent for the next dispatch.
        remote.send(BuildComplete {});
        sleep(Duration::from_millis(30)).await;
        assert!(!agent.is_busy());

        let performing = {
            let agent = Arc::clone(&agent);
            let chore = chore(BuildJob::git("https://x", "new"));
            tokio::spawn(async move { agent.perform(&chore).await })
        };
        remote.next().await;
        remote.send(BuildComplete {});
        timeout(Duration::from_secs(2), performing)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_build_flows_from_queue_to_agent() {
        let work_pool = WorkPool::start(
            WorkPoolConfig::default().with_check_interval(Duration::from_millis(5)),
        );
        let agents = AgentPool::start(work_pool.clone());
        let queue = WorkPoolBuildQueue::new(work_pool.clone());

        let (channel, mut remote) = connection();
        let agent = Arc::new(AgentHandle::new(AgentId::new(), channel));
        let serving = {
            let agents = agents.clone();
            let agent = Arc::clone(&agent);
            tokio::spawn(async move { agents.serve(agent).await })
        };

        let mut handle = work_pool
            .queue_chore(BuildJob::git("https://repo", "master"))
            .unwrap();
        assert!(matches!(remote.next().await.body, Message::BuildGitRepository(_)));
        assert!(agents.list().await.unwrap()[0].busy);

        remote.send(BuildComplete {});
        let outcome = timeout(Duration::from_secs(2), handle.wait()).await.unwrap();
        assert_eq!(outcome, ChoreOutcome::Completed);
        assert!(queue.queued().await.unwrap().is_empty());

        drop(remote);
        timeout(Duration::from_secs(2), serving).await.unwrap().unwrap().unwrap();
        assert!(agents.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_handle() {
        let agents = AgentPool::start(WorkPool::start(WorkPoolConfig::default()));
        let id = AgentId::new();
        let (first_channel, _first_remote) = connection();
        let (second_channel, _second_remote) = connection();
        let first = Arc::new(AgentHandle::new(id, first_channel));
        let second = Arc::new(AgentHandle::new(id, second_channel));

        agents.join(Arc::clone(&first)).unwrap();
        agents.join(Arc::clone(&second)).unwrap();
        agents.leave(first).unwrap();

        let listed = agents.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].connected_at, second.snapshot().connected_at);

        agents.leave(second).unwrap();
        assert!(agents.list().await.unwrap().is_empty());
    }
}
