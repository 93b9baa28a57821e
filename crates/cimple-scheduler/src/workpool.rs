//! Work pool: matches queued chores to idle workers.
//!
//! A single loop owns the worker list, the pending queue and the set of
//! workers currently performing a chore. Every mutation reaches the loop
//! as a [`Command`] over a channel, so none of that state is shared.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cimple_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

/// Sequence number assigned when a chore is queued.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChoreId(u64);

impl ChoreId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chore-{}", self.0)
    }
}

/// A unit of schedulable work.
#[derive(Debug, Clone)]
pub struct Chore<J> {
    pub id: ChoreId,
    pub job: J,
    pub queued_at: DateTime<Utc>,
}

/// Final state of a chore, delivered through its [`ChoreHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChoreOutcome {
    Completed,
    Failed(String),
}

/// Something that can perform chores, one at a time.
#[async_trait]
pub trait Worker<J>: Send + Sync {
    /// Stable identity. Adding a worker with a known id replaces the old one.
    fn id(&self) -> String;

    /// Capability check done by the pool before dispatching.
    fn can_perform(&self, chore: &Chore<J>) -> bool;

    /// Perform the chore. Retryable errors put the chore back in the queue;
    /// any other error fails it without another attempt.
    async fn perform(&self, chore: &Chore<J>) -> Result<()>;
}

/// Work pool timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPoolConfig {
    /// Interval between dispatch attempts.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Interval between occupancy log lines.
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

fn default_check_interval_ms() -> u64 {
    1000
}

fn default_stats_interval_ms() -> u64 {
    10_000
}

impl Default for WorkPoolConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

impl WorkPoolConfig {
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval_ms = interval.as_millis() as u64;
        self
    }

    fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(1))
    }
}

/// Occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
}

/// Caller's side of a queued chore.
pub struct ChoreHandle {
    id: ChoreId,
    done: oneshot::Receiver<ChoreOutcome>,
    outcome: Option<ChoreOutcome>,
}

impl ChoreHandle {
    pub fn id(&self) -> ChoreId {
        self.id
    }

    /// Outcome if the chore has finished, without waiting.
    pub fn outcome(&mut self) -> Option<&ChoreOutcome> {
        if self.outcome.is_none() {
            match self.done.try_recv() {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.outcome = Some(pool_stopped());
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
        }
        self.outcome.as_ref()
    }

    pub fn is_done(&mut self) -> bool {
        self.outcome().is_some()
    }

    /// Wait for the chore to finish. Safe to cancel and call again.
    pub async fn wait(&mut self) -> ChoreOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = (&mut self.done).await.unwrap_or_else(|_| pool_stopped());
        self.outcome = Some(outcome.clone());
        outcome
    }
}

fn pool_stopped() -> ChoreOutcome {
    ChoreOutcome::Failed("Work pool stopped".to_string())
}

struct PendingChore<J> {
    chore: Chore<J>,
    done: oneshot::Sender<ChoreOutcome>,
}

enum Command<J> {
    AddWorker(Arc<dyn Worker<J>>),
    RemoveWorker(String),
    Queue(PendingChore<J>),
    QueuedChores(oneshot::Sender<Vec<Chore<J>>>),
    Stats(oneshot::Sender<PoolStats>),
    Shutdown,
}

struct Finished<J> {
    worker_id: String,
    pending: PendingChore<J>,
    result: Result<()>,
}

/// Handle to a running work pool. Cloning is cheap; the loop stops when
/// every handle is dropped or [`WorkPool::shutdown`] is called.
pub struct WorkPool<J> {
    commands: mpsc::UnboundedSender<Command<J>>,
    next_id: Arc<AtomicU64>,
}

impl<J> Clone for WorkPool<J> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

impl<J> WorkPool<J>
where
    J: Clone + Send + Sync + 'static,
{
    /// Spawn the pool loop on the current runtime.
    pub fn start(config: WorkPoolConfig) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(PoolLoop::new(config, rx).run());

        Self {
            commands,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn add_worker(&self, worker: Arc<dyn Worker<J>>) -> Result<()> {
        self.send(Command::AddWorker(worker))
    }

    pub fn remove_worker(&self, worker_id: &str) -> Result<()> {
        self.send(Command::RemoveWorker(worker_id.to_string()))
    }

    /// Enqueue a job and return immediately.
    pub fn queue_chore(&self, job: J) -> Result<ChoreHandle> {
        let id = ChoreId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (done_tx, done_rx) = oneshot::channel();

        self.send(Command::Queue(PendingChore {
            chore: Chore {
                id,
                job,
                queued_at: Utc::now(),
            },
            done: done_tx,
        }))?;

        Ok(ChoreHandle {
            id,
            done: done_rx,
            outcome: None,
        })
    }

    /// Chores waiting for a worker, in queue order.
    pub async fn queued_chores(&self) -> Result<Vec<Chore<J>>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::QueuedChores(tx))?;
        rx.await.map_err(|_| not_running())
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx))?;
        rx.await.map_err(|_| not_running())
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command<J>) -> Result<()> {
        self.commands.send(command).map_err(|_| not_running())
    }
}

fn not_running() -> Error {
    Error::Internal("Work pool is not running".to_string())
}

struct PoolLoop<J> {
    config: WorkPoolConfig,
    commands: mpsc::UnboundedReceiver<Command<J>>,
    finished_tx: mpsc::UnboundedSender<Finished<J>>,
    finished_rx: mpsc::UnboundedReceiver<Finished<J>>,
    workers: Vec<Arc<dyn Worker<J>>>,
    queue: Vec<PendingChore<J>>,
    assigned: HashSet<String>,
}

impl<J> PoolLoop<J>
where
    J: Clone + Send + Sync + 'static,
{
    fn new(config: WorkPoolConfig, commands: mpsc::UnboundedReceiver<Command<J>>) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            config,
            commands,
            finished_tx,
            finished_rx,
            workers: Vec::new(),
            queue: Vec::new(),
            assigned: HashSet::new(),
        }
    }

    async fn run(mut self) {
        let mut check = interval(self.config.check_interval());
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = interval(self.config.stats_interval());
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            check_interval_ms = self.config.check_interval_ms,
            "Work pool started"
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(finished) = self.finished_rx.recv() => {
                    self.handle_finished(finished);
                }
                _ = check.tick() => {
                    self.dispatch_next();
                }
                _ = stats.tick() => {
                    let stats = self.stats();
                    info!(
                        busy = stats.busy,
                        workers = stats.workers,
                        queued = stats.queued,
                        "Work pool occupancy"
                    );
                }
            }
        }

        info!(queued = self.queue.len(), "Work pool stopped");
    }

    fn handle_command(&mut self, command: Command<J>) {
        match command {
            Command::AddWorker(worker) => {
                let id = worker.id();
                match self.workers.iter().position(|w| w.id() == id) {
                    Some(index) => {
                        debug!(worker_id = %id, "Replacing worker");
                        self.workers[index] = worker;
                    }
                    None => {
                        debug!(worker_id = %id, "Adding worker");
                        self.workers.push(worker);
                    }
                }
            }
            Command::RemoveWorker(id) => {
                self.workers.retain(|w| w.id() != id);
                debug!(worker_id = %id, workers = self.workers.len(), "Removed worker");
            }
            Command::Queue(pending) => {
                debug!(chore_id = %pending.chore.id, "Chore queued");
                self.queue.push(pending);
            }
            Command::QueuedChores(reply) => {
                let chores = self.queue.iter().map(|p| p.chore.clone()).collect();
                let _ = reply.send(chores);
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown => {}
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.len(),
            busy: self.assigned.len(),
            queued: self.queue.len(),
        }
    }

    /// Dispatch at most one chore, most recently queued first.
    fn dispatch_next(&mut self) {
        if self.queue.is_empty() || self.assigned.len() >= self.workers.len() {
            return;
        }
        let Some(pending) = self.queue.pop() else {
            return;
        };

        let Some(worker) = self.select_worker(&pending.chore) else {
            let err = Error::NoWorkerAvailable(pending.chore.id.value());
            debug!(error = %err, "Requeueing chore");
            self.queue.push(pending);
            return;
        };

        let worker_id = worker.id();
        self.assigned.insert(worker_id.clone());
        info!(chore_id = %pending.chore.id, worker_id = %worker_id, "Dispatching chore");

        let finished_tx = self.finished_tx.clone();
        tokio::spawn(async move {
            let result = worker.perform(&pending.chore).await;
            let _ = finished_tx.send(Finished {
                worker_id,
                pending,
                result,
            });
        });
    }

    /// First worker in registration order that is not already assigned and
    /// accepts the chore.
    fn select_worker(&self, chore: &Chore<J>) -> Option<Arc<dyn Worker<J>>> {
        self.workers
            .iter()
            .find(|w| !self.assigned.contains(&w.id()) && w.can_perform(chore))
            .cloned()
    }

    fn handle_finished(&mut self, finished: Finished<J>) {
        let Finished {
            worker_id,
            pending,
            result,
        } = finished;
        self.assigned.remove(&worker_id);

        match result {
            Ok(()) => {
                info!(chore_id = %pending.chore.id, worker_id = %worker_id, "Chore completed");
                let _ = pending.done.send(ChoreOutcome::Completed);
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    chore_id = %pending.chore.id,
                    worker_id = %worker_id,
                    error = %e,
                    "Chore was not performed, requeueing"
                );
                self.queue.push(pending);
            }
            Err(e) => {
                error!(
                    chore_id = %pending.chore.id,
                    worker_id = %worker_id,
                    error = %e,
                    "Chore failed"
                );
                let _ = pending.done.send(ChoreOutcome::Failed(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::time::{sleep, timeout};

    struct TestWorker {
        id: String,
        accepts: bool,
        delay: Duration,
        busy: AtomicBool,
        overlaps: AtomicUsize,
        performed: Mutex<Vec<u32>>,
        failures: Mutex<Vec<Error>>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl TestWorker {
        fn new(id: &str) -> Self {
            Self {
                id: id.to_string(),
                accepts: true,
                delay: Duration::from_millis(5),
                busy: AtomicBool::new(false),
                overlaps: AtomicUsize::new(0),
                performed: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn sharing_counters(id: &str, active: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> Self {
            let mut worker = Self::new(id);
            worker.active = Arc::clone(active);
            worker.peak = Arc::clone(peak);
            worker
        }

        fn refusing(id: &str) -> Self {
            let mut worker = Self::new(id);
            worker.accepts = false;
            worker
        }

        fn failing_with(id: &str, failures: Vec<Error>) -> Self {
            let worker = Self::new(id);
            *worker.failures.lock().unwrap() = failures;
            worker
        }

        fn performed(&self) -> Vec<u32> {
            self.performed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Worker<u32> for TestWorker {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn can_perform(&self, _chore: &Chore<u32>) -> bool {
            self.accepts && !self.busy.load(Ordering::SeqCst)
        }

        async fn perform(&self, chore: &Chore<u32>) -> Result<()> {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_active, Ordering::SeqCst);

            sleep(self.delay).await;
            self.performed.lock().unwrap().push(chore.job);

            self.active.fetch_sub(1, Ordering::SeqCst);
            self.busy.store(false, Ordering::SeqCst);

            match self.failures.lock().unwrap().pop() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn fast_config() -> WorkPoolConfig {
        WorkPoolConfig::default()
            .with_check_interval(Duration::from_millis(2))
            .with_stats_interval(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_all_chores_drain_without_double_booking() {
        let pool = WorkPool::start(fast_config());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let first = Arc::new(TestWorker::sharing_counters("w1", &active, &peak));
        let second = Arc::new(TestWorker::sharing_counters("w2", &active, &peak));
        pool.add_worker(first.clone()).unwrap();
        pool.add_worker(second.clone()).unwrap();

        let mut handles: Vec<_> = (0..7).map(|n| pool.queue_chore(n).unwrap()).collect();
        for handle in &mut handles {
            let outcome = timeout(Duration::from_secs(5), handle.wait()).await.unwrap();
            assert_eq!(outcome, ChoreOutcome::Completed);
        }

        assert_eq!(first.performed().len() + second.performed().len(), 7);
        assert_eq!(first.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(second.overlaps.load(Ordering::SeqCst), 0);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.stats().await.unwrap().busy, 0);
    }

    #[tokio::test]
    async fn test_chore_waits_until_a_worker_joins() {
        let pool = WorkPool::start(fast_config());
        let mut handle = pool.queue_chore(1).unwrap();

        assert!(timeout(Duration::from_millis(50), handle.wait()).await.is_err());
        assert!(!handle.is_done());
        assert_eq!(pool.queued_chores().await.unwrap().len(), 1);

        pool.add_worker(Arc::new(TestWorker::new("late"))).unwrap();

        let outcome = timeout(Duration::from_secs(2), handle.wait()).await.unwrap();
        assert_eq!(outcome, ChoreOutcome::Completed);
    }

    #[tokio::test]
    async fn test_most_recently_queued_chore_runs_first() {
        let pool = WorkPool::start(fast_config());
        let mut handles: Vec<_> = [1, 2, 3].into_iter().map(|n| pool.queue_chore(n).unwrap()).collect();
        assert_eq!(pool.queued_chores().await.unwrap().len(), 3);

        let worker = Arc::new(TestWorker::new("only"));
        pool.add_worker(worker.clone()).unwrap();
        for handle in &mut handles {
            timeout(Duration::from_secs(2), handle.wait()).await.unwrap();
        }

        assert_eq!(worker.performed(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_unservable_chore_requeues_forever() {
        // No dead-lettering: a chore nobody accepts stays queued.
        let pool = WorkPool::start(fast_config());
        let picky = Arc::new(TestWorker::refusing("picky"));
        pool.add_worker(picky.clone()).unwrap();

        let mut handle = pool.queue_chore(9).unwrap();
        sleep(Duration::from_millis(60)).await;

        assert!(!handle.is_done());
        assert!(picky.performed().is_empty());
        let queued = pool.queued_chores().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, handle.id());
    }

    #[tokio::test]
    async fn test_application_failure_is_not_retried() {
        let pool = WorkPool::start(fast_config());
        let worker = Arc::new(TestWorker::failing_with(
            "w",
            vec![Error::PerformTimeout { seconds: 1 }],
        ));
        pool.add_worker(worker.clone()).unwrap();

        let mut handle = pool.queue_chore(5).unwrap();
        let outcome = timeout(Duration::from_secs(2), handle.wait()).await.unwrap();
        sleep(Duration::from_millis(20)).await;

        assert!(matches!(outcome, ChoreOutcome::Failed(_)));
        assert_eq!(worker.performed(), vec![5]);
    }

    #[tokio::test]
    async fn test_transport_failure_is_requeued() {
        let pool = WorkPool::start(fast_config());
        let worker = Arc::new(TestWorker::failing_with(
            "w",
            vec![Error::AgentDisconnected("w".into())],
        ));
        pool.add_worker(worker.clone()).unwrap();

        let mut handle = pool.queue_chore(8).unwrap();
        let outcome = timeout(Duration::from_secs(2), handle.wait()).await.unwrap();

        assert_eq!(outcome, ChoreOutcome::Completed);
        assert_eq!(worker.performed(), vec![8, 8]);
    }

    #[tokio::test]
    async fn test_removed_worker_gets_no_chores() {
        let pool = WorkPool::start(fast_config());
        let worker = Arc::new(TestWorker::new("gone"));
        pool.add_worker(worker.clone()).unwrap();
        pool.remove_worker("gone").unwrap();

        let mut handle = pool.queue_chore(1).unwrap();
        sleep(Duration::from_millis(40)).await;

        assert!(!handle.is_done());
        assert!(worker.performed().is_empty());
        assert_eq!(pool.stats().await.unwrap().workers, 0);
    }

    #[tokio::test]
    async fn test_re_adding_worker_replaces_it() {
        let pool: WorkPool<u32> = WorkPool::start(fast_config());
        pool.add_worker(Arc::new(TestWorker::new("same"))).unwrap();
        pool.add_worker(Arc::new(TestWorker::new("same"))).unwrap();

        assert_eq!(pool.stats().await.unwrap().workers, 1);
    }

    #[tokio::test]
    async fn test_handles_report_stopped_pool() {
        let pool = WorkPool::start(fast_config());
        let mut handle = pool.queue_chore(1u32).unwrap();
        pool.shutdown();

        let outcome = timeout(Duration::from_secs(1), handle.wait()).await.unwrap();
        assert!(matches!(outcome, ChoreOutcome::Failed(msg) if msg.contains("stopped")));
    }

    #[test]
    fn test_chore_ids_are_sequential() {
        tokio_test::block_on(async {
            let pool = WorkPool::start(fast_config());
            let a = pool.queue_chore(1u32).unwrap();
            let b = pool.queue_chore(2u32).unwrap();
            assert_eq!(a.id().value() + 1, b.id().value());
            assert_eq!(b.id().to_string(), format!("chore-{}", b.id().value()));
        });
    }
}
