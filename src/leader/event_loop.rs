//! Serialized queue for cluster-wide maintenance
//!
//! Tasks run one at a time, in submission order, on a single consumer task.
//! Leader-only tasks are checked against leadership when they are dequeued,
//! so anything queued before leadership was lost is dropped without running.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Anything that can answer "is this node the leader right now"
pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Always,
    LeaderOnly,
}

struct QueuedTask {
    name: &'static str,
    kind: TaskKind,
    task: BoxFuture<'static, ()>,
}

#[derive(Debug, Default)]
pub struct EventLoopStats {
    pub executed: AtomicU64,
    pub skipped: AtomicU64,
}

/// Handle for submitting tasks. Cheap to clone; the loop ends once every
/// handle is dropped.
#[derive(Clone)]
pub struct GlobalEventLoop {
    tx: mpsc::UnboundedSender<QueuedTask>,
    stats: Arc<EventLoopStats>,
}

impl GlobalEventLoop {
    pub fn start(leadership: Arc<dyn Leadership>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(EventLoopStats::default());
        let handle = tokio::spawn(consume(rx, leadership, Arc::clone(&stats)));
        (Self { tx, stats }, handle)
    }

    /// Queue a task. Returns false if the loop has stopped.
    pub fn enqueue<F>(&self, name: &'static str, kind: TaskKind, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx
            .send(QueuedTask {
                name,
                kind,
                task: Box::pin(task),
            })
            .is_ok()
    }

    pub fn schedule<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(name, TaskKind::Always, task)
    }

    pub fn schedule_leader_only<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(name, TaskKind::LeaderOnly, task)
    }

    pub fn stats(&self) -> &EventLoopStats {
        &self.stats
    }
}

async fn consume(
    mut rx: mpsc::UnboundedReceiver<QueuedTask>,
    leadership: Arc<dyn Leadership>,
    stats: Arc<EventLoopStats>,
) {
    while let Some(queued) = rx.recv().await {
        if queued.kind == TaskKind::LeaderOnly && !leadership.is_leader() {
            trace!(task = queued.name, "Not leader, skipping task");
            stats.skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        trace!(task = queued.name, "Running task");
        queued.task.await;
        stats.executed.fetch_add(1, Ordering::Relaxed);
    }
    debug!("Global event loop stopped");
}
