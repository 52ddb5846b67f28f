//! Named task pools, the debounce scheduler, and the global compilation
//! permit semaphore.
//!
//! All asynchronous work in the server runs through one of three pools:
//!
//! - **import**: classpath resolution and sibling backfill (blocking
//!   build-tool I/O runs under `spawn_blocking` inside these tasks),
//! - **background**: staged Phase B and deferred compiles,
//! - **scheduler**: debounced one-shots; a new schedule for the same key
//!   aborts the pending one (last-writer-wins).
//!
//! Pools bound concurrency with a semaphore rather than dedicated threads;
//! the tokio runtime supplies the threads. Every task is wrapped in a tracing
//! span carrying its project root, and every task races a shutdown broadcast
//! so the server can exit without waiting for stragglers. Task errors are
//! logged at the pool boundary and never propagate.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, info_span, warn};

const IMPORT_POOL_MIN: usize = 2;
const IMPORT_POOL_MAX: usize = 8;
const COMPILE_PERMIT_MAX: usize = 4;

/// A named, semaphore-bounded task spawner.
#[derive(Clone)]
pub struct Pool {
    name: &'static str,
    slots: Arc<Semaphore>,
    shutdown: broadcast::Sender<()>,
}

impl Pool {
    fn new(name: &'static str, size: usize, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            name,
            slots: Arc::new(Semaphore::new(size)),
            shutdown,
        }
    }

    /// Submits a task. The task waits for a pool slot, runs inside a span
    /// naming the pool and project, and is dropped if the server shuts down
    /// first. Errors are logged, not propagated.
    pub fn spawn<F>(&self, project_root: &Path, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let span = info_span!("task", pool = self.name, project = %project_root.display());
        let slots = Arc::clone(&self.slots);
        let mut shutdown_rx = self.shutdown.subscribe();
        let name = self.name;

        tokio::spawn(
            async move {
                let _slot = match slots.acquire_owned().await {
                    Ok(slot) => slot,
                    // Semaphore closed: the server is shutting down.
                    Err(_) => return,
                };
                tokio::select! {
                    result = task => {
                        if let Err(e) = result {
                            warn!("{} task failed: {:#}", name, e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("{} task cancelled by shutdown", name);
                    }
                }
            }
            .instrument(span),
        );
    }

    fn close(&self) {
        self.slots.close();
    }
}

/// Key identifying a debounced action; a new schedule with the same key
/// cancels the pending one.
pub type DebounceKey = String;

/// One-shot scheduler with cancel-and-replace semantics.
pub struct Scheduler {
    pending: DashMap<DebounceKey, (u64, AbortHandle)>,
    generation: AtomicU64,
    shutdown: broadcast::Sender<()>,
}

impl Scheduler {
    fn new(shutdown: broadcast::Sender<()>) -> Self {
        Self {
            pending: DashMap::new(),
            generation: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Schedules `task` to run after `delay`, aborting any pending task for
    /// the same key. A cancelled task never runs; the replacement subsumes
    /// its work.
    pub fn debounce<F>(self: &Arc<Self>, key: DebounceKey, delay: Duration, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let scheduler = Arc::clone(self);
        let fire_key = key.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => return,
            }
            // Remove only our own entry: a newer schedule may have replaced
            // it between the timer firing and this cleanup.
            scheduler
                .pending
                .remove_if(&fire_key, |_, (entry_generation, _)| {
                    *entry_generation == generation
                });
            if let Err(e) = task.await {
                warn!("debounced task {} failed: {:#}", fire_key, e);
            }
        });

        if let Some((_, previous)) = self.pending.insert(key, (generation, handle.abort_handle())) {
            previous.abort();
        }
    }

    /// Cancels a pending action without replacing it.
    pub fn cancel(&self, key: &str) {
        if let Some((_, (_, handle))) = self.pending.remove(key) {
            handle.abort();
        }
    }

    pub fn has_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    fn cancel_all(&self) {
        for entry in self.pending.iter() {
            entry.value().1.abort();
        }
        self.pending.clear();
    }
}

/// The server's executor surface: named pools plus the compilation permit
/// semaphore.
pub struct TaskPools {
    pub import: Pool,
    pub background: Pool,
    pub scheduler: Arc<Scheduler>,
    compilation_permits: Arc<Semaphore>,
    shutdown: broadcast::Sender<()>,
}

impl TaskPools {
    pub fn new() -> Self {
        let cpus = num_cpus::get();
        Self::with_sizes(
            cpus.clamp(IMPORT_POOL_MIN, IMPORT_POOL_MAX),
            cpus.min(COMPILE_PERMIT_MAX),
        )
    }

    pub fn with_sizes(import_size: usize, compile_permits: usize) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            import: Pool::new("import", import_size.max(1), shutdown.clone()),
            background: Pool::new("background", compile_permits.max(1), shutdown.clone()),
            scheduler: Arc::new(Scheduler::new(shutdown.clone())),
            compilation_permits: Arc::new(Semaphore::new(compile_permits.max(1))),
            shutdown,
        }
    }

    /// Acquires a global compilation permit. Returns `None` when the server
    /// is shutting down; callers treat that as an interrupted compile with an
    /// empty error set.
    pub async fn acquire_compile_permit(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        Arc::clone(&self.compilation_permits)
            .acquire_owned()
            .await
            .ok()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Signals every pool task and pending debounce to stop. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.compilation_permits.close();
        self.import.close();
        self.background.close();
        self.scheduler.cancel_all();
    }
}

impl Default for TaskPools {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn pool_runs_submitted_tasks() {
        let pools = TaskPools::with_sizes(2, 2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pools.background.spawn(Path::new("/p"), async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let pools = TaskPools::with_sizes(1, 1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pools.background.spawn(Path::new("/p"), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn debounce_is_last_writer_wins() {
        let pools = TaskPools::with_sizes(2, 2);
        let fired = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            let fired = Arc::clone(&fired);
            pools.scheduler.debounce(
                "recompile:/p".to_string(),
                Duration::from_millis(30),
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(i, 9);
                    Ok(())
                },
            );
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!pools.scheduler.has_pending("recompile:/p"));
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let pools = TaskPools::with_sizes(2, 2);
        let fired = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b", "c"] {
            let fired = Arc::clone(&fired);
            pools
                .scheduler
                .debounce(key.to_string(), Duration::from_millis(10), async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_debounce_never_runs() {
        let pools = TaskPools::with_sizes(2, 2);
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        pools.scheduler.debounce(
            "k".to_string(),
            Duration::from_millis(30),
            async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        pools.scheduler.cancel("k");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_compile_permits() {
        let pools = TaskPools::with_sizes(2, 2);
        pools.shutdown();
        assert!(pools.acquire_compile_permit().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_aborts_pending_debounces() {
        let pools = TaskPools::with_sizes(2, 2);
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        pools.scheduler.debounce(
            "k".to_string(),
            Duration::from_millis(30),
            async move {
                fired_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        pools.shutdown();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
