//! Async task pool
//!
//! Expensive per-peer callbacks (block validation) run on a small tokio
//! runtime's blocking threads so the message handler never waits on them.
//! Every task is tagged with the peer it works for; the handler checks
//! [`AsyncTaskPool::has_too_many_tasks`] before scheduling more work for a
//! peer and skips that peer until its tasks drain.

use crate::net::peer::PeerId;
use crate::task::cancel::{CancellationSource, CancellationToken, TaskError};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

struct TaskEntry {
    peer: PeerId,
    source: CancellationSource,
    handle: JoinHandle<()>,
}

/// Bounded pool of blocking workers with a per-peer soft limit
pub struct AsyncTaskPool {
    runtime: Mutex<Option<Runtime>>,
    tasks: Mutex<Vec<TaskEntry>>,
    shutdown: CancellationSource,
    soft_limit: usize,
}

impl AsyncTaskPool {
    /// Create a pool running at most `threads` tasks at once
    pub fn new(threads: usize, soft_limit: usize) -> std::io::Result<Self> {
        let threads = threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name("p2p-task")
            .enable_time()
            .build()?;
        log::debug!("async task pool started with {} threads", threads);
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationSource::new(),
            soft_limit,
        })
    }

    pub fn soft_limit(&self) -> usize {
        self.soft_limit
    }

    /// Unfinished tasks for `peer`
    pub fn task_count(&self, peer: PeerId) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|t| t.peer == peer && !t.handle.is_finished())
            .count()
    }

    /// Unfinished tasks per peer
    pub fn task_counts(&self) -> HashMap<PeerId, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.lock().iter() {
            if !task.handle.is_finished() {
                *counts.entry(task.peer).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn has_too_many_tasks(&self, peer: PeerId) -> bool {
        self.task_count(peer) >= self.soft_limit
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run `work` on the pool for `peer`. The closure receives a token
    /// joined from the pool's shutdown source, the task's own source and
    /// `extra` (e.g. a timed budget).
    pub fn spawn<F>(
        &self,
        peer: PeerId,
        extra: Option<CancellationToken>,
        work: F,
    ) -> Result<CancellationSource, TaskError>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(TaskError::PoolShutDown);
        }
        let source = CancellationSource::new();
        let own = source.token();
        let shutdown = self.shutdown.token();
        let token = match &extra {
            Some(extra) => CancellationToken::join(&[&shutdown, &own, extra]),
            None => CancellationToken::join(&[&shutdown, &own]),
        };

        let handle = {
            let runtime = self.runtime.lock();
            let runtime = runtime.as_ref().ok_or(TaskError::PoolShutDown)?;
            runtime.spawn_blocking(move || work(token))
        };
        self.tasks.lock().push(TaskEntry {
            peer,
            source: source.clone(),
            handle,
        });
        Ok(source)
    }

    /// Cancel every task working for `peer`
    pub fn cancel_peer(&self, peer: PeerId) {
        for task in self.tasks.lock().iter().filter(|t| t.peer == peer) {
            task.source.cancel();
        }
    }

    /// Drop finished tasks. Returns how many were removed.
    pub fn reap(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|t| !t.handle.is_finished());
        before - tasks.len()
    }

    /// Cancel all tasks and block until they have returned
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<TaskEntry> = std::mem::take(&mut *self.tasks.lock());
        let runtime = self.runtime.lock().take();
        let Some(runtime) = runtime else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            // Released from inside one of our own tasks: blocking here would
            // wait on ourselves. The cancelled tasks finish on their own.
            log::debug!("async task pool released from a task, {} tasks left running", tasks.len());
            drop(tasks);
            runtime.shutdown_background();
            return;
        }
        log::debug!("stopping async task pool, waiting for {} tasks", tasks.len());
        runtime.block_on(async {
            for task in tasks {
                if let Err(e) = task.handle.await {
                    log::warn!("async task for {} failed: {}", task.peer, e);
                }
            }
        });
    }
}

impl Drop for AsyncTaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AsyncTaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTaskPool")
            .field("tasks", &self.tasks.lock().len())
            .field("soft_limit", &self.soft_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not met in time");
    }

    #[test]
    fn test_soft_limit() {
        let pool = AsyncTaskPool::new(4, 3).unwrap();
        let peer = PeerId(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(parking_lot::Mutex::new(release_rx));

        for _ in 0..3 {
            let rx = release_rx.clone();
            pool.spawn(peer, None, move |_| {
                let _ = rx.lock().recv_timeout(Duration::from_secs(5));
            })
            .unwrap();
        }
        assert_eq!(pool.task_count(peer), 3);
        assert!(pool.has_too_many_tasks(peer));
        assert!(!pool.has_too_many_tasks(PeerId(2)));

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        wait_for(|| pool.task_count(peer) == 0);
        assert!(!pool.has_too_many_tasks(peer));
        assert_eq!(pool.reap(), 3);
    }

    #[test]
    fn test_cancel_peer() {
        let pool = AsyncTaskPool::new(2, 3).unwrap();
        let observed = Arc::new(AtomicUsize::new(0));
        let seen = observed.clone();
        pool.spawn(PeerId(5), None, move |token| {
            while !token.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.cancel_peer(PeerId(5));
        wait_for(|| observed.load(Ordering::SeqCst) == 1);
    }

    #[test]
    fn test_shutdown_waits_for_tasks() {
        let pool = AsyncTaskPool::new(2, 3).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));
        for i in 0..2 {
            let finished = finished.clone();
            pool.spawn(PeerId(i), None, move |token| {
                while !token.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                finished.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert!(pool.is_shut_down());
        assert_eq!(
            pool.spawn(PeerId(9), None, |_| {}).unwrap_err(),
            TaskError::PoolShutDown
        );
    }

    #[test]
    fn test_last_handle_dropped_inside_task() {
        let pool = Arc::new(AsyncTaskPool::new(1, 3).unwrap());
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();
        let inner = pool.clone();
        pool.spawn(PeerId(1), None, move |_| {
            let _ = go_rx.recv_timeout(Duration::from_secs(5));
            drop(inner);
            let _ = done_tx.send(());
        })
        .unwrap();

        drop(pool);
        go_tx.send(()).unwrap();
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_extra_token_cancels() {
        let pool = AsyncTaskPool::new(1, 3).unwrap();
        let extra = CancellationSource::new();
        let (tx, rx) = mpsc::channel();
        pool.spawn(PeerId(1), Some(extra.token()), move |token| {
            while !token.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            let _ = tx.send(());
        })
        .unwrap();
        extra.cancel();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
