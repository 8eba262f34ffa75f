//! Bounded async task pool.
//!
//! A fixed set of worker tasks drains one bounded job queue. When the queue is
//! full, [`TaskPool::submit`] waits for space instead of dropping the job,
//! while [`TaskPool::try_submit`] refuses it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, warn};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 10;

/// Default job queue capacity.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("task pool is stopped")]
    Stopped,

    #[error("task pool queue is full")]
    Full,
}

/// Fixed-size worker pool with an outstanding-work counter.
pub struct TaskPool {
    sender: RwLock<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    tracker: Arc<Outstanding>,
}

#[derive(Default)]
struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    fn finish_one(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl TaskPool {
    /// Spawn `workers` tasks pulling from a queue of `queue_size` jobs.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(workers: usize, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let tracker = Arc::new(Outstanding::default());

        let handles = (0..workers.max(1))
            .map(|worker_id| tokio::spawn(worker(worker_id, rx.clone(), tracker.clone())))
            .collect();

        Self {
            sender: RwLock::new(Some(tx)),
            workers: Mutex::new(handles),
            tracker,
        }
    }

    /// Queue a job, waiting for space if the queue is saturated.
    pub async fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender.read().await.clone().ok_or(PoolError::Stopped)?;

        self.tracker.count.fetch_add(1, Ordering::AcqRel);
        if sender.send(job.boxed()).await.is_err() {
            self.tracker.finish_one();
            return Err(PoolError::Stopped);
        }
        Ok(())
    }

    /// Queue a job without waiting. Fails with [`PoolError::Full`] when the
    /// queue is saturated.
    pub fn try_submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // The write lock is only taken by `stop`.
        let sender = self
            .sender
            .try_read()
            .ok()
            .and_then(|sender| sender.clone())
            .ok_or(PoolError::Stopped)?;

        self.tracker.count.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(job.boxed()) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.tracker.finish_one();
                match err {
                    mpsc::error::TrySendError::Full(_) => Err(PoolError::Full),
                    mpsc::error::TrySendError::Closed(_) => Err(PoolError::Stopped),
                }
            }
        }
    }

    /// Number of submitted jobs that have not finished yet.
    pub fn outstanding(&self) -> usize {
        self.tracker.count.load(Ordering::Acquire)
    }

    /// Wait until every submitted job has finished.
    pub async fn wait(&self) {
        loop {
            let idle = self.tracker.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.outstanding() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Close the queue and wait for the workers to drain it and exit.
    ///
    /// Later submissions fail with [`PoolError::Stopped`].
    pub async fn stop(&self) {
        self.sender.write().await.take();

        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("Task pool worker ended abnormally: {}", err);
            }
        }
    }
}

async fn worker(worker_id: usize, jobs: Arc<Mutex<mpsc::Receiver<Job>>>, tracker: Arc<Outstanding>) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };

        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            warn!("Task pool worker {} recovered from a panicking job", worker_id);
        }
        tracker.finish_one();
    }
    debug!("Task pool worker {} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_blocks_until_jobs_finish() {
        let pool = TaskPool::new(4, 16);
        let done = Arc::new(AtomicU32::new(0));

        for _ in 0..20 {
            let done = done.clone();
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        pool.wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert_eq!(pool.outstanding(), 0);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_wait_on_idle_pool_returns() {
        let pool = TaskPool::new(2, 4);
        tokio::time::timeout(Duration::from_secs(1), pool.wait())
            .await
            .expect("idle pool should not block");
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_rejected() {
        let pool = TaskPool::new(1, 1);
        pool.stop().await;
        assert_eq!(pool.submit(async {}).await, Err(PoolError::Stopped));
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_saturated_queue_applies_backpressure() {
        let pool = Arc::new(TaskPool::new(1, 1));
        let gate = Arc::new(Notify::new());

        // Occupy the single worker, then fill the single queue slot.
        let blocker = gate.clone();
        pool.submit(async move { blocker.notified().await }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.submit(async {}).await.unwrap();

        let blocked = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(async {}).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        gate.notify_one();
        blocked.await.unwrap().unwrap();
        pool.wait().await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_try_submit_refuses_when_saturated() {
        let pool = TaskPool::new(1, 1);
        let gate = Arc::new(Notify::new());

        let blocker = gate.clone();
        pool.submit(async move { blocker.notified().await }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.try_submit(async {}).unwrap();

        assert_eq!(pool.try_submit(async {}), Err(PoolError::Full));
        assert_eq!(pool.outstanding(), 2);

        gate.notify_one();
        pool.wait().await;
        pool.stop().await;
        assert_eq!(pool.try_submit(async {}), Err(PoolError::Stopped));
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_leak_outstanding() {
        let pool = TaskPool::new(1, 4);
        pool.submit(async { panic!("boom") }).await.unwrap();
        pool.submit(async {}).await.unwrap();
        pool.wait().await;
        assert_eq!(pool.outstanding(), 0);
        pool.stop().await;
    }
}
