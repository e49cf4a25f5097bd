//! A bounded pool of async workers.
//!
//! Jobs wait in a bounded queue; [`WorkPool::submit`] awaits when the queue
//! is full, which pushes back on the submitter instead of growing memory.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lodestar_core::Error;

use crate::Result;

type Job = BoxFuture<'static, ()>;

/// A fixed number of workers draining a bounded job queue.
pub struct WorkPool {
    name: &'static str,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkPool")
            .field("name", &self.name)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl WorkPool {
    /// Starts `workers` workers behind a queue of `capacity` jobs.
    ///
    /// Both values are raised to at least 1. Must be called inside a tokio
    /// runtime.
    #[must_use]
    pub fn start(name: &'static str, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else { break };
                        job.await;
                    }
                    tracing::debug!(pool = name, worker, "worker stopped");
                })
            })
            .collect();

        Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    /// Queues `job`, waiting for room if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unrecoverable`] if the pool has been stopped.
    pub async fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| self.stopped())?;
        sender
            .send(Box::pin(job))
            .await
            .map_err(|_| self.stopped())
    }

    /// Returns true once [`stop`](Self::stop) was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stops accepting jobs and waits for queued jobs to finish.
    pub async fn stop(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let handles = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(pool = self.name, error = %e, "worker panicked");
            }
        }
        tracing::info!(pool = self.name, "work pool stopped");
    }

    fn stopped(&self) -> Error {
        Error::unrecoverable(format!("{} work pool is stopped", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_every_submitted_job() {
        let pool = WorkPool::start("test", 3, 2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let done = Arc::clone(&done);
            pool.submit(async move {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .expect("submit");
        }
        pool.stop().await;

        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn submit_waits_for_room() {
        let pool = Arc::new(WorkPool::start("test", 1, 1));
        let (release, gate) = tokio::sync::oneshot::channel::<()>();

        pool.submit(async move {
            let _ = gate.await;
        })
        .await
        .expect("occupy the worker");
        pool.submit(async {}).await.expect("fill the queue");

        let blocked = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.submit(async {}).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        release.send(()).expect("release");
        blocked.await.expect("join").expect("submit after room frees up");
    }

    #[tokio::test]
    async fn stopped_pool_rejects_jobs() {
        let pool = WorkPool::start("test", 1, 1);
        pool.stop().await;

        assert!(pool.is_stopped());
        assert!(pool.submit(async {}).await.is_err());
    }
}
