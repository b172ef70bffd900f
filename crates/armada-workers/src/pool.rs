//! Bounded worker pool.
//!
//! Semantics:
//! - at most `limit` units run concurrently; `spawn` waits for a slot
//! - the first failure is recorded and no further units are scheduled;
//!   units already running finish
//! - a tripped `CancelToken` short-circuits scheduling the same way
//! - `wait` drains in-flight units and returns the first recorded error,
//!   or `cancelled` if scheduling stopped due to cancellation

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use armada_core::DirectorError;

use crate::cancel::CancelToken;

pub struct WorkerPool {
    sem: Arc<Semaphore>,
    join: JoinSet<()>,
    failed: Arc<Mutex<Option<anyhow::Error>>>,
    cancel: Option<CancelToken>,
}

impl WorkerPool {
    pub fn new(limit: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(limit.max(1))),
            join: JoinSet::new(),
            failed: Arc::new(Mutex::new(None)),
            cancel: None,
        }
    }

    /// Attach a cancellation token checked before each unit is scheduled.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn short_circuited(&self) -> bool {
        if self.failed.lock().unwrap().is_some() {
            return true;
        }
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// Schedule one unit, waiting for a free slot. Returns `false` without
    /// scheduling when an earlier unit failed or cancellation was
    /// requested.
    pub async fn spawn<F>(&mut self, unit: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.short_circuited() {
            return false;
        }

        // Waiting for a slot is itself a suspension point; an error may be
        // recorded meanwhile, so re-check after the permit arrives.
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore closed");
        if self.short_circuited() {
            return false;
        }

        let failed = Arc::clone(&self.failed);
        self.join.spawn(async move {
            let result = unit.await;
            if let Err(e) = result {
                let mut slot = failed.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(e);
                } else {
                    debug!(error = %e, "worker unit failed after first error");
                }
            }
            drop(permit);
        });
        true
    }

    /// Wait for all in-flight units and report the outcome.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        while let Some(joined) = self.join.join_next().await {
            if let Err(e) = joined {
                let mut slot = self.failed.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(anyhow::anyhow!("worker unit panicked: {e}"));
                }
            }
        }

        if let Some(err) = self.failed.lock().unwrap().take() {
            return Err(err);
        }
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(DirectorError::Cancelled.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_all_units_within_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let mut pool = WorkerPool::new(2);
        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            let scheduled = pool
                .spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(scheduled);
        }

        pool.wait().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn first_error_stops_scheduling() {
        let mut pool = WorkerPool::new(1);

        assert!(
            pool.spawn(async { Err(anyhow::anyhow!("unit one failed")) })
                .await
        );
        // The failing unit holds the only slot, so by the time a second
        // spawn gets a permit the error is recorded.
        let scheduled = pool.spawn(async { Ok(()) }).await;
        assert!(!scheduled);

        let err = pool.wait().await.unwrap_err();
        assert!(err.to_string().contains("unit one failed"));
    }

    #[tokio::test]
    async fn in_flight_units_run_to_completion_after_error() {
        let finished = Arc::new(AtomicUsize::new(0));

        let mut pool = WorkerPool::new(2);
        let f = Arc::clone(&finished);
        pool.spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
        pool.spawn(async { Err(anyhow::anyhow!("boom")) }).await;

        let err = pool.wait().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        // The slow unit was already in flight and finished.
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_like_an_error() {
        let cancel = CancelToken::new();
        let mut pool = WorkerPool::new(2).with_cancel(cancel.clone());

        assert!(pool.spawn(async { Ok(()) }).await);
        cancel.trip();
        assert!(!pool.spawn(async { Ok(()) }).await);

        let err = pool.wait().await.unwrap_err();
        assert_eq!(
            err.downcast::<DirectorError>().unwrap(),
            DirectorError::Cancelled
        );
    }

    #[tokio::test]
    async fn unit_error_wins_over_cancellation() {
        let cancel = CancelToken::new();
        let mut pool = WorkerPool::new(1).with_cancel(cancel.clone());

        pool.spawn(async { Err(anyhow::anyhow!("real failure")) })
            .await;
        cancel.trip();

        let err = pool.wait().await.unwrap_err();
        assert!(err.to_string().contains("real failure"));
    }

    #[tokio::test]
    async fn empty_pool_waits_cleanly() {
        let pool = WorkerPool::new(4);
        pool.wait().await.unwrap();
    }
}
