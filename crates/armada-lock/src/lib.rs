//! armada-lock — named, expiring locks over the shared state store.
//!
//! Every mutating task scopes its work with one of these. Acquisition
//! retries with jittered sleeps until a timeout; a held lock is refreshed
//! by a background renewal task at a third of its TTL; release happens on
//! every exit path because the guard also releases on drop.
//!
//! Lock rows live in the state store, so exclusivity holds across director
//! processes sharing a database.

pub mod names;

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use armada_core::DirectorError;
use armada_state::StateStore;

/// Tunables for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// How long a lock row stays valid without renewal.
    pub ttl: Duration,
    /// How long to keep retrying before giving up with `lock_busy`.
    pub timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            timeout: Duration::from_secs(300),
        }
    }
}

/// A held lock. Renewed in the background, released on `release()` or drop.
#[derive(Debug)]
pub struct LockGuard {
    store: StateStore,
    name: String,
    holder: String,
    shutdown: watch::Sender<bool>,
    renew: Option<JoinHandle<()>>,
    released: bool,
}

impl LockGuard {
    /// Acquire the named lock, retrying with jittered sleeps until
    /// `opts.timeout` elapses.
    pub async fn acquire(
        store: &StateStore,
        name: &str,
        opts: LockOptions,
    ) -> anyhow::Result<LockGuard> {
        let holder = Uuid::new_v4().to_string();
        let started = Instant::now();

        loop {
            if store.try_acquire_lock(name, &holder, opts.ttl)? {
                break;
            }
            if started.elapsed() >= opts.timeout {
                return Err(DirectorError::LockBusy(name.to_string()).into());
            }
            let jitter = rand::thread_rng().gen_range(0..500);
            tokio::time::sleep(Duration::from_millis(500 + jitter)).await;
        }
        debug!(lock = %name, holder = %holder, "lock acquired");

        // Renewal loop at TTL/3 keeps the row alive while work runs.
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let renew_store = store.clone();
        let renew_name = name.to_string();
        let renew_holder = holder.clone();
        let ttl = opts.ttl;
        let renew = tokio::spawn(async move {
            let interval = ttl / 3;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match renew_store.renew_lock(&renew_name, &renew_holder, ttl) {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(lock = %renew_name, "lock renewal lost the row");
                                break;
                            }
                            Err(e) => {
                                warn!(lock = %renew_name, error = %e, "lock renewal failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Ok(LockGuard {
            store: store.clone(),
            name: name.to_string(),
            holder,
            shutdown,
            renew: Some(renew),
            released: false,
        })
    }

    /// Release the lock explicitly.
    pub fn release(mut self) {
        self.release_inner();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.renew.take() {
            handle.abort();
        }
        match self.store.release_lock(&self.name, &self.holder) {
            Ok(true) => debug!(lock = %self.name, "lock released"),
            Ok(false) => warn!(lock = %self.name, "lock row no longer held at release"),
            Err(e) => warn!(lock = %self.name, error = %e, "lock release failed"),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
