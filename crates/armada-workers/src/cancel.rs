//! Cooperative cancellation token.
//!
//! Task bodies poll the token at their suspension points (between work
//! units, between retries, before each instance update). Tripping is
//! one-way.

use std::sync::Arc;

use tokio::sync::watch;

use armada_core::{DirectorError, DirectorResult};

/// Cloneable cancellation flag.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Idempotent.
    pub fn trip(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Suspension-point check: raises `cancelled` once tripped.
    pub fn check(&self) -> DirectorResult<()> {
        if self.is_cancelled() {
            Err(DirectorError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_untripped() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn trip_is_observed_by_clones() {
        let token = CancelToken::new();
        let other = token.clone();

        token.trip();
        assert!(other.is_cancelled());
        assert_eq!(other.check(), Err(DirectorError::Cancelled));

        // Tripping twice is fine.
        other.trip();
        assert!(token.is_cancelled());
    }
}
