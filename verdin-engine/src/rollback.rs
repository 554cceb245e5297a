//! Rollback context for multi-step operations.
//!
//! Each side effect registers a compensation right after it succeeds. On
//! failure the caller runs `rollback()` and the compensations execute in
//! reverse registration order; on success `commit()` discards them.
//! Compensations are best effort: a failing undo step is logged and the
//! remaining steps still run.

use futures::future::BoxFuture;
use std::future::Future;
use tracing::{debug, warn};

pub struct RollbackContext {
    steps: Vec<(&'static str, Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>)>,
    committed: bool,
}

impl Default for RollbackContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RollbackContext {
    pub fn new() -> Self {
        Self { steps: Vec::new(), committed: false }
    }

    /// Register a compensation for a step that just succeeded.
    pub fn push<F, Fut>(&mut self, label: &'static str, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.steps.push((label, Box::new(move || Box::pin(f()))));
    }

    /// The operation succeeded; drop all compensations.
    pub fn commit(mut self) {
        self.committed = true;
        self.steps.clear();
    }

    /// Undo everything registered so far, newest first.
    pub async fn rollback(mut self) {
        self.committed = true;
        let steps = std::mem::take(&mut self.steps);
        for (label, undo) in steps.into_iter().rev() {
            debug!(step = label, "rolling back");
            undo().await;
        }
    }
}

impl Drop for RollbackContext {
    fn drop(&mut self) {
        if !self.committed && !self.steps.is_empty() {
            // Undo steps are async and cannot run from Drop.
            warn!(
                pending = self.steps.len(),
                "rollback context dropped without commit or rollback"
            );
        }
    }
}
