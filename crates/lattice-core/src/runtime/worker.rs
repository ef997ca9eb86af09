use std::sync::Arc;

use tracing::{info, warn};

use crate::runtime::router::Router;
use crate::runtime::types::{ServeError, StageValue, WorkerId};

/// Type alias for the boxed user compute callable.
///
/// Receives the whole batch exactly once and must return one result per
/// input, in order. Runs on the blocking pool, so it may do CPU- or
/// accelerator-bound work directly.
pub type BatchFn =
    Arc<dyn Fn(Vec<StageValue>) -> Result<Vec<StageValue>, String> + Send + Sync + 'static>;

/// A single worker instance of a backend pool.
///
/// The worker pulls work rather than receiving pushes: its main loop asks
/// the router for the next batch of its backend, invokes the user callable
/// with the entire batch, and reports the outcome. One batch in flight at a
/// time, by construction.
///
/// A callable error or panic fails that one batch; the worker keeps
/// polling. The loop exits when the router shuts down.
pub struct BackendWorker {
    backend_tag: String,
    worker_id: WorkerId,
    router: Router,
    call: BatchFn,
}

impl BackendWorker {
    /// Register a worker for `backend_tag` with the router and start its
    /// main loop. Must be called inside a Tokio runtime.
    pub fn spawn(
        backend_tag: impl Into<String>,
        router: Router,
        call: BatchFn,
    ) -> Result<WorkerId, ServeError> {
        let backend_tag = backend_tag.into();
        let worker_id = router.register_worker(&backend_tag)?;
        let worker = Self {
            backend_tag,
            worker_id,
            router,
            call,
        };
        tokio::spawn(worker.main_loop());
        Ok(worker_id)
    }

    /// idle → fetching → executing → reporting → idle.
    async fn main_loop(self) {
        info!(backend = %self.backend_tag, worker = self.worker_id, "worker started");
        loop {
            let (inputs, lease) = match self.router.poll_batch(self.worker_id).await {
                Ok(batch) => batch,
                Err(ServeError::RouterShutdown) => break,
                Err(e) => {
                    warn!(
                        backend = %self.backend_tag,
                        worker = self.worker_id,
                        error = %e,
                        "worker poll failed"
                    );
                    break;
                }
            };

            let call = Arc::clone(&self.call);
            let outcome = match tokio::task::spawn_blocking(move || call(inputs)).await {
                Ok(result) => result,
                // The callable panicked; the blocking task was torn down.
                Err(_) => Err("user callable panicked".to_owned()),
            };

            self.router.complete_batch(lease, outcome);
        }
        info!(backend = %self.backend_tag, worker = self.worker_id, "worker stopped");
    }
}
