use std::time::Duration;

use strum::Display;
use thiserror::Error;

/// Unique identifier for a registered backend worker.
pub type WorkerId = u64;

/// Stage-to-stage data transfer type.
///
/// Everything that crosses a service boundary is JSON: the raw client input
/// for a source stage, or the predecessor-name → output object for a join
/// stage. Opaque to the platform; only user callables interpret it.
pub type StageValue = serde_json::Value;

/// The kind of name an operation failed to resolve (or tried to reuse).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum NameKind {
    #[strum(serialize = "backend")]
    Backend,
    #[strum(serialize = "service")]
    Service,
    #[strum(serialize = "pipeline")]
    Pipeline,
    #[strum(serialize = "route")]
    Route,
    #[strum(serialize = "worker")]
    Worker,
}

/// Errors produced by the serving runtime.
///
/// Control-plane variants (`UnknownName`, `DuplicateName`, `PipelineFrozen`,
/// `CyclicPipeline`, `AlreadyProvisioned`, `NotProvisioned`, `EmptyPipeline`)
/// are returned synchronously to the caller. Data-plane variants surface as
/// per-entry future failures and end up in the HTTP response body.
#[derive(Debug, Clone, Error)]
pub enum ServeError {
    /// The named entity was never registered.
    #[error("unknown {kind} '{name}'")]
    UnknownName { kind: NameKind, name: String },

    /// An entity with this name already exists.
    #[error("{kind} '{name}' already exists")]
    DuplicateName { kind: NameKind, name: String },

    /// The pipeline is provisioned; its graph can no longer change.
    #[error("pipeline '{pipeline}' is provisioned and can no longer change")]
    PipelineFrozen { pipeline: String },

    /// Provisioning found a cycle in the dependency graph.
    #[error("pipeline '{pipeline}' has a cycle through service '{node}'")]
    CyclicPipeline { pipeline: String, node: String },

    /// The pipeline was provisioned before.
    #[error("pipeline '{pipeline}' is already provisioned")]
    AlreadyProvisioned { pipeline: String },

    /// The operation requires a provisioned pipeline.
    #[error("pipeline '{pipeline}' is not provisioned")]
    NotProvisioned { pipeline: String },

    /// Provisioning a pipeline with no services.
    #[error("pipeline '{pipeline}' has no services")]
    EmptyPipeline { pipeline: String },

    /// The user callable returned an error (or panicked) for a batch.
    #[error("service '{service}' internal error: {message}")]
    UserCodeFailure { service: String, message: String },

    /// The worker did not report within the configured stage timeout.
    #[error("service '{service}' stage timed out after {timeout_ms} ms")]
    StageTimeout { service: String, timeout_ms: u64 },

    /// A POST body did not name an input for a source service.
    #[error("no input for source service '{service}'; name it in the request body")]
    MissingStageInput { service: String },

    /// The service exists but was never linked to a backend.
    #[error("service '{service}' is not linked to any backend")]
    ServiceNotLinked { service: String },

    /// A batch cap below 1 was requested.
    #[error("max_batch_size for service '{service}' must be at least 1")]
    InvalidBatchSize { service: String },

    /// The router was shut down while the request was pending.
    #[error("router is shut down")]
    RouterShutdown,
}

/// Per-service dispatch configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Hard upper bound on the number of entries handed to a worker at once.
    pub max_batch_size: usize,
    /// Fail a dispatched batch if the worker has not reported by then.
    /// `None` (the default) disables the timer.
    pub stage_timeout: Option<Duration>,
}

impl ServiceConfig {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size,
            stage_timeout: None,
        }
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new(1)
    }
}
