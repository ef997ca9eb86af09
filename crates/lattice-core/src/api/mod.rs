//! Control-plane facade for lattice-core.
//!
//! One [`ServeContext`] per process (or per test): create backends and
//! services, link them, declare pipeline DAGs, provision, and obtain
//! handles. All mutations are observable when the method returns; none of
//! them ever propagate errors into the data plane.
//!
//! # Quick-start
//!
//! ```rust,no_run
//! use lattice_core::api::{Config, ServeContext};
//! use lattice_core::ServiceConfig;
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), lattice_core::ServeError> {
//! let serve = ServeContext::init(Config::default());
//!
//! serve.create_backend("double:v1", 1, |batch| {
//!     Ok(batch
//!         .into_iter()
//!         .map(|v| json!(v.as_i64().unwrap_or(0) * 2))
//!         .collect())
//! })?;
//! serve.create_service("double", ServiceConfig::new(4))?;
//! serve.link_service("double", "double:v1")?;
//!
//! serve.add_service("p", "double")?;
//! serve.provision_pipeline("p")?;
//! serve.register_endpoint("/p", "p")?;
//!
//! let handle = serve.get_handle("p")?;
//! let mut payload = serde_json::Map::new();
//! payload.insert("double".into(), json!(21));
//! let result = handle.call(payload).await?;
//! assert_eq!(result, json!(42));
//! # Ok(())
//! # }
//! ```
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::runtime::handle::PipelineHandle;
use crate::runtime::registry::{PipelinePlan, PipelineRegistry};
use crate::runtime::router::Router;
use crate::runtime::types::{ServeError, ServiceConfig, StageValue};
use crate::runtime::worker::{BackendWorker, BatchFn};

pub use types::Config;

/// The process-wide serving coordinator.
///
/// Owns the [`Router`] and the [`PipelineRegistry`]; every control-plane
/// operation is a method here. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ServeContext {
    router: Router,
    registry: PipelineRegistry,
}

impl ServeContext {
    /// Initialise a serving context.
    ///
    /// Must be called inside a Tokio runtime: backend workers are spawned
    /// as tasks when [`create_backend`] is called.
    ///
    /// [`create_backend`]: ServeContext::create_backend
    pub fn init(config: Config) -> Self {
        info!(
            object_store_memory = config.object_store_memory,
            "serve context initialised"
        );
        Self {
            router: Router::new(config.object_store_memory),
            registry: PipelineRegistry::new(),
        }
    }

    // ── Backends and services ────────────────────────────────────────────────

    /// Create a backend pool of `replicas` workers running `call`.
    ///
    /// `call` receives each batch exactly once and must return one result
    /// per input, in order. Replicas share the callable; per-replica state
    /// belongs inside whatever the closure captures.
    pub fn create_backend(
        &self,
        backend_tag: impl Into<String>,
        replicas: usize,
        call: impl Fn(Vec<StageValue>) -> Result<Vec<StageValue>, String> + Send + Sync + 'static,
    ) -> Result<(), ServeError> {
        let backend_tag = backend_tag.into();
        self.router.register_backend(&backend_tag)?;
        self.registry.register_backend(&backend_tag)?;

        let call: BatchFn = Arc::new(call);
        let replicas = replicas.max(1);
        for _ in 0..replicas {
            BackendWorker::spawn(&backend_tag, self.router.clone(), Arc::clone(&call))?;
        }
        info!(backend = %backend_tag, replicas, "backend created");
        Ok(())
    }

    /// Create a service with its dispatch configuration.
    pub fn create_service(
        &self,
        service: impl Into<String>,
        config: ServiceConfig,
    ) -> Result<(), ServeError> {
        let service = service.into();
        self.router.register_service(&service, config)?;
        self.registry.register_service(&service)?;
        info!(service = %service, "service created");
        Ok(())
    }

    /// Link a service to a backend (1:1).
    pub fn link_service(&self, service: &str, backend_tag: &str) -> Result<(), ServeError> {
        self.registry.link(service, backend_tag)?;
        self.router.link(service, backend_tag)
    }

    /// Update a service's batch cap. Must be ≥ 1.
    pub fn set_max_batch(&self, service: &str, max_batch_size: usize) -> Result<(), ServeError> {
        self.router.set_max_batch(service, max_batch_size)
    }

    /// Set (or clear) a service's stage timeout.
    pub fn set_stage_timeout(
        &self,
        service: &str,
        timeout: Option<Duration>,
    ) -> Result<(), ServeError> {
        self.router.set_stage_timeout(service, timeout)
    }

    // ── Pipelines ────────────────────────────────────────────────────────────

    /// Add a service as a vertex of a (still building) pipeline.
    pub fn add_service(&self, pipeline: &str, service: &str) -> Result<(), ServeError> {
        self.registry.add_node(pipeline, service)
    }

    /// Declare `src` → `dst`: the producer's output becomes one of the
    /// consumer's inputs. Implicitly adds both services as vertices.
    pub fn add_service_dependencies(
        &self,
        pipeline: &str,
        src: &str,
        dst: &str,
    ) -> Result<(), ServeError> {
        self.registry.add_edge(pipeline, src, dst)
    }

    /// Validate and freeze the pipeline's DAG. A pipeline can be
    /// provisioned only once; afterwards its graph is immutable.
    pub fn provision_pipeline(&self, pipeline: &str) -> Result<Arc<PipelinePlan>, ServeError> {
        self.registry.provision(pipeline)
    }

    /// Fetch the frozen execution plan of a provisioned pipeline.
    pub fn get_dependency(&self, pipeline: &str) -> Result<Arc<PipelinePlan>, ServeError> {
        self.registry.get_dependency(pipeline)
    }

    /// Bind an HTTP path to a provisioned pipeline.
    pub fn register_endpoint(&self, path: &str, pipeline: &str) -> Result<(), ServeError> {
        self.registry.register_route(path, pipeline)
    }

    /// Obtain an in-process handle that drives the pipeline without HTTP.
    pub fn get_handle(&self, pipeline: &str) -> Result<PipelineHandle, ServeError> {
        let plan = self.registry.get_dependency(pipeline)?;
        Ok(PipelineHandle::new(plan, self.router.clone()))
    }

    // ── Edge snapshots ───────────────────────────────────────────────────────

    /// Copy of the path → pipeline routing table.
    pub fn route_snapshot(&self) -> HashMap<String, String> {
        self.registry.route_snapshot()
    }

    /// Copy of the provisioned pipeline table.
    pub fn pipeline_snapshot(&self) -> HashMap<String, Arc<PipelinePlan>> {
        self.registry.pipeline_snapshot()
    }

    /// The shared router, for driving snapshot plans at the HTTP edge.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Stop the data plane: queued entries fail with `RouterShutdown`,
    /// workers exit after their current batch, and in-flight batches get
    /// up to `grace` to report.
    pub async fn shutdown(&self, grace: Duration) {
        self.router.shutdown();
        self.router.drain(grace).await;
        info!("serve context stopped");
    }
}
