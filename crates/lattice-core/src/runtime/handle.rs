use std::sync::Arc;

use crate::runtime::executor::{run_pipeline, RequestInput};
use crate::runtime::registry::PipelinePlan;
use crate::runtime::router::Router;
use crate::runtime::types::{ServeError, StageValue};

/// In-process client for one provisioned pipeline.
///
/// Behaves like the HTTP edge but bypasses HTTP entirely: it drives the
/// same traversal directly against the router. Cheap to clone.
#[derive(Clone)]
pub struct PipelineHandle {
    plan: Arc<PipelinePlan>,
    router: Router,
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl PipelineHandle {
    pub(crate) fn new(plan: Arc<PipelinePlan>, router: Router) -> Self {
        Self { plan, router }
    }

    /// Run the pipeline with per-source inputs, like a POST body.
    pub async fn call(
        &self,
        payload: serde_json::Map<String, StageValue>,
    ) -> Result<StageValue, ServeError> {
        run_pipeline(&self.plan, &self.router, RequestInput::PerSource(payload)).await
    }

    /// Run the pipeline with one input shared by every source stage.
    pub async fn call_shared(&self, input: StageValue) -> Result<StageValue, ServeError> {
        run_pipeline(&self.plan, &self.router, RequestInput::Shared(input)).await
    }

    /// The frozen plan this handle executes.
    pub fn plan(&self) -> &PipelinePlan {
        &self.plan
    }
}
