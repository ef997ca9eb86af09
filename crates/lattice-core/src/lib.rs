mod runtime;

pub mod api;

pub use runtime::executor::{run_pipeline, RequestInput};
pub use runtime::handle::PipelineHandle;
pub use runtime::registry::{PipelinePlan, PipelineRegistry};
pub use runtime::router::{BatchLease, PendingResult, Router};
pub use runtime::types::{NameKind, ServeError, ServiceConfig, StageValue, WorkerId};
pub use runtime::worker::{BackendWorker, BatchFn};
