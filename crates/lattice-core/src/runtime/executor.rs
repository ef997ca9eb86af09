use std::collections::HashMap;

use tracing::debug;

use crate::runtime::registry::PipelinePlan;
use crate::runtime::router::Router;
use crate::runtime::types::{ServeError, StageValue};

/// How source stages of a traversal obtain their input.
#[derive(Debug, Clone)]
pub enum RequestInput {
    /// POST-style body: each source stage looks up its own name.
    PerSource(serde_json::Map<String, StageValue>),
    /// GET-style: one synthetic request object shared by every source stage.
    Shared(StageValue),
}

/// Drive one request through a provisioned pipeline.
///
/// Walks `node_order` sequentially, keeping a transient `inbox` per node:
/// a source stage takes its input from the request, a join stage receives
/// the predecessor-name → value object accumulated as its predecessors
/// completed. Each stage is submitted to the router and awaited before the
/// next; the first sink reached terminates the traversal with its result.
///
/// Concurrency comes from requests, not stages: many traversals share the
/// same router queues and therefore share batches.
pub async fn run_pipeline(
    plan: &PipelinePlan,
    router: &Router,
    input: RequestInput,
) -> Result<StageValue, ServeError> {
    let mut inbox: HashMap<&str, serde_json::Map<String, StageValue>> = HashMap::new();

    for node in &plan.node_order {
        let staged = inbox.remove(node.as_str());
        let stage_input = match staged {
            Some(received) if !received.is_empty() => StageValue::Object(received),
            _ => match &input {
                RequestInput::PerSource(body) => body.get(node).cloned().ok_or_else(|| {
                    ServeError::MissingStageInput {
                        service: node.clone(),
                    }
                })?,
                RequestInput::Shared(value) => value.clone(),
            },
        };

        let pending = router.enqueue_request(node, stage_input)?;
        let result = pending.recv().await?;

        let successors = plan.successors_of(node);
        if successors.is_empty() {
            // First sink in topological order ends the traversal.
            debug!(pipeline = %plan.name, sink = %node, "pipeline complete");
            return Ok(result);
        }
        for successor in successors {
            inbox
                .entry(successor.as_str())
                .or_default()
                .insert(node.clone(), result.clone());
        }
    }

    // Only reachable for a hand-built plan with no nodes; provisioning
    // rejects those.
    Err(ServeError::EmptyPipeline {
        pipeline: plan.name.clone(),
    })
}
