use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tracing::info;

use crate::runtime::types::{NameKind, ServeError};

/// The frozen execution plan of a provisioned pipeline.
///
/// `node_order` is a valid linear extension of the DAG; `successors` maps
/// every node to its out-neighbors in edge-insertion order. Both are
/// immutable after provisioning; snapshots hand out the same `Arc`.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub name: String,
    pub node_order: Vec<String>,
    pub successors: HashMap<String, Vec<String>>,
}

impl PipelinePlan {
    pub fn successors_of(&self, node: &str) -> &[String] {
        self.successors.get(node).map(Vec::as_slice).unwrap_or(&[])
    }
}

enum PipelineRecord {
    Building {
        nodes: Vec<String>,
        edges: Vec<(String, String)>,
    },
    Provisioned(Arc<PipelinePlan>),
}

#[derive(Default)]
struct RegistryState {
    backends: HashSet<String>,
    /// service name → linked backend tag (None until linked).
    services: HashMap<String, Option<String>>,
    pipelines: HashMap<String, PipelineRecord>,
    /// HTTP path → pipeline name.
    routes: HashMap<String, String>,
}

/// Pipeline and routing-table store.
///
/// Mutated only by the control plane; the HTTP edge reads it through
/// [`route_snapshot`] / [`pipeline_snapshot`] copies.
///
/// [`route_snapshot`]: PipelineRegistry::route_snapshot
/// [`pipeline_snapshot`]: PipelineRegistry::pipeline_snapshot
#[derive(Clone, Default)]
pub struct PipelineRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Name registration ────────────────────────────────────────────────────

    pub fn register_backend(&self, backend_tag: &str) -> Result<(), ServeError> {
        let mut st = self.write();
        if !st.backends.insert(backend_tag.to_owned()) {
            return Err(ServeError::DuplicateName {
                kind: NameKind::Backend,
                name: backend_tag.to_owned(),
            });
        }
        Ok(())
    }

    pub fn register_service(&self, service: &str) -> Result<(), ServeError> {
        let mut st = self.write();
        if st.services.contains_key(service) {
            return Err(ServeError::DuplicateName {
                kind: NameKind::Service,
                name: service.to_owned(),
            });
        }
        st.services.insert(service.to_owned(), None);
        Ok(())
    }

    /// Record the 1:1 service → backend link.
    pub fn link(&self, service: &str, backend_tag: &str) -> Result<(), ServeError> {
        let mut st = self.write();
        if !st.backends.contains(backend_tag) {
            return Err(ServeError::UnknownName {
                kind: NameKind::Backend,
                name: backend_tag.to_owned(),
            });
        }
        match st.services.get_mut(service) {
            Some(link) => {
                *link = Some(backend_tag.to_owned());
                Ok(())
            }
            None => Err(ServeError::UnknownName {
                kind: NameKind::Service,
                name: service.to_owned(),
            }),
        }
    }

    // ── Pipeline building ────────────────────────────────────────────────────

    /// Add `service` as a vertex of `pipeline`. Creates the pipeline record
    /// on first use; idempotent for an already-present node.
    pub fn add_node(&self, pipeline: &str, service: &str) -> Result<(), ServeError> {
        let mut st = self.write();
        if !st.services.contains_key(service) {
            return Err(ServeError::UnknownName {
                kind: NameKind::Service,
                name: service.to_owned(),
            });
        }
        let record = st
            .pipelines
            .entry(pipeline.to_owned())
            .or_insert_with(|| PipelineRecord::Building {
                nodes: Vec::new(),
                edges: Vec::new(),
            });
        match record {
            PipelineRecord::Provisioned(_) => Err(ServeError::PipelineFrozen {
                pipeline: pipeline.to_owned(),
            }),
            PipelineRecord::Building { nodes, .. } => {
                if !nodes.iter().any(|n| n == service) {
                    nodes.push(service.to_owned());
                }
                Ok(())
            }
        }
    }

    /// Declare that `src`'s output becomes one of `dst`'s inputs.
    ///
    /// Both endpoints are added as nodes if they are not already present.
    pub fn add_edge(&self, pipeline: &str, src: &str, dst: &str) -> Result<(), ServeError> {
        let mut st = self.write();
        for service in [src, dst] {
            if !st.services.contains_key(service) {
                return Err(ServeError::UnknownName {
                    kind: NameKind::Service,
                    name: service.to_owned(),
                });
            }
        }
        let record = st
            .pipelines
            .entry(pipeline.to_owned())
            .or_insert_with(|| PipelineRecord::Building {
                nodes: Vec::new(),
                edges: Vec::new(),
            });
        match record {
            PipelineRecord::Provisioned(_) => Err(ServeError::PipelineFrozen {
                pipeline: pipeline.to_owned(),
            }),
            PipelineRecord::Building { nodes, edges } => {
                for service in [src, dst] {
                    if !nodes.iter().any(|n| n == service) {
                        nodes.push(service.to_owned());
                    }
                }
                let edge = (src.to_owned(), dst.to_owned());
                if !edges.contains(&edge) {
                    edges.push(edge);
                }
                Ok(())
            }
        }
    }

    // ── Provisioning ─────────────────────────────────────────────────────────

    /// Validate and freeze a pipeline: every node must be a linked service
    /// and the graph acyclic. On success the record is swapped to the frozen
    /// plan; on any error the building record is left untouched.
    pub fn provision(&self, pipeline: &str) -> Result<Arc<PipelinePlan>, ServeError> {
        let mut st = self.write();

        let (nodes, edges) = match st.pipelines.get(pipeline) {
            None => {
                return Err(ServeError::UnknownName {
                    kind: NameKind::Pipeline,
                    name: pipeline.to_owned(),
                })
            }
            Some(PipelineRecord::Provisioned(_)) => {
                return Err(ServeError::AlreadyProvisioned {
                    pipeline: pipeline.to_owned(),
                })
            }
            Some(PipelineRecord::Building { nodes, edges }) => (nodes.clone(), edges.clone()),
        };

        if nodes.is_empty() {
            return Err(ServeError::EmptyPipeline {
                pipeline: pipeline.to_owned(),
            });
        }

        for node in &nodes {
            match st.services.get(node) {
                None => {
                    return Err(ServeError::UnknownName {
                        kind: NameKind::Service,
                        name: node.clone(),
                    })
                }
                Some(None) => {
                    return Err(ServeError::ServiceNotLinked {
                        service: node.clone(),
                    })
                }
                Some(Some(_)) => {}
            }
        }

        let mut graph = DiGraph::<String, ()>::new();
        let mut indices = HashMap::with_capacity(nodes.len());
        for node in &nodes {
            let idx = graph.add_node(node.clone());
            indices.insert(node.clone(), idx);
        }
        for (src, dst) in &edges {
            if let (Some(&a), Some(&b)) = (indices.get(src), indices.get(dst)) {
                graph.add_edge(a, b, ());
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| ServeError::CyclicPipeline {
            pipeline: pipeline.to_owned(),
            node: graph[cycle.node_id()].clone(),
        })?;
        let node_order: Vec<String> = order.into_iter().map(|i| graph[i].clone()).collect();

        let mut successors: HashMap<String, Vec<String>> =
            nodes.iter().map(|n| (n.clone(), Vec::new())).collect();
        for (src, dst) in &edges {
            if let Some(out) = successors.get_mut(src) {
                out.push(dst.clone());
            }
        }

        let plan = Arc::new(PipelinePlan {
            name: pipeline.to_owned(),
            node_order,
            successors,
        });
        st.pipelines
            .insert(pipeline.to_owned(), PipelineRecord::Provisioned(Arc::clone(&plan)));
        info!(
            pipeline,
            nodes = plan.node_order.len(),
            edges = edges.len(),
            "pipeline provisioned"
        );
        Ok(plan)
    }

    /// Fetch the frozen plan of a provisioned pipeline.
    pub fn get_dependency(&self, pipeline: &str) -> Result<Arc<PipelinePlan>, ServeError> {
        let st = self.read();
        match st.pipelines.get(pipeline) {
            None => Err(ServeError::UnknownName {
                kind: NameKind::Pipeline,
                name: pipeline.to_owned(),
            }),
            Some(PipelineRecord::Building { .. }) => Err(ServeError::NotProvisioned {
                pipeline: pipeline.to_owned(),
            }),
            Some(PipelineRecord::Provisioned(plan)) => Ok(Arc::clone(plan)),
        }
    }

    // ── Routing table ────────────────────────────────────────────────────────

    /// Bind an HTTP path to a provisioned pipeline. Paths are normalised to
    /// a leading `/`.
    pub fn register_route(&self, path: &str, pipeline: &str) -> Result<(), ServeError> {
        let path = normalize_path(path);
        let mut st = self.write();
        match st.pipelines.get(pipeline) {
            None => {
                return Err(ServeError::UnknownName {
                    kind: NameKind::Pipeline,
                    name: pipeline.to_owned(),
                })
            }
            Some(PipelineRecord::Building { .. }) => {
                return Err(ServeError::NotProvisioned {
                    pipeline: pipeline.to_owned(),
                })
            }
            Some(PipelineRecord::Provisioned(_)) => {}
        }
        if st.routes.contains_key(&path) {
            return Err(ServeError::DuplicateName {
                kind: NameKind::Route,
                name: path,
            });
        }
        info!(path = %path, pipeline, "endpoint registered");
        st.routes.insert(path, pipeline.to_owned());
        Ok(())
    }

    // ── Snapshots for the HTTP edge ──────────────────────────────────────────

    /// Copy of the path → pipeline routing table.
    pub fn route_snapshot(&self) -> HashMap<String, String> {
        self.read().routes.clone()
    }

    /// Copy of the provisioned pipeline table.
    pub fn pipeline_snapshot(&self) -> HashMap<String, Arc<PipelinePlan>> {
        self.read()
            .pipelines
            .iter()
            .filter_map(|(name, record)| match record {
                PipelineRecord::Provisioned(plan) => Some((name.clone(), Arc::clone(plan))),
                PipelineRecord::Building { .. } => None,
            })
            .collect()
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
