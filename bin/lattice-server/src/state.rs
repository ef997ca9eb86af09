//! Shared application state injected into every Axum handler.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use lattice_core::api::ServeContext;
use lattice_core::PipelinePlan;

use crate::config::Config;

/// The edge's local copies of the registry tables.
///
/// Replaced wholesale by the snapshot refresher; handlers only read.
/// Between refreshes the edge serves whatever the last pull saw.
#[derive(Default)]
pub struct EdgeTables {
    /// HTTP path → pipeline name.
    pub routes: HashMap<String, String>,
    /// Pipeline name → frozen execution plan.
    pub pipelines: HashMap<String, Arc<PipelinePlan>>,
}

/// State shared across all HTTP handlers and the snapshot refresher.
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// The in-process serving coordinator.
    pub serve: ServeContext,
    tables: RwLock<EdgeTables>,
}

impl AppState {
    pub fn new(config: Config, serve: ServeContext) -> Self {
        Self {
            config: Arc::new(config),
            serve,
            tables: RwLock::new(EdgeTables::default()),
        }
    }

    /// Read access to the current snapshot tables.
    pub fn tables(&self) -> RwLockReadGuard<'_, EdgeTables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap in a freshly pulled snapshot.
    pub fn replace_tables(&self, tables: EdgeTables) {
        *self.tables.write().unwrap_or_else(PoisonError::into_inner) = tables;
    }
}
