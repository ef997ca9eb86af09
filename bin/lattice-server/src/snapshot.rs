//! Periodic routing-table refresher.
//!
//! The edge never reads the registry on the hot path; it serves from local
//! copies pulled every `LATTICE_SNAPSHOT_INTERVAL_S` seconds. Two
//! consecutive refreshes with no control-plane mutations in between
//! produce equal tables.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::state::{AppState, EdgeTables};

/// Pull the registry tables into the edge's local state once.
pub fn refresh(state: &AppState) {
    let routes = state.serve.route_snapshot();
    let pipelines = state.serve.pipeline_snapshot();
    debug!(
        routes = routes.len(),
        pipelines = pipelines.len(),
        "edge snapshot refreshed"
    );
    state.replace_tables(EdgeTables { routes, pipelines });
}

/// Spawn the background refresher. The first tick fires immediately, so
/// the edge is populated as soon as the task runs. Abort the returned
/// handle on shutdown.
pub fn spawn_refresher(state: Arc<AppState>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            refresh(&state);
        }
    })
}
