//! Axum router construction and the pipeline-execution handlers.
//!
//! The HTTP surface mirrors the routing table the control plane builds:
//! - `GET /` → the path → pipeline routing snapshot
//! - `GET /health` → heartbeat
//! - `GET /{path}` → run the pipeline with a synthetic request-metadata
//!   object as every source stage's input
//! - `POST /{path}` → run the pipeline with the JSON body mapping each
//!   source service to its input
//!
//! Handlers only touch the edge's local snapshot tables; a pipeline
//! provisioned after the last refresh is not visible yet.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::from_fn;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use lattice_core::{run_pipeline, PipelinePlan, RequestInput};

use crate::config::Config;
use crate::error::ServerError;
use crate::middleware::trace_request;
use crate::state::AppState;

// ── Router builder ────────────────────────────────────────────────────────────

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let cors = cors(&state.config);
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/{*path}", get(run_get).post(run_post))
        // Outermost layers execute first on the way in.
        .layer(from_fn(trace_request))
        .layer(cors)
        .with_state(state)
}

/// CORS policy: restricted to `LATTICE_CORS_ORIGINS` when set and parseable,
/// a development-friendly wildcard otherwise.
fn cors(config: &Config) -> CorsLayer {
    let origin = config
        .cors_allowed_origins
        .as_deref()
        .map(parse_origins)
        .filter(|origins| !origins.is_empty())
        .map_or_else(AllowOrigin::any, AllowOrigin::list);
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

fn parse_origins(raw: &str) -> Vec<HeaderValue> {
    raw.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// The routing snapshot: which paths run which pipelines.
async fn index(State(state): State<Arc<AppState>>) -> Json<HashMap<String, String>> {
    Json(state.tables().routes.clone())
}

/// Heartbeat endpoint.
async fn health() -> Json<Value> {
    Json(json!({
        "status":  "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn run_get(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Json<Value>, ServerError> {
    let plan = lookup_pipeline(&state, &path)?;
    let meta = request_metadata("GET", &path, query.as_deref(), &headers);
    let result = run_pipeline(&plan, &state.serve.router(), RequestInput::Shared(meta)).await?;
    Ok(Json(json!({ "result": result })))
}

async fn run_post(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ServerError> {
    let plan = lookup_pipeline(&state, &path)?;
    let Value::Object(sources) = body else {
        return Err(ServerError::BadRequest(
            "request body must be a JSON object mapping source services to inputs".to_owned(),
        ));
    };
    let result = run_pipeline(
        &plan,
        &state.serve.router(),
        RequestInput::PerSource(sources),
    )
    .await?;
    Ok(Json(json!({ "result": result })))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn lookup_pipeline(state: &AppState, path: &str) -> Result<Arc<PipelinePlan>, ServerError> {
    let key = format!("/{path}");
    let tables = state.tables();
    let pipeline = tables
        .routes
        .get(&key)
        .ok_or_else(|| ServerError::PathNotFound(key.clone()))?;
    // A route can precede its plan into the snapshot only across refreshes;
    // until then the path behaves as unknown.
    tables
        .pipelines
        .get(pipeline)
        .cloned()
        .ok_or(ServerError::PathNotFound(key))
}

/// The synthetic per-source input for GET requests: the request's own
/// metadata object.
fn request_metadata(method: &str, path: &str, query: Option<&str>, headers: &HeaderMap) -> Value {
    let headers: serde_json::Map<String, Value> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), Value::String(v.to_owned())))
        })
        .collect();
    json!({
        "method": method,
        "path": format!("/{path}"),
        "query": query,
        "headers": headers,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use lattice_core::api::{Config as ServeConfig, ServeContext};
    use lattice_core::{ServiceConfig, StageValue};
    use tower::util::ServiceExt;

    use super::*;
    use crate::snapshot;

    /// Context with three pipelines behind routes:
    /// - `/p`: `A` (doubles ints, errors on -1, cap 2) → `B` (adds one)
    /// - `/q`: fan-in with sources `X`, `Y`; sink `Z` sums their outputs
    /// - `/echo`: single service returning its input unchanged
    fn demo_state() -> Arc<AppState> {
        let serve = ServeContext::init(ServeConfig::default());

        serve
            .create_backend("doubler:v1", 1, |batch: Vec<StageValue>| {
                batch
                    .into_iter()
                    .map(|v| {
                        let n = v.as_i64().ok_or_else(|| "expected an integer".to_owned())?;
                        if n == -1 {
                            return Err("refusing to double -1".to_owned());
                        }
                        Ok(json!(n * 2))
                    })
                    .collect()
            })
            .expect("backend A");
        serve
            .create_backend("plus-one:v1", 1, |batch: Vec<StageValue>| {
                batch
                    .into_iter()
                    .map(|v| {
                        let n = v
                            .get("A")
                            .and_then(|a| a.as_i64())
                            .ok_or_else(|| "expected {\"A\": int}".to_owned())?;
                        Ok(json!(n + 1))
                    })
                    .collect()
            })
            .expect("backend B");
        serve
            .create_backend("x:v1", 1, |batch: Vec<StageValue>| {
                Ok(batch
                    .into_iter()
                    .map(|v| json!(v.as_i64().unwrap_or(0) * 10))
                    .collect())
            })
            .expect("backend X");
        serve
            .create_backend("y:v1", 1, |batch: Vec<StageValue>| {
                Ok(batch
                    .into_iter()
                    .map(|v| json!(v.as_i64().unwrap_or(0) + 5))
                    .collect())
            })
            .expect("backend Y");
        serve
            .create_backend("z:v1", 1, |batch: Vec<StageValue>| {
                batch
                    .into_iter()
                    .map(|v| {
                        let x = v.get("X").and_then(|x| x.as_i64());
                        let y = v.get("Y").and_then(|y| y.as_i64());
                        match (x, y) {
                            (Some(x), Some(y)) => Ok(json!(x + y)),
                            _ => Err("join input must carry X and Y".to_owned()),
                        }
                    })
                    .collect()
            })
            .expect("backend Z");
        serve
            .create_backend("echo:v1", 1, |batch: Vec<StageValue>| Ok(batch))
            .expect("backend echo");

        for (service, backend, cap) in [
            ("A", "doubler:v1", 2),
            ("B", "plus-one:v1", 4),
            ("X", "x:v1", 4),
            ("Y", "y:v1", 4),
            ("Z", "z:v1", 4),
            ("E", "echo:v1", 1),
        ] {
            serve
                .create_service(service, ServiceConfig::new(cap))
                .expect("service");
            serve.link_service(service, backend).expect("link");
        }

        serve.add_service_dependencies("p", "A", "B").expect("edge");
        serve.provision_pipeline("p").expect("provision p");
        serve.register_endpoint("/p", "p").expect("endpoint p");

        serve.add_service_dependencies("q", "X", "Z").expect("edge");
        serve.add_service_dependencies("q", "Y", "Z").expect("edge");
        serve.provision_pipeline("q").expect("provision q");
        serve.register_endpoint("/q", "q").expect("endpoint q");

        serve.add_service("echo", "E").expect("node");
        serve.provision_pipeline("echo").expect("provision echo");
        serve.register_endpoint("/echo", "echo").expect("endpoint echo");

        let state = Arc::new(AppState::new(crate::config::Config::default(), serve));
        snapshot::refresh(&state);
        state
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_owned()))
            .expect("request")
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn index_lists_registered_routes() {
        let app = build(demo_state());
        let response = app.oneshot(get_req("/")).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["/p"], "p");
        assert_eq!(body["/q"], "q");
    }

    #[tokio::test]
    async fn responses_carry_a_trace_id() {
        let app = build(demo_state());
        let response = app.oneshot(get_req("/health")).await.expect("response");
        let value = response
            .headers()
            .get("x-trace-id")
            .expect("trace header")
            .to_str()
            .expect("ascii header");
        assert!(uuid::Uuid::parse_str(value).is_ok(), "got: {value}");
    }

    #[test]
    fn parse_origins_drops_garbage() {
        let origins = parse_origins("https://app.example.com, bad\nvalue, ");
        assert_eq!(origins.len(), 1);
        assert_eq!(origins[0], "https://app.example.com");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = build(demo_state());
        let response = app.oneshot(get_req("/health")).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn post_runs_linear_pipeline() {
        let app = build(demo_state());
        let response = app
            .oneshot(post("/p", r#"{"A": 3}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body, json!({ "result": 7 }));
    }

    #[tokio::test]
    async fn post_runs_fan_in_pipeline() {
        let app = build(demo_state());
        let response = app
            .oneshot(post("/q", r#"{"X": 1, "Y": 2}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body, json!({ "result": 17 }));
    }

    #[tokio::test]
    async fn missing_source_input_is_a_500() {
        let app = build(demo_state());
        let response = app
            .oneshot(post("/q", r#"{"X": 1}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        let message = body["error"].as_str().unwrap_or("");
        assert!(message.contains("no input"), "got: {message}");
    }

    #[tokio::test]
    async fn user_code_failure_is_a_500_and_worker_survives() {
        let app = build(demo_state());
        let response = app
            .clone()
            .oneshot(post("/p", r#"{"A": -1}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        let message = body["error"].as_str().unwrap_or("");
        assert!(message.contains("internal error"), "got: {message}");

        let response = app
            .oneshot(post("/p", r#"{"A": 2}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body, json!({ "result": 5 }));
    }

    #[tokio::test]
    async fn unknown_path_is_a_404_naming_the_index() {
        let app = build(demo_state());
        let response = app
            .oneshot(get_req("/does-not-exist"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        let message = body["error"].as_str().unwrap_or("");
        assert!(message.contains("/does-not-exist"), "got: {message}");
        assert!(message.contains("Ping / for the routing table"), "got: {message}");
    }

    #[tokio::test]
    async fn get_feeds_request_metadata_to_sources() {
        let app = build(demo_state());
        let response = app
            .oneshot(get_req("/echo?limit=5"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["result"]["method"], "GET");
        assert_eq!(body["result"]["path"], "/echo");
        assert_eq!(body["result"]["query"], "limit=5");
    }

    #[tokio::test]
    async fn non_object_body_is_a_400() {
        let app = build(demo_state());
        let response = app.oneshot(post("/p", "[1, 2]")).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pipeline_provisioned_after_refresh_is_invisible_until_next() {
        let state = demo_state();
        let app = build(Arc::clone(&state));

        state
            .serve
            .create_backend("late:v1", 1, |batch: Vec<StageValue>| Ok(batch))
            .expect("backend");
        state
            .serve
            .create_service("L", ServiceConfig::new(1))
            .expect("service");
        state.serve.link_service("L", "late:v1").expect("link");
        state.serve.add_service("late", "L").expect("node");
        state.serve.provision_pipeline("late").expect("provision");
        state.serve.register_endpoint("/late", "late").expect("endpoint");

        // Stale snapshot: the new route is not served yet.
        let response = app
            .clone()
            .oneshot(post("/late", r#"{"L": 1}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        snapshot::refresh(&state);
        let response = app
            .oneshot(post("/late", r#"{"L": 1}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
