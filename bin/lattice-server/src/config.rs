//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

/// Runtime configuration for lattice-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8000"`).
    pub bind_address: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// How often the edge refreshes its local routing and pipeline tables
    /// from the registry. Between refreshes the edge serves stale data;
    /// newly provisioned pipelines appear after the next refresh.
    pub snapshot_interval: Duration,

    /// Advisory upper bound, in bytes, on payloads held in router queues.
    pub object_store_memory: usize,

    /// How long in-flight batches may keep draining after shutdown begins.
    pub shutdown_grace: Duration,

    /// Comma-separated list of allowed CORS origins, e.g.
    /// `"https://app.example.com,https://admin.example.com"`.
    /// When `None` (default), all origins are allowed (`*`).
    pub cors_allowed_origins: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("LATTICE_BIND", "0.0.0.0:8000"),
            log_level: env_or("LATTICE_LOG", "info"),
            log_json: std::env::var("LATTICE_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            snapshot_interval: Duration::from_secs(parse_env("LATTICE_SNAPSHOT_INTERVAL_S", 2)),
            object_store_memory: parse_env("LATTICE_OBJECT_STORE_MEMORY", 100 * 1024 * 1024),
            shutdown_grace: Duration::from_secs(parse_env("LATTICE_SHUTDOWN_GRACE_S", 5)),
            cors_allowed_origins: std::env::var("LATTICE_CORS_ORIGINS").ok(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_owned(),
            log_level: "info".to_owned(),
            log_json: false,
            snapshot_interval: Duration::from_secs(2),
            object_store_memory: 100 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(5),
            cors_allowed_origins: None,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
