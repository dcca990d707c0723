//! Environment-driven configuration, collected once at startup.

use std::time::Duration;

use crate::identity::OverlayShape;

/// Which backend holds session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// The mu-stack SPARQL endpoint (production).
    Sparql,
    /// In-process store for local runs and tests.
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub store: StoreBackend,
    pub sparql_endpoint: String,
    /// Hard cap on every store round trip; expiry surfaces as a transient
    /// store error, never as a hang.
    pub store_timeout: Duration,
    /// Optimistic-retry budget for contended session writes.
    pub retry_budget: usize,
    pub shape: OverlayShape,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            store: StoreBackend::Sparql,
            sparql_endpoint: "http://database:8890/sparql".to_string(),
            store_timeout: Duration::from_millis(5000),
            retry_budget: 4,
            shape: OverlayShape::AccountMembership,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        let store = match std::env::var("MASQUERADE_STORE").ok().as_deref() {
            Some("memory") => StoreBackend::Memory,
            _ => StoreBackend::Sparql,
        };
        let shape = std::env::var("MASQUERADE_SHAPE")
            .ok()
            .and_then(|s| OverlayShape::parse(&s))
            .unwrap_or(defaults.shape);
        Self {
            http_port: env_or("MASQUERADE_HTTP_PORT", defaults.http_port),
            store,
            sparql_endpoint: std::env::var("MU_SPARQL_ENDPOINT").unwrap_or(defaults.sparql_endpoint),
            store_timeout: Duration::from_millis(env_or(
                "MASQUERADE_STORE_TIMEOUT_MS",
                defaults.store_timeout.as_millis() as u64,
            )),
            retry_budget: env_or("MASQUERADE_RETRY_BUDGET", defaults.retry_budget),
            shape,
        }
    }
}
