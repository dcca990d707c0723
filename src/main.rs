use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use masquerade::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_default();
    fmt().with_env_filter(filter).init();

    let config = Config::from_env();
    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "masquerade",
        "masquerade starting: RUST_LOG='{}', http_port={}, store={:?}, shape={}, endpoint='{}'",
        rust_log,
        config.http_port,
        config.store,
        config.shape.label(),
        config.sparql_endpoint
    );

    masquerade::server::run(config).await
}
