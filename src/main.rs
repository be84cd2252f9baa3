//! Runplane Server
//!
//! Entry point for the distributed agent-run control plane.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::sync::Arc;

use dotenvy::dotenv;
use tracing::info;

use runplane::config::AppConfig;
use runplane::executor::worker::EchoInvoker;
use runplane::{server, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (M-LOG-STRUCTURED)
    telemetry::init();

    // Load .env (if present)
    let _ = dotenv();

    let config = match AppConfig::load() {
        Ok(config) => config.into_shared(),
        Err(err) => {
            eprintln!("Configuration error: {err}");
            std::process::exit(1);
        }
    };

    info!(
        name: "config.loaded",
        persistence = %config.persistence.provider,
        coordination = %config.coordination.provider,
        "configuration loaded"
    );

    // The echo invoker stands in for the external model integration.
    server::start_server(config, Arc::new(EchoInvoker)).await
}
