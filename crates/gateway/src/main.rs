//! `rpc-gateway` binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from the JSON file and environment.
//! 2. Initialise structured JSON logging.
//! 3. Build the method registry.
//! 4. Bind the listeners and serve until Ctrl-C.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rpc_gateway::{telemetry, Config, MethodRegistry, Server};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::load().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        http = cfg.http.plain.enabled.then_some(cfg.http.plain.port),
        https = cfg.http.tls.enabled.then_some(cfg.http.tls.port),
        "rpc-gateway starting"
    );

    // -----------------------------------------------------------------------
    // 3. Dispatcher
    // -----------------------------------------------------------------------
    let registry = MethodRegistry::with_builtins();

    // -----------------------------------------------------------------------
    // 4. Server
    // -----------------------------------------------------------------------
    let server = Server::bind(&cfg, Arc::new(registry))?;
    for (addr, transport) in server.local_addrs() {
        info!(%addr, transport, "bound");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
                return;
            }
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    server.run(shutdown).await
}
