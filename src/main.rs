//! Terse Gateway entry point.
//!
//! Loads the model named by `TERSE_MODEL`, initializes every adapter and
//! serves HTTP (and RPC when `TERSE_RPC_ADDR` is set) until SIGINT/SIGTERM.
//! SIGHUP reloads the model file in place.
//!
//! Exits non-zero when the model is invalid, an adapter fails to connect or
//! the HTTP server stops on its own.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use terse_gateway::shutdown::{install_reload_handler, install_signal_handlers, wait_for_exit};
use terse_gateway::{rpc, transport, Config, DriverFactory, Gateway, Model};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let version = env!("CARGO_PKG_VERSION");
    info!("Terse Gateway v{version} starting...");

    std::panic::set_hook(Box::new(|info| {
        eprintln!("[PANIC] {}", info);
    }));

    let config = Config::from_env()?;
    let model = Model::from_path(&config.model_path)
        .with_context(|| format!("failed to load model {}", config.model_path.display()))?;

    let gateway = Gateway::start(model, Arc::new(DriverFactory), &config)
        .await
        .context("gateway failed to start")?;
    info!("Gateway initialized. Ready to accept requests...");

    let controller = Arc::clone(gateway.shutdown());
    install_signal_handlers(Arc::clone(&controller));
    install_reload_handler(gateway.clone(), config.model_path.clone());

    // Bind before spawning so an unavailable address fails startup.
    let http_listener = TcpListener::bind(config.http.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind_addr()))?;
    let mut http = tokio::spawn(transport::serve_on(
        http_listener,
        gateway.clone(),
        config.http.clone(),
    ));

    let rpc = match &config.rpc.addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            Some(tokio::spawn(rpc::serve_on(listener, gateway.clone())))
        }
        None => None,
    };

    let (running_http, failure) = match wait_for_exit(&controller, &mut http).await {
        None => (Some(http), None),
        Some(Ok(())) => (None, None),
        Some(Err(e)) => {
            error!("HTTP server failed: {e:#}");
            (None, Some(e.context("HTTP server failed")))
        }
    };

    controller
        .graceful_shutdown(&gateway, async move {
            if let Some(http) = running_http {
                match http.await {
                    Ok(Err(e)) => error!("HTTP server error: {e:#}"),
                    Err(e) => error!("HTTP server task failed: {e}"),
                    Ok(Ok(())) => {}
                }
            }
            if let Some(rpc) = rpc {
                match rpc.await {
                    Ok(Err(e)) => error!("RPC server error: {e:#}"),
                    Err(e) => error!("RPC server task failed: {e}"),
                    Ok(Ok(())) => {}
                }
            }
        })
        .await;

    let metrics = gateway.metrics().snapshot();
    info!(
        queries = metrics.queries_total,
        success_rate = %format!("{:.1}%", metrics.success_rate()),
        avg_ms = %format!("{:.1}", metrics.avg_query_time_ms()),
        cache_hit_rate = %format!("{:.1}%", metrics.cache_hit_rate()),
        "Gateway shutdown complete"
    );

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize tracing subscriber with stderr output.
fn init_logging() {
    let filter = std::env::var("RUST_LOG")
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new("warn,terse_gateway=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
