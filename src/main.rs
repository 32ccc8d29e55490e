//! tcp-gateway: serve a greeting, or reverse-proxy to a downstream target.
//!
//! Features:
//! - Per-connection read/write deadlines and TCP keep-alive
//! - Layer-4 reverse proxy with dial timeout and deadline
//! - Graceful stop on SIGINT / SIGTERM
//! - Configuration via CLI arguments or TOML file

use std::sync::Arc;
use tcp_gateway::config::Config;
use tcp_gateway::{Greeting, Handler, Server, ServerError, TcpReverseProxy};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    tcp_gateway::server::install_panic_hook();

    let handler: Arc<dyn Handler> = match &config.proxy {
        Some(proxy) => {
            info!(
                listen = %config.listen,
                target_addr = %proxy.target,
                dial_timeout_ms = proxy.dial_timeout.as_millis() as u64,
                deadline_ms = proxy.deadline.as_millis() as u64,
                "Starting TCP reverse proxy"
            );
            Arc::new(
                TcpReverseProxy::new(proxy.target.clone())?
                    .with_dial_timeout(proxy.dial_timeout)
                    .with_deadline(proxy.deadline)
                    .with_keep_alive_period(proxy.keep_alive_period),
            )
        }
        None => {
            info!(listen = %config.listen, "Starting TCP greeting server");
            Arc::new(Greeting)
        }
    };

    let server = Server::builder(config.listen.clone())
        .handler(handler)
        .read_timeout(config.read_timeout)
        .write_timeout(config.write_timeout)
        .keep_alive(config.keep_alive)
        .build();

    let closer = server.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        if let Err(e) = closer.close() {
            error!(error = %e, "Failed to close listener");
        }
    });

    match server.listen_and_serve().await {
        Err(ServerError::Closed) | Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolves on the first SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
