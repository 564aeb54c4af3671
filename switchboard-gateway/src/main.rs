//! Gateway binary: argument parsing, logging setup, serve loop, and
//! graceful shutdown with a bounded drain.

use clap::Parser;
use std::net::SocketAddr;

use switchboard_gateway::{config::Config, server};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "switchboard.toml")]
    config: String,

    /// Override the listener port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the listener host.
    #[arg(long)]
    host: Option<String>,

    /// Log filter (tracing env-filter syntax).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        )
        .init();

    let mut config = Config::load(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let (state, app) = server::create_server(config).await?;

    let addr = SocketAddr::new(state.config.server.host.parse()?, state.config.server.port);
    tracing::info!("switchboard gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Listener is closed; drain in-flight work and stop background tasks.
    server::shutdown(&state).await;
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
