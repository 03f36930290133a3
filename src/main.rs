use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use duoproxy::broadcast::BroadcastFabric;
use duoproxy::cli::Args;
use duoproxy::monitor::{self, AppState};
use duoproxy::registry::ConnectionRegistry;
use duoproxy::{config, dispatcher};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "duoproxy starting");

    let policy = config::load_admission_policy(&args.allow_list).unwrap_or_else(|e| {
        eprintln!("FATAL: {e}");
        std::process::exit(1);
    });
    let policy = Arc::new(policy);

    let broadcast = BroadcastFabric::spawn();
    let registry = ConnectionRegistry::new(Arc::clone(&broadcast));

    let listen_addr = format!("0.0.0.0:{}", args.listen_port);
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .unwrap_or_else(|e| {
            eprintln!("FATAL: failed to bind {listen_addr}: {e}");
            std::process::exit(1);
        });
    info!(addr = %listen_addr, "dual-protocol listener bound");

    let dispatcher_task = tokio::spawn(dispatcher::run(listener, Arc::clone(&registry), Arc::clone(&policy)));

    let monitor_addr = format!("0.0.0.0:{}", args.monitor_port);
    let monitor_listener = tokio::net::TcpListener::bind(&monitor_addr)
        .await
        .unwrap_or_else(|e| {
            eprintln!("FATAL: failed to bind {monitor_addr}: {e}");
            std::process::exit(1);
        });
    info!(addr = %monitor_addr, "monitoring surface bound");

    let state = AppState {
        registry: Arc::clone(&registry),
        broadcast: Arc::clone(&broadcast),
    };
    let router = monitor::build_router(state, args.dashboard_dir.clone());

    let monitor_task = tokio::spawn(async move {
        axum::serve(monitor_listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .expect("monitoring server error");
    });

    tokio::select! {
        _ = dispatcher_task => {
            info!("dispatcher loop exited unexpectedly");
        }
        _ = monitor_task => {
            info!("monitoring server shut down");
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
