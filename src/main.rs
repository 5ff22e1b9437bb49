mod aggregator;
mod api;
mod config;
mod error;
mod model;
mod otlp;
mod ws;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aggregator::Aggregator;
use config::Args;

/// Launches the OTLP gRPC receiver and the HTTP/WebSocket API concurrently
/// against one shared aggregator, and keeps them alive together: a signal or
/// either side exiting (including a bind failure) triggers graceful shutdown
/// — refuse new connections, drain in flight, stop — of the other, and we
/// join both before returning.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depviz_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    args.validate()?;
    let aggregator = Arc::new(Aggregator::new(args.window_sec, args.retention_buckets));

    // Shared shutdown signal: notified once, either by ctrl_c or by whichever
    // server exits first, so the other one drains and stops too rather than
    // being hard-dropped when the runtime tears down.
    let shutdown = Arc::new(Notify::new());

    let otlp_aggregator = aggregator.clone();
    let otlp_addr = args.otlp_addr.clone();
    let otlp_shutdown = shutdown.clone();
    let mut otlp_task = tokio::spawn(async move {
        if let Err(e) = otlp::run_otlp_server(otlp_aggregator, &otlp_addr, async move {
            otlp_shutdown.notified().await;
        })
        .await
        {
            error!("OTLP server error: {}", e);
        }
    });

    let http_aggregator = aggregator.clone();
    let http_addr = args.http_addr.clone();
    let http_shutdown = shutdown.clone();
    let mut http_task = tokio::spawn(async move {
        if let Err(e) = ws::run_http_server(http_aggregator, &http_addr, async move {
            http_shutdown.notified().await;
        })
        .await
        {
            error!("HTTP server error: {}", e);
        }
    });

    info!("depviz-server up: otlp={} http={}", args.otlp_addr, args.http_addr);

    tokio::select! {
        res = &mut otlp_task => {
            log_task_exit("OTLP", res);
            shutdown.notify_waiters();
            let _ = http_task.await;
        }
        res = &mut http_task => {
            log_task_exit("HTTP", res);
            shutdown.notify_waiters();
            let _ = otlp_task.await;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            shutdown.notify_waiters();
            let _ = tokio::join!(otlp_task, http_task);
        }
    }

    Ok(())
}

fn log_task_exit(name: &str, result: Result<(), JoinError>) {
    match result {
        Ok(()) => info!("{} server exited, shutting down", name),
        Err(e) => error!("{} server task panicked: {}", name, e),
    }
}
