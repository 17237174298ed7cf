use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use gantry_api::{HttpClientConfig, HttpControlPlane};
use gantry_observer::{Observer, ObserverConfig};

#[derive(Parser, Debug)]
#[command(
    name = "gantry-observer",
    version,
    about = "Watches Gantry job pods and reports their lifecycle to the control plane"
)]
struct Cli {
    /// Control-plane API endpoint, e.g. https://gantry.example.com
    #[arg(long = "api-endpoint", env = "GANTRY_API_ENDPOINT")]
    api_endpoint: String,

    /// Bearer token for control-plane API calls
    #[arg(long = "api-token", env = "GANTRY_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Label selector identifying job pods
    #[arg(long = "selector", default_value = gantry_core::labels::JOB_POD_SELECTOR)]
    selector: String,

    /// Seconds to wait after a job goes terminal before requesting cleanup
    #[arg(long = "cleanup-delay", default_value_t = 60)]
    cleanup_delay_secs: u64,

    /// Per-call timeout in seconds for control-plane API requests
    #[arg(long = "api-timeout", default_value_t = 10)]
    api_timeout_secs: u64,

    /// Log level filter (overrides GANTRY_LOG)
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

fn init_tracing(level: Option<&str>) {
    let env = level
        .map(str::to_string)
        .or_else(|| std::env::var("GANTRY_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("GANTRY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid GANTRY_METRICS_ADDR; expected host:port");
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    init_metrics();

    // Startup failures exit nonzero; after this point runtime errors are
    // logged but never fatal.
    let api = Arc::new(
        HttpControlPlane::new(HttpClientConfig {
            endpoint: cli.api_endpoint.clone(),
            token: cli.api_token.clone(),
            request_timeout: Duration::from_secs(cli.api_timeout_secs),
        })
        .context("configuring control-plane client")?,
    );

    let client = kube::Client::try_default()
        .await
        .context("connecting to the Kubernetes API")?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let cap = std::env::var("GANTRY_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1024);
    let (tx, rx) = mpsc::channel(cap);

    let watcher_handle = tokio::spawn({
        let client = client.clone();
        let selector = cli.selector.clone();
        let tx = tx.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = gantry_podwatch::run_watcher(client, selector, tx, shutdown).await {
                error!(error = ?e, "job pod watcher failed");
            }
        }
    });

    // Prime with the current state so jobs running before we started are
    // picked up immediately.
    let primed = gantry_podwatch::prime_list(&client, &cli.selector, &tx)
        .await
        .context("listing job pods")?;
    info!(count = primed, selector = %cli.selector, "initial job pod list replayed");
    drop(tx);

    let observer = Observer::new(
        api,
        ObserverConfig {
            delay_before_cleanup: Duration::from_secs(cli.cleanup_delay_secs),
        },
        shutdown.clone(),
    );
    observer.run(rx).await;

    watcher_handle.abort();
    info!("observer stopped");
    Ok(())
}
