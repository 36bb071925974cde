use std::sync::Arc;

use prometheus::Registry;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tg_wireprobe::config::{LogFormat, ProbeConfig, ServerConfig};
use tg_wireprobe::hub::LogHub;
use tg_wireprobe::metrics::register_metrics;
use tg_wireprobe::server::{bind_and_serve, AppState};
use tg_wireprobe::session::Session;

/// Prints helpful configuration documentation.
fn print_config_help() {
    eprintln!("Optional environment variables:");
    eprintln!("  LISTEN_ADDR             - Control API address (default: 0.0.0.0:8080)");
    eprintln!("  LOG_FORMAT              - Process log format: text or json (default: text)");
    eprintln!("  PROBE_CONFIG_FILE       - YAML file with the initial probe configuration");
    eprintln!("  LOG_INTAKE_CAPACITY     - Log hub intake queue size (default: 100)");
    eprintln!("  LOG_SUBSCRIBER_CAPACITY - Per-stream log queue size (default: 10)");
    eprintln!("  SSE_HEARTBEAT           - Idle log stream ping interval (default: 30s)");
    eprintln!("  METRIC_NAMESPACE        - Prometheus metric namespace (default: tg_wireprobe)");
    eprintln!("  RUST_LOG                - Log filter (default: tg_wireprobe=info)");
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tg_wireprobe=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let server_config = match ServerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}\n", e);
            print_config_help();
            std::process::exit(1);
        }
    };
    init_tracing(server_config.log_format);

    let registry = Registry::new();
    register_metrics(&registry)?;

    let probe_config = match &server_config.probe_config_file {
        Some(path) => {
            let config = ProbeConfig::from_yaml_file(path)?;
            info!(path = %path.display(), "Loaded probe configuration");
            if let Err(e) = config.validate() {
                warn!(error = %e, "Probe configuration is incomplete; set it through the API before starting");
            }
            config
        }
        None => ProbeConfig::default(),
    };

    let hub = Arc::new(LogHub::new(
        server_config.log_intake_capacity,
        server_config.log_subscriber_capacity,
    ));
    hub.start();

    let session = Arc::new(Session::new(probe_config, hub.sink()));
    let state = Arc::new(AppState {
        session: session.clone(),
        hub,
        registry,
        heartbeat: server_config.sse_heartbeat,
    });

    info!(
        addr = %server_config.listen_addr,
        intake = server_config.log_intake_capacity,
        per_subscriber = server_config.log_subscriber_capacity,
        "Starting tg_wireprobe"
    );
    bind_and_serve(server_config.listen_addr, state, shutdown_signal()).await?;

    if let Ok(handle) = session.stop() {
        let _ = handle.await;
    }
    info!("Exiting");
    Ok(())
}
