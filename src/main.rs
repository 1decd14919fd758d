use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, warn};

use clash_board::app::{self, AppState};
use clash_board::config::Config;
use clash_board::endpoint::EndpointClient;
use clash_board::events::EventBus;
use clash_board::logs::LogStream;
use clash_board::order::OrderStore;
use clash_board::prober::DelayProber;
use clash_board::reachability::ReachabilityMonitor;
use clash_board::store::ProxyStore;

const DEFAULT_CONFIG: &str = "config.yaml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut raw_args = std::env::args();
    let arg0 = raw_args.next().unwrap_or_else(|| "clash-board".to_string());
    let program_name = std::path::Path::new(&arg0)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("clash-board")
        .to_string();
    let rest_args: Vec<String> = raw_args.collect();
    if rest_args.iter().any(|a| a == "--help" || a == "-h") {
        println!(
            "Clash Board - proxy engine dashboard\n\n\
Usage:\n  {program} [OPTIONS]\n\n\
Options:\n  --config <PATH>   config file (default ./{default})\n  -h, --help        print help and exit\n\n\
Log filter comes from RUST_LOG.",
            program = program_name,
            default = DEFAULT_CONFIG
        );
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("clash_board=info,tower_http=info")),
        )
        .init();

    let mut config_path = PathBuf::from(DEFAULT_CONFIG);
    let mut args = rest_args.into_iter();
    while let Some(arg) = args.next() {
        if let Some(v) = arg.strip_prefix("--config=") {
            config_path = PathBuf::from(v);
        } else if arg == "--config" {
            if let Some(v) = args.next() {
                config_path = PathBuf::from(v);
            }
        } else {
            warn!("ignoring unknown argument {}", arg);
        }
    }

    info!("reading configuration from {}", config_path.display());
    let (config, setup_required) = Config::load(&config_path).await?;
    if setup_required {
        warn!(
            "{} not found, using defaults for {}; create it to point at your engine",
            config_path.display(),
            config.server.identity()
        );
    }

    let events = EventBus::new();
    let endpoint = EndpointClient::with_secret(config.server.clone(), config.probe.clone())?;
    let store = ProxyStore::new(endpoint.clone(), events.clone());
    let prober = DelayProber::new(store.clone());
    let logs = LogStream::new(config.logs.clone(), events.clone());
    let order = Arc::new(OrderStore::open(&config.order_db_path())?);

    if config.logs.autostart {
        logs.connect(endpoint).await;
    }
    let _monitor = ReachabilityMonitor::spawn(
        logs.clone(),
        Duration::from_millis(config.logs.reachability_interval_ms),
    );

    {
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.refresh().await {
                error!("initial refresh failed: {}", e);
            }
        });
    }

    let app_state = Arc::new(AppState {
        store,
        prober,
        logs,
        order,
        server_id: config.server.identity(),
    });

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("clash-board listening on http://{}", config.listen);
    axum::serve(listener, app::router(app_state)).await?;
    Ok(())
}
