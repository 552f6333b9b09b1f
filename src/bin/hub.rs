use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hwmon_engine::{
    actors::{CycleEvent, HostHandle},
    config::{Config, load_connector_file, read_config_file},
    connector::Connector,
    extension::ExtensionRegistry,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: PathBuf,

    /// Run a single cycle per host, print the reports and exit
    #[arg(long)]
    once: bool,
}

fn init() {
    dotenv::dotenv().ok();
    let level = std::env::var("HWMON_LOG")
        .ok()
        .and_then(|level| level.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::INFO);

    let filter = filter::Targets::new().with_targets(vec![("hwmon_engine", level), ("hub", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let base = args.file.parent().unwrap_or(Path::new("."));
    let connectors = load_connectors(&config, base)?;
    let registry = Arc::new(ExtensionRegistry::with_defaults());
    debug!("{} connector(s), {registry:?}", connectors.len());

    let (event_tx, event_rx) = broadcast::channel(64);
    let handles: Vec<HostHandle> = config
        .hosts
        .iter()
        .cloned()
        .map(|host| HostHandle::spawn(host, &connectors, registry.clone(), event_tx.clone()))
        .collect();

    if args.once {
        for handle in &handles {
            let report = handle.run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            handle.shutdown().await?;
        }
        return Ok(());
    }

    tokio::spawn(log_cycles(event_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    for handle in &handles {
        handle.cancel_cycle();
        if let Err(e) = handle.shutdown().await {
            error!("{}: {e:#}", handle.hostname);
        }
    }

    Ok(())
}

fn load_connectors(config: &Config, base: &Path) -> anyhow::Result<Vec<Arc<Connector>>> {
    config
        .connectors
        .iter()
        .map(|path| {
            let path = if path.is_relative() { base.join(path) } else { path.clone() };
            load_connector_file(&path).map(Arc::new)
        })
        .collect()
}

async fn log_cycles(mut events: broadcast::Receiver<CycleEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let report = &event.report;
                info!(
                    "{}: {} connector(s) applicable, {}/{} monitor(s) present, {} diagnostic(s)",
                    event.hostname,
                    report.applicable_connectors.len(),
                    report.present_monitor_count,
                    report.monitor_count,
                    report.diagnostics.len()
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("missed {skipped} cycle event(s)");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
