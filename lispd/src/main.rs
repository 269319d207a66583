#![forbid(unsafe_code)]

mod adapters;
mod config;
mod error;

use clap::Parser;
use lisp_core::{
    EgressEngine, EgressEngineConfig, EidSnapshot, LoggingControlPlane, MapCacheStore, Metrics, SwappableEidDb,
};
use std::path::PathBuf;
use std::rc::Rc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "LISP mobile-node ITR data plane")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, value_name = "FILE", default_value = "config/lispd.toml")]
    config: PathBuf,
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let cfg = match config::load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    info!(?cfg.local_rloc, eid_prefixes = cfg.local_eid_prefixes.len(), "configuration loaded");

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("failed to build runtime");
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        if let Err(err) = run(cfg).await {
            error!(%err, "lispd exited with error");
            std::process::exit(1);
        }
    });
}

async fn run(cfg: config::Config) -> error::Result<()> {
    let prefixes = config::parse_local_eid_prefixes(&cfg)?;
    let eid_db = Rc::new(SwappableEidDb::new(EidSnapshot::from_prefixes(&prefixes)));

    let control_plane = Rc::new(LoggingControlPlane);
    let entry_config = lisp_core::EntryConfig::from(&cfg.cache);
    let metrics = Rc::new(Metrics::new(init_metrics()));
    let store = MapCacheStore::new(control_plane, entry_config, metrics.clone());

    let sink = Rc::new(adapters::RawIpSink::new()?);

    // Feeding outbound packets into the engine (a tun device, nftables queue,
    // or similar OS integration) is an external collaborator outside this
    // crate's scope; wiring it up here is left to the deployment.
    let _engine = Rc::new(EgressEngine::new(
        store,
        eid_db,
        sink,
        metrics,
        EgressEngineConfig { local_rloc: cfg.local_rloc, proxy_etr: cfg.proxy_etr, instance_id: cfg.instance_id },
    ));

    info!("lispd egress engine initialized, awaiting shutdown signal");
    tokio::signal::ctrl_c().await.map_err(error::DaemonError::Io)?;
    info!("received shutdown signal, exiting");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();
}

/// Installs a global meter provider and returns the daemon's meter. No
/// exporter is wired up here -- a production deployment would add a
/// Prometheus or OTLP reader the way the stack's HTTP services do; this
/// daemon's data-plane loop has no HTTP surface of its own to host one.
fn init_metrics() -> opentelemetry::metrics::Meter {
    let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder().build();
    opentelemetry::global::set_meter_provider(provider);
    opentelemetry::global::meter("lispd")
}
