//! baton-proxy - layer-7 reverse proxy and load balancer
//!
//! Loads the JSON configuration, starts every binding and the passive health
//! monitor, then runs until interrupted and shuts everything down with a
//! bounded grace period.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use baton_proxy::bind::Binding;
use baton_proxy::config::{Config, CONF_FILE_NAME};
use baton_proxy::health::HealthMonitor;
use baton_proxy::session::SessionAffinity;
use baton_proxy::{logger, NAME, VERSION};

#[derive(Parser, Debug)]
#[command(name = "baton-proxy")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = CONF_FILE_NAME, env = "BATON_CONF")]
    conf: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the process-wide crypto provider before any TLS operation.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let args = Args::parse();

    // A config failure must reach the console even though the subscriber is
    // only configured afterwards (the debug flag lives in the config).
    let config = match Config::load(&args.conf) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error during initialization from file: {err:#}");
            std::process::exit(1);
        }
    };

    logger::init(config.global.logger.enable_debug);

    info!("starting {} v{}", NAME, VERSION);
    info!(config = %args.conf.display(), bindings = config.settings.bindings.len(), "configuration loaded");

    let affinity = Arc::new(SessionAffinity::from_config(
        &config.settings.session_persistence_details,
    ));

    let mut bindings: Vec<Arc<Binding>> = Vec::new();
    for bind_config in &config.settings.bindings {
        match Binding::from_config(bind_config, affinity.clone()) {
            Ok(binding) => bindings.push(binding),
            // One broken binding must not keep the others from serving.
            Err(err) => error!(address = %bind_config.address, error = %err, "error initializing binding"),
        }
    }

    let monitor = HealthMonitor::start(config.health_check_interval(), bindings.clone()).await;

    for binding in &bindings {
        if let Err(err) = binding.start() {
            error!(error = %err, "error during listener start");
        }
    }

    signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    for binding in &bindings {
        binding.stop().await;
    }
    monitor.stop();

    info!("shutdown complete");
    Ok(())
}
