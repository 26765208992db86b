use log::{error, info};
use loghub_utils::config::Config;
use loghub_utils::log::{init_logger, LogTarget};
use loghubd::endpoints::control::ControlEndpoint;
use loghubd::endpoints::egress::EgressEndpoint;
use loghubd::endpoints::ingest::IngestEndpoint;
use loghubd::store::{LogStore, StoreOptions};
use loghubd::tags::TagRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    init_logger(&config, "daemon").unwrap();

    info!(target: LogTarget::Daemon.as_str(), "loghubd starting...");

    let store = Arc::new(LogStore::new(StoreOptions::from(&config)));
    let tags = Arc::new(TagRegistry::open(&config.loghub_dirs.tag_file()).unwrap());
    info!(
        target: LogTarget::Daemon.as_str(),
        "loaded {} event tags from {}",
        tags.len(),
        config.loghub_dirs.tag_file().display(),
    );

    let shutdown_flag = Arc::new(AtomicBool::new(false));

    let ingest = IngestEndpoint::bind(
        &config.loghub_dirs.ingest_socket(),
        store.clone(),
        shutdown_flag.clone(),
    )
    .unwrap();

    let egress = EgressEndpoint::bind(
        &config.loghub_dirs.egress_socket(),
        store.clone(),
        shutdown_flag.clone(),
    )
    .unwrap();

    let control = ControlEndpoint::bind(
        &config.loghub_dirs.control_socket(),
        store.clone(),
        tags.clone(),
        shutdown_flag.clone(),
    )
    .unwrap();

    // Handle interrupt
    let interrupt_shutdown_flag = shutdown_flag.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.unwrap();
        info!(target: LogTarget::Daemon.as_str(), "Received interrupt, shutting down...");
        interrupt_shutdown_flag.store(true, Ordering::Relaxed);
    });

    let run_result = tokio::try_join!(
        tokio::spawn(async move {
            ingest.run().await;
        }),
        tokio::spawn(async move {
            egress.run().await;
        }),
        tokio::spawn(async move {
            control.run().await;
        }),
    );

    match run_result {
        Ok(_) => {
            info!(target: LogTarget::Daemon.as_str(), "Shutdown complete");
        }
        Err(e) => {
            shutdown_flag.store(true, Ordering::Relaxed);
            error!(target: LogTarget::Daemon.as_str(), "{}", e);
            std::process::exit(1);
        }
    }
}
