//! Vigil DVR – collects the recordings of the camera feed servers into one
//! dated archive.
//!
//! This binary:
//! 1. Reads configuration from `vigil.conf`
//! 2. Discovers the feed servers (mDNS and/or static URLs) and polls them
//! 3. Transfers their new recordings, one at a time
//! 4. Keeps the archive below its disk usage limit
//! 5. Runs an axum HTTP server for the status and the archive calendar

mod calendar;
mod error;
mod events;
mod fetch;
mod poller;
mod registry;
mod server;
mod state;
mod status;
mod storage;
mod transfer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use vigil_common::config::{self, Config};
use vigil_common::discovery::{self, Discover, DiscoveryHandle, PeerBrowser, StaticPeers};

use crate::events::{EventSink, LogSink};
use crate::fetch::Fetcher;
use crate::poller::{Poller, Schedule};
use crate::registry::Registry;
use crate::state::StateFile;
use crate::storage::{Housekeeping, Storage};
use crate::transfer::TransferQueue;

/// mDNS service name the DVR registers under.
const DVR_SERVICE: &str = "dvr";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config =
        config::load_or_default(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "Vigil DVR starting (store={}, listen={})",
        config.storage_root.display(),
        config.listen_addr
    );

    std::fs::create_dir_all(&config.storage_root).with_context(|| {
        format!("Cannot create storage root {}", config.storage_root.display())
    })?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::Relaxed);
        })
        .context("Cannot set Ctrl-C handler")?;
    }

    // ── core state ───────────────────────────────────────────────────
    let events: Arc<dyn EventSink> = Arc::new(LogSink);
    let now = Utc::now();

    let state_file = StateFile::new(&config.state_path);
    let mut registry = Registry::new(events.clone());
    registry.restore(&state_file.load(), now);
    let registry = Arc::new(Mutex::new(registry));

    let queue = Arc::new(Mutex::new(TransferQueue::new(
        &config.storage_root,
        config.queue_size,
        events.clone(),
    )));
    let storage = Arc::new(Storage::new(&config.storage_root, events.clone()));

    // ── discovery ────────────────────────────────────────────────────
    let (mdns, browser) = start_discovery(&config).await;
    let peers: Arc<dyn Discover> = match &browser {
        Some(browser) => browser.clone() as Arc<dyn Discover>,
        None => Arc::new(StaticPeers(config.feed_urls.clone())),
    };

    // ── background work ──────────────────────────────────────────────
    let client = fetch::build_client()?;
    let fetcher = Fetcher::new(client.clone(), &config.storage_root, events.clone());
    let worker = fetch::spawn_worker(queue.clone(), fetcher, shutdown.clone());

    let poller = Poller::new(
        client,
        &config.feed_service,
        peers,
        registry.clone(),
        queue.clone(),
        Schedule::new(now, config.check_period_secs, config.full_scan_period_secs),
        state_file,
        events.clone(),
    );
    let background = spawn_background(
        poller,
        storage.clone(),
        Housekeeping::new(config.clean_threshold),
        shutdown.clone(),
    );

    // ── start HTTP server ────────────────────────────────────────────
    let host = status::hostname();
    events.event("SERVICE", DVR_SERVICE, "START", &format!("ON {host}"));

    let app_state = server::AppState {
        host,
        registry,
        queue,
        storage,
        events,
    };
    if let Err(e) = server::run(
        app_state,
        &config.listen_addr,
        config.public_dir.clone(),
        shutdown.clone(),
    )
    .await
    {
        tracing::error!("HTTP server error: {e:#}");
    }

    // Wait for the background tasks (they stop on shutdown)
    shutdown.store(true, Ordering::Relaxed);
    let _ = tokio::join!(worker, background);

    if let Some(browser) = browser {
        browser.shutdown();
    }
    if let Some(handle) = mdns {
        handle.shutdown();
    }
    info!("Vigil DVR stopped");

    Ok(())
}

/// Register the DVR on mDNS and browse for feed servers.  Any failure falls
/// back to the static feed URLs only.
async fn start_discovery(config: &Config) -> (Option<DiscoveryHandle>, Option<Arc<PeerBrowser>>) {
    if std::env::var_os("VIGIL_DISABLE_MDNS").is_some() {
        info!("mDNS disabled, using {} static feed URL(s)", config.feed_urls.len());
        return (None, None);
    }

    let port = config.listen_port();
    let registered =
        tokio::task::spawn_blocking(move || discovery::register(DVR_SERVICE, port)).await;
    let handle = match registered {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            warn!("mDNS registration failed: {e:#}");
            return (None, None);
        }
        Err(e) => {
            warn!("mDNS registration task failed: {e}");
            return (None, None);
        }
    };
    info!("mDNS: registered as {}", handle.instance_name());

    match handle.browse(&config.feed_service, config.feed_urls.clone()) {
        Ok(browser) => (Some(handle), Some(Arc::new(browser))),
        Err(e) => {
            warn!("mDNS browse failed: {e:#}");
            (Some(handle), None)
        }
    }
}

/// The periodic driver of storage housekeeping and feed discovery.
fn spawn_background(
    poller: Poller,
    storage: Arc<Storage>,
    mut housekeeping: Housekeeping,
    shutdown: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            // Deleting whole days can take a while.
            let storage_job = storage.clone();
            match tokio::task::spawn_blocking(move || {
                housekeeping.run(&storage_job, Local::now());
                housekeeping
            })
            .await
            {
                Ok(h) => housekeeping = h,
                Err(e) => {
                    warn!("Storage housekeeping failed: {e}");
                    break;
                }
            }

            poller.tick(Utc::now()).await;
        }
        info!("Background tasks stopped");
    })
}
