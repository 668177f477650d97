//! Transfer driver – runs the transfers the queue hands out, one at a time.
//!
//! A single worker task owns this loop, which is what guarantees that at
//! most one transfer is active.  Every tick it evicts stale cache entries
//! and, if the head of the queue is idle, starts it; after each transfer
//! it immediately moves on to the next one.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{fatal, DvrError};
use crate::events::EventSink;
use crate::transfer::{TransferJob, TransferQueue};

/// Status reported for transfers that failed before any HTTP response.
const CLIENT_FAILURE: u16 = 500;

/// User-Agent sent to the feed servers.
pub const USER_AGENT: &str = concat!("vigil-dvr/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client shared by the poller and the fetcher.  Redirects
/// are followed before the caller ever sees a status.
pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(Duration::from_secs(60))
        .build()
        .context("Cannot build HTTP client")
}

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    root: PathBuf,
    events: Arc<dyn EventSink>,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, root: impl Into<PathBuf>, events: Arc<dyn EventSink>) -> Self {
        Self {
            client,
            root: root.into(),
            events,
        }
    }

    /// Run one transfer to completion.  Returns the final HTTP status, or
    /// 500 if the transfer could not complete.
    pub async fn fetch(&self, job: &TransferJob) -> u16 {
        let url = job.url();
        let mut request = self.client.get(&url);
        if job.offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", job.offset));
        }

        debug!("GET {} (resume from {} bytes)", url, job.offset);
        let mut response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                self.events.trace(&url, &e.to_string());
                return CLIENT_FAILURE;
            }
        };
        let status = response.status().as_u16();

        let destination = self.root.join(&job.path);
        let mut file = match open_destination(&destination, status, job.offset).await {
            Ok(Some(file)) => file,
            Ok(None) => {
                self.events.trace(&url, &format!("HTTP error {status}"));
                return status;
            }
            Err(e) => {
                self.events
                    .trace(&destination.display().to_string(), &format!("cannot open: {e}"));
                return CLIENT_FAILURE;
            }
        };

        // Stream the body in chunks instead of holding it all in memory.
        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    if let Err(e) = file.write_all(&bytes).await {
                        self.events
                            .trace(&destination.display().to_string(), &format!("write error: {e}"));
                        return CLIENT_FAILURE;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.events.trace(&url, &format!("transfer interrupted: {e}"));
                    return CLIENT_FAILURE;
                }
            }
        }
        if let Err(e) = file.flush().await {
            self.events
                .trace(&destination.display().to_string(), &format!("flush error: {e}"));
            return CLIENT_FAILURE;
        }
        status
    }
}

/// Open the local file for a response with the given status.
///
/// 200: the body is the whole file, rewrite from scratch.  206: the body
/// starts at `offset`, keep what is already there.  Anything else: there
/// is nothing to write.
async fn open_destination(path: &Path, status: u16, offset: u64) -> std::io::Result<Option<File>> {
    match status {
        200 => {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .await?;
            Ok(Some(file))
        }
        206 => {
            let mut file = OpenOptions::new().write(true).open(path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            Ok(Some(file))
        }
        _ => Ok(None),
    }
}

/// Run queued transfers back to back until the queue has nothing left to
/// start.  Returns how many transfers ran.
pub async fn drive(queue: &Mutex<TransferQueue>, fetcher: &Fetcher) -> Result<usize, DvrError> {
    let mut count = 0;
    loop {
        let job = match queue.lock().await.start_next(Utc::now())? {
            Some(job) => job,
            None => return Ok(count),
        };
        let status = fetcher.fetch(&job).await;
        queue.lock().await.finish(job.id, status, Utc::now())?;
        count += 1;
    }
}

/// Spawn the transfer worker.  Runs until `shutdown` is set.
pub fn spawn_worker(
    queue: Arc<Mutex<TransferQueue>>,
    fetcher: Fetcher,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            queue.lock().await.background(Utc::now());
            match drive(&queue, &fetcher).await {
                Ok(0) => {}
                Ok(ran) => debug!(
                    "{ran} transfer(s) done, {} waiting",
                    queue.lock().await.pending_len()
                ),
                Err(e) => fatal(&e),
            }
        }
        info!("Transfer worker stopped");
    })
}
