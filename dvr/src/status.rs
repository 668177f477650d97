//! The `/dvr/status` document: registry, storage and queue in one snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::Registry;
use crate::storage::Storage;
use crate::transfer::{QueueEntry, TransferQueue};

#[derive(Debug, Serialize)]
pub struct StatusDocument {
    pub host: String,
    pub timestamp: i64,
    pub dvr: DvrStatus,
}

#[derive(Debug, Serialize)]
pub struct DvrStatus {
    pub servers: Vec<ServerStatus>,
    pub feed: Vec<FeedEntry>,
    pub storage: Vec<StorageStatus>,
    pub queue: Vec<QueueEntry>,
}

#[derive(Debug, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub url: String,
    pub space: String,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct FeedEntry {
    pub name: String,
    pub url: String,
    /// 0 for cameras currently without a server.
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct StorageStatus {
    pub path: String,
    pub used: u8,
    pub size: u64,
    pub free: u64,
}

impl StorageStatus {
    /// Query the archive filesystem.  `None` when it cannot be queried, in
    /// which case the status lists no storage.
    pub fn measure(storage: &Storage) -> Option<StorageStatus> {
        let usage = storage.usage().ok()?;
        Some(StorageStatus {
            path: storage.root().display().to_string(),
            used: usage.used_percent,
            size: usage.total,
            free: usage.free,
        })
    }
}

/// Build the snapshot from an already measured storage status.
pub fn snapshot(
    host: &str,
    registry: &Registry,
    storage: Option<StorageStatus>,
    queue: &TransferQueue,
    now: DateTime<Utc>,
) -> StatusDocument {
    let servers = registry
        .servers()
        .map(|s| ServerStatus {
            name: s.name.clone(),
            url: s.admin_url.clone(),
            space: format!("{} MB", s.free_space_mb),
            timestamp: s.last_seen.timestamp(),
        })
        .collect();
    let feed = registry
        .cameras()
        .map(|c| FeedEntry {
            name: c.name.clone(),
            url: c.url.clone(),
            timestamp: c.last_seen.map_or(0, |t| t.timestamp()),
        })
        .collect();
    let storage = storage.into_iter().collect();

    StatusDocument {
        host: host.to_string(),
        timestamp: now.timestamp(),
        dvr: DvrStatus {
            servers,
            feed,
            storage,
            queue: queue.status(),
        },
    }
}

/// Name of this host, as shown in the status.
pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
