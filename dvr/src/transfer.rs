//! Transfer queue – decides which recordings must be fetched from the
//! feed servers and in which order.
//!
//! Transfers are serialized: at most one is active at any time, always the
//! head of the pending queue.  Finished transfers move to a small cache of
//! recent outcomes so that the same file announced again by the next scan
//! is recognized without touching the filesystem.
//!
//! Both sides are bounded.  When the pending side is full a notification
//! is dropped: the feed server will announce the file again on a later
//! scan, so nothing is lost, only delayed.
//!
//! This type does not do any network I/O: [`TransferQueue::start_next`]
//! hands out a [`TransferJob`] and [`TransferQueue::finish`] takes back
//! its outcome (see `fetch.rs` for the driver).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::DvrError;
use crate::events::EventSink;

/// How long a finished transfer stays in the cache (seconds).
pub const RETENTION_SECS: i64 = 600;

/// A transfer longer than this is reported as slow (seconds).
const SLOW_SECS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Active,
    Done,
    Failed,
}

impl TransferState {
    /// Label used in the status document (none for pending items).
    pub fn label(self) -> Option<&'static str> {
        match self {
            TransferState::Pending => None,
            TransferState::Active => Some("active"),
            TransferState::Done => Some("done"),
            TransferState::Failed => Some("failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferItem {
    pub id: u64,
    /// Base URL of the feed server.
    pub feed: String,
    /// Path relative to the archive root.
    pub path: String,
    /// Size announced by the feed server.
    pub size: u64,
    /// Byte offset to resume from (0 = fetch the whole file).
    pub offset: u64,
    pub state: TransferState,
    /// When the item was queued, started, or finished (latest).
    pub updated: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
}

/// What the driver needs to run one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub id: u64,
    pub feed: String,
    pub path: String,
    pub offset: u64,
}

impl TransferJob {
    pub fn url(&self) -> String {
        format!("{}/recording/{}", self.feed, self.path)
    }
}

/// Outcome of [`TransferQueue::notify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notified {
    /// The path tries to escape the archive.
    Rejected,
    /// The local copy is already complete.
    UpToDate,
    /// The file is being transferred right now.
    InFlight,
    /// Already queued; the announced size was updated.
    Coalesced,
    /// A new transfer was queued.
    Queued,
    /// The queue is full; the file will be picked up on a later scan.
    Dropped,
}

impl Notified {
    /// A file we did not have: worth scanning the feed servers again soon.
    pub fn wants_rescan(self) -> bool {
        matches!(self, Notified::Queued | Notified::Dropped)
    }
}

/// One line of the queue status.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub feed: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<&'static str>,
}

pub struct TransferQueue {
    root: PathBuf,
    capacity: usize,
    /// Pending and active transfers, oldest first.  Only the head may be
    /// active.
    pending: VecDeque<TransferItem>,
    /// Finished transfers, oldest first.
    recent: VecDeque<TransferItem>,
    next_id: u64,
    events: Arc<dyn EventSink>,
}

impl TransferQueue {
    pub fn new(root: impl Into<PathBuf>, capacity: usize, events: Arc<dyn EventSink>) -> Self {
        Self {
            root: root.into(),
            capacity: capacity.max(1),
            pending: VecDeque::with_capacity(capacity),
            recent: VecDeque::with_capacity(capacity),
            next_id: 1,
            events,
        }
    }

    /// Number of transfers queued or active.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn find_pending(&self, path: &str) -> Option<&TransferItem> {
        self.pending.iter().find(|item| item.path == path)
    }

    pub fn find_recent(&self, path: &str) -> Option<&TransferItem> {
        self.recent.iter().rev().find(|item| item.path == path)
    }

    /// A feed server reports that `path`, `size` bytes long, is available.
    /// Decide whether it must be transferred.
    pub fn notify(&mut self, feed: &str, path: &str, size: u64, now: DateTime<Utc>) -> Notified {
        if path.contains("..") || Path::new(path).is_absolute() {
            self.events.trace(path, "rejected: path escapes the archive");
            return Notified::Rejected;
        }

        // The directory tree must exist before any write, whatever we
        // decide below.
        let destination = self.root.join(path);
        if let Some(parent) = destination.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                self.events
                    .trace(&parent.display().to_string(), &format!("cannot create directory: {e}"));
            }
        }

        // Transferred recently?
        let cached = match self.find_recent(path) {
            Some(item) if item.state == TransferState::Done && item.size == size => {
                return Notified::UpToDate;
            }
            Some(_) => true,
            None => false,
        };

        // Already queued?
        if let Some(item) = self.pending.iter_mut().find(|item| item.path == path) {
            return match item.state {
                // A different size means the file grew while we fetch it:
                // a later scan will pick up the rest.
                TransferState::Active => Notified::InFlight,
                _ => {
                    // A smaller file was recreated: its old bytes are stale.
                    if size < item.size {
                        item.offset = 0;
                    }
                    item.size = size;
                    Notified::Coalesced
                }
            };
        }

        // Nothing in memory: the local file is the reference (e.g. after
        // a restart).
        let local_len = std::fs::metadata(&destination).ok().map(|m| m.len());
        if !cached && local_len == Some(size) {
            return Notified::UpToDate;
        }

        if self.pending.len() >= self.capacity {
            debug!("Transfer queue full, ignoring {path} for now");
            return Notified::Dropped;
        }

        // Resume a shorter local copy.  A longer one means the remote file
        // was recreated: start over.
        let offset = match local_len {
            Some(len) if len < size => len,
            _ => 0,
        };

        let id = self.next_id;
        self.next_id += 1;
        self.pending.push_back(TransferItem {
            id,
            feed: feed.to_string(),
            path: path.to_string(),
            size,
            offset,
            state: TransferState::Pending,
            updated: now,
            started: None,
        });
        Notified::Queued
    }

    /// Activate the head of the queue, unless it is already active.
    pub fn start_next(&mut self, now: DateTime<Utc>) -> Result<Option<TransferJob>, DvrError> {
        let Some(item) = self.pending.front_mut() else {
            return Ok(None);
        };
        match item.state {
            TransferState::Active => Ok(None),
            TransferState::Pending => {
                item.state = TransferState::Active;
                item.started = Some(now);
                item.updated = now;
                Ok(Some(TransferJob {
                    id: item.id,
                    feed: item.feed.clone(),
                    path: item.path.clone(),
                    offset: item.offset,
                }))
            }
            state => Err(DvrError::Invariant(format!(
                "{} is {state:?} at the head of the pending queue",
                item.path
            ))),
        }
    }

    /// Record the outcome of the active transfer `id`.  `status` is the
    /// final HTTP status, or 500 when the request itself failed.
    pub fn finish(&mut self, id: u64, status: u16, now: DateTime<Utc>) -> Result<(), DvrError> {
        match self.pending.front() {
            Some(item) if item.id == id && item.state == TransferState::Active => {}
            Some(item) => {
                return Err(DvrError::Invariant(format!(
                    "completion of transfer #{id} but head is #{} ({:?})",
                    item.id, item.state
                )))
            }
            None => {
                return Err(DvrError::Invariant(format!(
                    "completion of transfer #{id} with an empty queue"
                )))
            }
        }
        let Some(mut item) = self.pending.pop_front() else {
            return Err(DvrError::Invariant("queue emptied under us".into()));
        };

        if (200..300).contains(&status) {
            let lapsed = (now - item.started.unwrap_or(now)).num_seconds();
            self.events.event(
                "TRANSFER",
                "dvr",
                "COMPLETE",
                &format!("FOR FILE {} at {}{}", item.path, item.feed, elapsed_note(lapsed)),
            );
            item.state = TransferState::Done;
        } else {
            self.events.event(
                "TRANSFER",
                "dvr",
                "FAILED",
                &format!("CODE {status} FOR FILE {} at {}", item.path, item.feed),
            );
            item.state = TransferState::Failed;
        }
        item.updated = now;

        if self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(item);
        Ok(())
    }

    /// Periodic housekeeping: evict old entries from the cache.
    pub fn background(&mut self, now: DateTime<Utc>) {
        let deadline = now - TimeDelta::seconds(RETENTION_SECS);
        while self.recent.front().is_some_and(|item| item.updated < deadline) {
            self.recent.pop_front();
        }
    }

    /// Every known transfer in FIFO order: the cache, then the queue.
    pub fn status(&self) -> Vec<QueueEntry> {
        self.recent
            .iter()
            .chain(self.pending.iter())
            .map(|item| QueueEntry {
                feed: item.feed.clone(),
                path: item.path.clone(),
                state: item.state.label(),
            })
            .collect()
    }
}

/// Suffix describing how long a transfer took: nothing when fast.
pub fn elapsed_note(secs: i64) -> String {
    if secs > SLOW_SECS {
        " (slow)".to_string()
    } else if secs > 1 {
        format!(" ({secs}s)")
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;

    const FEED: &str = "http://camA:8080";
    const PATH: &str = "2024/05/01/10-cam1:00.mp4";

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn queue(capacity: usize) -> (TransferQueue, tempfile::TempDir, Arc<MemorySink>) {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        (TransferQueue::new(dir.path(), capacity, sink.clone()), dir, sink)
    }

    fn active_count(q: &TransferQueue) -> usize {
        q.pending
            .iter()
            .filter(|i| i.state == TransferState::Active)
            .count()
    }

    #[test]
    fn test_notify_creates_directories() {
        let (mut q, dir, _) = queue(16);
        assert_eq!(q.notify(FEED, PATH, 1000, t(0)), Notified::Queued);
        assert!(dir.path().join("2024/05/01").is_dir());
    }

    #[test]
    fn test_traversal_is_rejected() {
        let (mut q, dir, _) = queue(16);
        assert_eq!(q.notify(FEED, "../etc/passwd", 10, t(0)), Notified::Rejected);
        assert_eq!(q.notify(FEED, "2024/../../x.mp4", 10, t(0)), Notified::Rejected);
        assert_eq!(q.notify(FEED, "/etc/passwd", 10, t(0)), Notified::Rejected);
        assert_eq!(q.pending_len(), 0);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_duplicate_notification_is_idempotent() {
        let (mut q, _dir, _) = queue(16);
        assert_eq!(q.notify(FEED, PATH, 1000, t(0)), Notified::Queued);
        assert_eq!(q.notify(FEED, PATH, 1000, t(0)), Notified::Coalesced);
        assert_eq!(q.pending_len(), 1);
    }

    #[test]
    fn test_pending_notification_coalesces_size() {
        let (mut q, _dir, _) = queue(16);
        q.notify(FEED, PATH, 100, t(0));
        q.notify(FEED, PATH, 200, t(1));
        assert_eq!(q.pending_len(), 1);
        assert_eq!(q.find_pending(PATH).unwrap().size, 200);
    }

    #[test]
    fn test_active_transfer_is_not_duplicated() {
        let (mut q, _dir, _) = queue(16);
        q.notify(FEED, PATH, 1000, t(0));
        let job = q.start_next(t(1)).unwrap().unwrap();
        assert_eq!(job.url(), format!("{FEED}/recording/{PATH}"));

        assert_eq!(q.notify(FEED, PATH, 1000, t(2)), Notified::InFlight);
        // The file grew: let the active transfer finish, pick up the rest
        // on a later notification.
        assert_eq!(q.notify(FEED, PATH, 1500, t(2)), Notified::InFlight);
        assert_eq!(q.pending_len(), 1);
        assert_eq!(q.find_pending(PATH).unwrap().size, 1000);
    }

    #[test]
    fn test_only_one_active_transfer() {
        let (mut q, _dir, _) = queue(16);
        for i in 0..5 {
            q.notify(FEED, &format!("2024/05/01/{i:02}-cam1.mp4"), 10, t(0));
        }
        let first = q.start_next(t(1)).unwrap().unwrap();
        assert_eq!(q.start_next(t(2)).unwrap(), None, "head is busy");
        assert_eq!(active_count(&q), 1);

        q.finish(first.id, 200, t(3)).unwrap();
        assert_eq!(active_count(&q), 0);
        let second = q.start_next(t(3)).unwrap().unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(active_count(&q), 1);
    }

    #[test]
    fn test_existing_complete_file_is_not_queued() {
        let (mut q, dir, _) = queue(16);
        std::fs::create_dir_all(dir.path().join("2024/05/01")).unwrap();
        std::fs::write(dir.path().join(PATH), vec![0u8; 1000]).unwrap();

        assert_eq!(q.notify(FEED, PATH, 1000, t(0)), Notified::UpToDate);
        assert_eq!(q.pending_len(), 0);
        assert!(q.status().is_empty());
    }

    #[test]
    fn test_shorter_local_file_resumes() {
        let (mut q, dir, _) = queue(16);
        std::fs::create_dir_all(dir.path().join("2024/05/01")).unwrap();
        std::fs::write(dir.path().join(PATH), vec![0u8; 500]).unwrap();

        assert_eq!(q.notify(FEED, PATH, 1000, t(0)), Notified::Queued);
        let job = q.start_next(t(1)).unwrap().unwrap();
        assert_eq!(job.offset, 500);
    }

    #[test]
    fn test_longer_local_file_restarts_from_zero() {
        let (mut q, dir, _) = queue(16);
        std::fs::create_dir_all(dir.path().join("2024/05/01")).unwrap();
        std::fs::write(dir.path().join(PATH), vec![0u8; 2000]).unwrap();

        assert_eq!(q.notify(FEED, PATH, 1000, t(0)), Notified::Queued);
        assert_eq!(q.start_next(t(1)).unwrap().unwrap().offset, 0);
    }

    #[test]
    fn test_coalescing_below_offset_restarts_from_zero() {
        let (mut q, dir, _) = queue(16);
        std::fs::create_dir_all(dir.path().join("2024/05/01")).unwrap();
        std::fs::write(dir.path().join(PATH), vec![0u8; 500]).unwrap();
        q.notify(FEED, PATH, 1000, t(0));
        q.notify(FEED, PATH, 400, t(1));
        assert_eq!(q.find_pending(PATH).unwrap().offset, 0);
    }

    #[test]
    fn test_coalescing_a_shrink_restarts_from_zero() {
        let (mut q, dir, _) = queue(16);
        std::fs::create_dir_all(dir.path().join("2024/05/01")).unwrap();
        std::fs::write(dir.path().join(PATH), vec![0u8; 500]).unwrap();
        q.notify(FEED, PATH, 1000, t(0));
        assert_eq!(q.find_pending(PATH).unwrap().offset, 500);

        assert_eq!(q.notify(FEED, PATH, 800, t(1)), Notified::Coalesced);
        let item = q.find_pending(PATH).unwrap();
        assert_eq!(item.size, 800);
        assert_eq!(item.offset, 0);
    }

    #[test]
    fn test_coalescing_growth_keeps_offset() {
        let (mut q, dir, _) = queue(16);
        std::fs::create_dir_all(dir.path().join("2024/05/01")).unwrap();
        std::fs::write(dir.path().join(PATH), vec![0u8; 500]).unwrap();
        q.notify(FEED, PATH, 1000, t(0));
        q.notify(FEED, PATH, 1200, t(1));
        assert_eq!(q.find_pending(PATH).unwrap().offset, 500);
    }

    #[test]
    fn test_done_with_same_size_is_cached() {
        let (mut q, _dir, sink) = queue(16);
        q.notify(FEED, PATH, 1000, t(0));
        let job = q.start_next(t(0)).unwrap().unwrap();
        q.finish(job.id, 200, t(0)).unwrap();
        assert_eq!(sink.details("TRANSFER", "COMPLETE"), vec![format!("FOR FILE {PATH} at {FEED}")]);

        // The file is not even on disk: the cache answers alone.
        assert_eq!(q.notify(FEED, PATH, 1000, t(5)), Notified::UpToDate);
        assert_eq!(q.pending_len(), 0);
    }

    #[test]
    fn test_done_with_new_size_is_transferred_again() {
        let (mut q, _dir, _) = queue(16);
        q.notify(FEED, PATH, 1000, t(0));
        let job = q.start_next(t(0)).unwrap().unwrap();
        q.finish(job.id, 200, t(0)).unwrap();

        assert_eq!(q.notify(FEED, PATH, 1500, t(5)), Notified::Queued);
    }

    #[test]
    fn test_failed_transfer_is_retried() {
        let (mut q, _dir, sink) = queue(16);
        q.notify(FEED, PATH, 1000, t(0));
        let job = q.start_next(t(0)).unwrap().unwrap();
        q.finish(job.id, 404, t(1)).unwrap();
        assert!(sink.has("TRANSFER", "dvr", "FAILED"));
        assert_eq!(
            q.status(),
            vec![QueueEntry { feed: FEED.into(), path: PATH.into(), state: Some("failed") }]
        );

        assert_eq!(q.notify(FEED, PATH, 1000, t(5)), Notified::Queued);
    }

    #[test]
    fn test_full_queue_drops_without_forgetting() {
        let (mut q, _dir, _) = queue(2);
        q.notify(FEED, "2024/05/01/a.mp4", 1, t(0));
        q.notify(FEED, "2024/05/01/b.mp4", 1, t(0));
        assert_eq!(q.notify(FEED, "2024/05/01/c.mp4", 1, t(0)), Notified::Dropped);
        assert!(q.find_pending("2024/05/01/c.mp4").is_none());
        assert!(q.find_recent("2024/05/01/c.mp4").is_none());

        let job = q.start_next(t(1)).unwrap().unwrap();
        q.finish(job.id, 200, t(2)).unwrap();
        assert_eq!(q.notify(FEED, "2024/05/01/c.mp4", 1, t(3)), Notified::Queued);
    }

    #[test]
    fn test_finish_of_unexpected_transfer_is_an_invariant_violation() {
        let (mut q, _dir, _) = queue(16);
        assert!(matches!(q.finish(1, 200, t(0)), Err(DvrError::Invariant(_))));

        q.notify(FEED, PATH, 1000, t(0));
        // Not started yet.
        let id = q.find_pending(PATH).unwrap().id;
        assert!(matches!(q.finish(id, 200, t(0)), Err(DvrError::Invariant(_))));

        let job = q.start_next(t(0)).unwrap().unwrap();
        assert!(matches!(q.finish(job.id + 1, 200, t(0)), Err(DvrError::Invariant(_))));
        q.finish(job.id, 200, t(0)).unwrap();
        assert!(matches!(q.finish(job.id, 200, t(0)), Err(DvrError::Invariant(_))));
    }

    #[test]
    fn test_background_evicts_old_cache_entries() {
        let (mut q, _dir, _) = queue(16);
        q.notify(FEED, PATH, 1000, t(0));
        let job = q.start_next(t(0)).unwrap().unwrap();
        q.finish(job.id, 200, t(10)).unwrap();

        q.background(t(10 + RETENTION_SECS));
        assert!(q.find_recent(PATH).is_some());
        q.background(t(11 + RETENTION_SECS));
        assert!(q.find_recent(PATH).is_none());
    }

    #[test]
    fn test_status_is_fifo_with_labels() {
        let (mut q, _dir, _) = queue(16);
        q.notify(FEED, "2024/05/01/a.mp4", 1, t(0));
        q.notify(FEED, "2024/05/01/b.mp4", 1, t(0));
        q.notify(FEED, "2024/05/01/c.mp4", 1, t(0));
        let a = q.start_next(t(0)).unwrap().unwrap();
        q.finish(a.id, 200, t(1)).unwrap();
        q.start_next(t(1)).unwrap().unwrap();

        let labels: Vec<(String, Option<&str>)> = q
            .status()
            .into_iter()
            .map(|e| (e.path, e.state))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("2024/05/01/a.mp4".to_string(), Some("done")),
                ("2024/05/01/b.mp4".to_string(), Some("active")),
                ("2024/05/01/c.mp4".to_string(), None),
            ]
        );

        let json = serde_json::to_string(&q.status()[2]).unwrap();
        assert_eq!(json, r#"{"feed":"http://camA:8080","path":"2024/05/01/c.mp4"}"#);
    }

    #[test]
    fn test_cache_is_bounded() {
        let (mut q, _dir, _) = queue(2);
        for name in ["a", "b", "c"] {
            q.notify(FEED, &format!("2024/05/01/{name}.mp4"), 1, t(0));
            let job = q.start_next(t(0)).unwrap().unwrap();
            q.finish(job.id, 200, t(0)).unwrap();
        }
        assert!(q.find_recent("2024/05/01/a.mp4").is_none());
        assert!(q.find_recent("2024/05/01/c.mp4").is_some());
    }

    #[test]
    fn test_elapsed_note() {
        assert_eq!(elapsed_note(0), "");
        assert_eq!(elapsed_note(1), "");
        assert_eq!(elapsed_note(2), " (2s)");
        assert_eq!(elapsed_note(120), " (120s)");
        assert_eq!(elapsed_note(121), " (slow)");
    }
}
