//! Storage inventory – the local archive of recordings.
//!
//! The archive is a `<root>/<year>/<month>/<day>/` tree.  This module
//! reports disk usage, deletes the oldest days when the disk gets full, and
//! keeps the `Today` / `Yesterday` convenience links up to date.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeDelta};
use nix::sys::statvfs::statvfs;
use serde::Serialize;
use tracing::debug;

use crate::events::EventSink;

/// Maximum number of days deleted in one cleanup pass, in case deleting
/// does not free anything (or the disk is full for another reason).
const MAX_CLEANUP_ROUNDS: usize = 10;

/// Seconds between two disk checks.
const CHECK_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub total: u64,
    pub free: u64,
    pub used_percent: u8,
}

impl Usage {
    /// Compute usage from `statvfs` fields.
    ///
    /// The total is counted in fragments (`f_frsize`), the free space in
    /// blocks (`f_bsize`).  The two sizes are equal on most filesystems,
    /// which hides any mix-up.
    pub fn from_statvfs(blocks: u64, frsize: u64, bavail: u64, bsize: u64) -> Usage {
        let total = blocks.saturating_mul(frsize);
        let free = bavail.saturating_mul(bsize);
        let used_percent = if total == 0 {
            0
        } else {
            (total.saturating_sub(free).saturating_mul(100) / total).min(100) as u8
        };
        Usage {
            total,
            free,
            used_percent,
        }
    }
}

/// What a single cleanup step removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
    /// No dated directory left.
    Nothing,
    /// A year or month directory without any dated children.
    Empty(PathBuf),
    /// A whole day of recordings.
    Day(PathBuf),
}

pub struct Storage {
    root: PathBuf,
    events: Arc<dyn EventSink>,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>, events: Arc<dyn EventSink>) -> Self {
        Self {
            root: root.into(),
            events,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join(date.year().to_string())
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
    }

    pub fn usage(&self) -> io::Result<Usage> {
        let stat = statvfs(&self.root)?;
        #[allow(clippy::unnecessary_cast)]
        Ok(Usage::from_statvfs(
            stat.blocks() as u64,
            stat.fragment_size() as u64,
            stat.blocks_available() as u64,
            stat.block_size() as u64,
        ))
    }

    /// Delete the oldest day of recordings.  A year or month directory
    /// found empty is deleted instead, so it may take several calls to get
    /// to the next day.
    pub fn cleanup_oldest(&self) -> io::Result<Cleanup> {
        let Some(year) = oldest_child(&self.root)? else {
            return Ok(Cleanup::Nothing);
        };
        let Some(month) = oldest_child(&year)? else {
            std::fs::remove_dir_all(&year)?;
            self.events
                .event("DIRECTORY", &self.relative(&year), "DELETED", "EMPTY");
            return Ok(Cleanup::Empty(year));
        };
        let Some(day) = oldest_child(&month)? else {
            std::fs::remove_dir_all(&month)?;
            self.events
                .event("DIRECTORY", &self.relative(&month), "DELETED", "EMPTY");
            return Ok(Cleanup::Empty(month));
        };

        std::fs::remove_dir_all(&day)?;
        self.events
            .event("DIRECTORY", &self.relative(&day), "DELETED", "TO FREE DISK SPACE");
        Ok(Cleanup::Day(day))
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    /// Delete old days until usage is at or below `threshold` percent.
    pub fn reclaim(&self, threshold: u8) {
        self.reclaim_with(threshold, Storage::usage)
    }

    fn reclaim_with(&self, threshold: u8, usage: impl Fn(&Storage) -> io::Result<Usage>) {
        for _ in 0..MAX_CLEANUP_ROUNDS {
            let usage = match usage(self) {
                Ok(u) => u,
                Err(e) => {
                    self.events
                        .trace(&self.root.display().to_string(), &format!("statvfs: {e}"));
                    return;
                }
            };
            if usage.used_percent <= threshold {
                return;
            }
            debug!("Proceeding with disk cleanup (disk {}% full)", usage.used_percent);
            self.events.event(
                "DISK",
                &self.root.display().to_string(),
                "FULL",
                &format!("{}% USED", usage.used_percent),
            );
            match self.cleanup_oldest() {
                Ok(Cleanup::Nothing) => return,
                Ok(_) => {}
                Err(e) => {
                    self.events
                        .trace(&self.root.display().to_string(), &format!("cleanup failed: {e}"));
                    return;
                }
            }
        }
    }

    /// Point `<root>/<name>` at the directory of `date`.
    pub fn link_day(&self, name: &str, date: NaiveDate) -> io::Result<()> {
        let path = self.root.join(name);
        let target = self.day_dir(date);
        debug!("Create link {} -> {}", path.display(), target.display());
        if path.symlink_metadata().is_ok() {
            std::fs::remove_file(&path)?;
        }
        std::os::unix::fs::symlink(&target, &path)?;
        self.events
            .event("LINK", name, "TARGET", &target.display().to_string());
        Ok(())
    }
}

/// Periodic storage work: cleanup when the disk is full, daily links.
pub struct Housekeeping {
    clean_threshold: Option<u8>,
    last_check: Option<DateTime<Local>>,
    last_day: Option<NaiveDate>,
}

impl Housekeeping {
    pub fn new(clean_threshold: Option<u8>) -> Self {
        Self {
            clean_threshold,
            last_check: None,
            last_day: None,
        }
    }

    pub fn run(&mut self, storage: &Storage, now: DateTime<Local>) {
        if self
            .last_check
            .is_some_and(|last| now - last < TimeDelta::seconds(CHECK_INTERVAL_SECS))
        {
            return;
        }
        self.last_check = Some(now);

        if let Some(threshold) = self.clean_threshold {
            storage.reclaim(threshold);
        }

        let today = now.date_naive();
        if self.last_day != Some(today) {
            let mut linked = storage.link_day("Today", today).is_ok();
            if let Some(yesterday) = today.pred_opt() {
                linked &= storage.link_day("Yesterday", yesterday).is_ok();
            }
            if linked {
                self.last_day = Some(today);
            } else {
                storage.events.trace("LINK", "cannot update the Today/Yesterday links");
            }
        }
    }
}

/// The numerically lowest dated subdirectory of `parent`, if any.
fn oldest_child(parent: &Path) -> io::Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut oldest: Option<(u32, PathBuf)> = None;
    for entry in entries.flatten() {
        if !entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let name = entry.file_name();
        let Some(number) = leading_number(&name.to_string_lossy()) else {
            continue;
        };
        if oldest.as_ref().is_none_or(|(n, _)| number < *n) {
            oldest = Some((number, entry.path()));
        }
    }
    Ok(oldest.map(|(_, path)| path))
}

/// Parse the leading digits of a directory name (`"05"` → 5).
pub fn leading_number(name: &str) -> Option<u32> {
    let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
