//! Feed registry: the feed servers and cameras currently known.
//!
//! Servers are forgotten once they stop being confirmed.  Cameras are
//! never removed: recordings on disk reference the camera name, so a camera
//! whose server went away is only disowned (owner and stream URL cleared).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use crate::error::DvrError;
use crate::events::EventSink;

/// Entries not confirmed for this long are pruned (seconds).
pub const STALE_SECS: i64 = 180;

/// How long discovery may find nothing at all before we give up (seconds).
pub const WATCHDOG_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct FeedServer {
    pub name: String,
    pub admin_url: String,
    pub free_space_mb: u64,
    /// Last known version token, 0 when the server never reported one.
    pub updated: i64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CameraFeed {
    /// `<server>:<device>`
    pub name: String,
    /// Server currently providing this camera, if any.
    pub owner: Option<String>,
    pub url: String,
    pub last_seen: Option<DateTime<Utc>>,
}

impl CameraFeed {
    fn disown(&mut self) {
        self.owner = None;
        self.url.clear();
        self.last_seen = None;
    }
}

/// Detects a discovery mechanism that stopped working altogether: entries
/// of one kind were live before, and none has been for [`WATCHDOG_SECS`].
#[derive(Debug, Default)]
struct Watchdog {
    had_live: bool,
    dead_since: Option<DateTime<Utc>>,
}

impl Watchdog {
    fn check(&mut self, kind: &'static str, live: usize, now: DateTime<Utc>) -> Result<(), DvrError> {
        if live > 0 {
            self.had_live = true;
            self.dead_since = None;
            return Ok(());
        }
        if !self.had_live {
            return Ok(());
        }
        match self.dead_since {
            None => {
                self.dead_since = Some(now);
                Ok(())
            }
            Some(since) => {
                let secs = (now - since).num_seconds();
                if secs > WATCHDOG_SECS {
                    Err(DvrError::DiscoveryLost { kind, secs })
                } else {
                    Ok(())
                }
            }
        }
    }
}

pub struct Registry {
    servers: BTreeMap<String, FeedServer>,
    cameras: BTreeMap<String, CameraFeed>,
    server_watchdog: Watchdog,
    camera_watchdog: Watchdog,
    state_changed: bool,
    events: Arc<dyn EventSink>,
}

impl Registry {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            servers: BTreeMap::new(),
            cameras: BTreeMap::new(),
            server_watchdog: Watchdog::default(),
            camera_watchdog: Watchdog::default(),
            state_changed: false,
            events,
        }
    }

    pub fn servers(&self) -> impl Iterator<Item = &FeedServer> {
        self.servers.values()
    }

    pub fn cameras(&self) -> impl Iterator<Item = &CameraFeed> {
        self.cameras.values()
    }

    #[cfg(test)]
    pub fn camera(&self, name: &str) -> Option<&CameraFeed> {
        self.cameras.get(name)
    }

    #[cfg(test)]
    pub fn server(&self, name: &str) -> Option<&FeedServer> {
        self.servers.get(name)
    }

    /// All camera names ever seen, live or not.
    pub fn camera_names(&self) -> Vec<String> {
        self.cameras.keys().cloned().collect()
    }

    /// Whether a new camera appeared since the last call.
    pub fn take_state_changed(&mut self) -> bool {
        std::mem::take(&mut self.state_changed)
    }

    /// Ask for the camera list to be saved again, after a failed save.
    pub fn mark_state_changed(&mut self) {
        self.state_changed = true;
    }

    /// Re-create the cameras remembered from a previous run, without owner.
    pub fn restore(&mut self, names: &[String], now: DateTime<Utc>) {
        for name in names {
            self.register_camera(name, None, "", now);
        }
        debug!("Restored {} camera(s) from saved state", names.len());
    }

    /// Register or refresh a feed server.  Returns true if it is new.
    pub fn record_server_seen(
        &mut self,
        name: &str,
        updated: i64,
        admin_url: &str,
        free_space: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let free_space_mb = parse_free_space(free_space);
        match self.servers.get_mut(name) {
            Some(server) => {
                if server.admin_url != admin_url {
                    server.admin_url = admin_url.to_string();
                }
                // Older feed servers do not report a token: keep the last one.
                if updated != 0 {
                    server.updated = updated;
                }
                server.free_space_mb = free_space_mb;
                server.last_seen = now;
                false
            }
            None => {
                self.servers.insert(
                    name.to_string(),
                    FeedServer {
                        name: name.to_string(),
                        admin_url: admin_url.to_string(),
                        free_space_mb,
                        updated,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// True if the server is known and its token matches.  An unknown
    /// token (0) never matches.
    pub fn is_up_to_date(&self, name: &str, updated: i64) -> bool {
        updated != 0
            && self
                .servers
                .get(name)
                .is_some_and(|server| server.updated == updated)
    }

    /// The server confirmed that nothing changed: keep it and its cameras.
    pub fn refresh_seen(&mut self, name: &str, now: DateTime<Utc>) {
        for camera in self.cameras.values_mut() {
            if camera.owner.as_deref() == Some(name) {
                camera.last_seen = Some(now);
            }
        }
        if let Some(server) = self.servers.get_mut(name) {
            server.last_seen = now;
        }
    }

    /// Register or update a camera.  Returns true if the camera is new, or
    /// moved (different URL or server).
    ///
    /// `owner == None` is the restore path: the entry is created if absent
    /// and left untouched otherwise.
    pub fn register_camera(
        &mut self,
        name: &str,
        owner: Option<&str>,
        url: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(camera) = self.cameras.get_mut(name) else {
            let live = owner.is_some();
            self.cameras.insert(
                name.to_string(),
                CameraFeed {
                    name: name.to_string(),
                    owner: owner.map(str::to_string),
                    url: if live { url.to_string() } else { String::new() },
                    last_seen: live.then_some(now),
                },
            );
            if live {
                self.state_changed = true;
            }
            return live;
        };

        let Some(owner) = owner else {
            return false;
        };
        let mut changed = false;
        if camera.url != url {
            camera.url = url.to_string();
            changed = true;
        }
        if camera.owner.as_deref() != Some(owner) {
            camera.owner = Some(owner.to_string());
            changed = true;
        }
        camera.last_seen = Some(now);
        changed
    }

    /// After a full scan of `owner`: disown its cameras the scan did not
    /// confirm (not seen since `scan_started`).
    pub fn disown_unconfirmed(&mut self, owner: &str, scan_started: DateTime<Utc>) {
        for camera in self.cameras.values_mut() {
            if camera.owner.as_deref() != Some(owner) {
                continue;
            }
            if camera.last_seen.is_some_and(|t| t >= scan_started) {
                continue;
            }
            debug!("Feed {} at {} pruned", camera.name, camera.url);
            self.events
                .event("FEED", &camera.name, "PRUNED", &format!("STREAM {}", camera.url));
            camera.disown();
        }
    }

    /// Forget servers and disown cameras not confirmed for [`STALE_SECS`].
    ///
    /// Returns an error when discovery looks broken for good: the caller is
    /// expected to treat it as fatal.
    pub fn prune_stale(&mut self, now: DateTime<Utc>) -> Result<(), DvrError> {
        let deadline = now - TimeDelta::seconds(STALE_SECS);

        let mut cameras_live = 0;
        for camera in self.cameras.values_mut() {
            if camera.last_seen.is_some_and(|t| t > deadline) {
                cameras_live += 1;
                continue;
            }
            if camera.owner.is_some() {
                debug!("Feed {} at {} pruned", camera.name, camera.url);
                self.events
                    .event("FEED", &camera.name, "PRUNED", &format!("STREAM {}", camera.url));
            }
            camera.disown();
        }

        let events = &self.events;
        self.servers.retain(|name, server| {
            let live = server.last_seen > deadline;
            if !live {
                events.event("CCTV", name, "PRUNED", &format!("ADMIN {}", server.admin_url));
            }
            live
        });
        let servers_live = self.servers.len();

        self.camera_watchdog.check("camera", cameras_live, now)?;
        self.server_watchdog.check("feed server", servers_live, now)
    }
}

/// Parse a free space string (`"512M"`, `"2G"`) into megabytes.
/// Anything not in M or G is so little that it counts as zero.
pub fn parse_free_space(text: &str) -> u64 {
    let text = text.trim();
    let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
    let value: u64 = digits.parse().unwrap_or(0);
    match text.chars().find(|c| c.is_ascii_alphabetic()) {
        Some('G') => value * 1024,
        Some('M') => value,
        _ => 0,
    }
}
