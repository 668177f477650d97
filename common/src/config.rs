//! Configuration parsing – reads a KEY=VALUE file (`vigil.conf`).
//!
//! The DVR needs no configuration at all to run: every key has a default,
//! and a missing file only produces a warning (see [`load_or_default`]).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Smallest transfer queue we accept, whatever the config says.
const MIN_QUEUE_SIZE: usize = 16;
const MAX_QUEUE_SIZE: usize = 65_536;

/// Longest poll or full scan period accepted, in seconds (one day).
pub const MAX_PERIOD_SECS: u64 = 86_400;

/// Application configuration for the DVR consolidation server.
#[derive(Debug, Clone)]
pub struct Config {
    // ── storage ──────────────────────────────────────────────────────
    /// Root of the date-partitioned recordings archive.
    pub storage_root: PathBuf,
    /// Disk usage (percent) above which the oldest days are deleted.
    /// `None` disables automatic cleanup.
    pub clean_threshold: Option<u8>,

    // ── transfer ─────────────────────────────────────────────────────
    /// Maximum number of pending transfers.
    pub queue_size: usize,

    // ── discovery ────────────────────────────────────────────────────
    /// Logical service name advertised by the feed servers (e.g. `cctv`).
    pub feed_service: String,
    /// Normal polling period, once the fast-start window is over.
    pub check_period_secs: u64,
    /// Period between two full status scans.
    pub full_scan_period_secs: u64,
    /// Feed servers that are polled even without mDNS.
    pub feed_urls: Vec<String>,

    // ── persisted state ──────────────────────────────────────────────
    pub state_path: PathBuf,

    // ── network ──────────────────────────────────────────────────────
    /// Address the DVR HTTP server listens on.
    pub listen_addr: String,
    /// Static web pages (calendar UI).
    pub public_dir: PathBuf,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/vigil/vigil.conf"
    }

    /// Port part of `listen_addr`, used for the mDNS advertisement.
    pub fn listen_port(&self) -> u16 {
        self.listen_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }

    fn from_map(map: &HashMap<String, String>) -> Config {
        let get = |key: &str| -> Option<String> { map.get(key).cloned() };
        let get_u64 = |key: &str, default: u64| -> u64 {
            get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };

        let feed_urls: Vec<String> = get("FEED_URLS")
            .map(|s| {
                s.split(',')
                    .map(|u| u.trim().trim_end_matches('/').to_string())
                    .filter(|u| !u.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Config {
            storage_root: PathBuf::from(
                get("DVR_STORE").unwrap_or_else(|| "/storage/motion/videos".into()),
            ),
            clean_threshold: get("DVR_CLEAN")
                .and_then(|v| v.parse::<u8>().ok())
                .filter(|&p| p > 0),
            queue_size: usize::try_from(get_u64("DVR_QUEUE", 128))
                .unwrap_or(MAX_QUEUE_SIZE)
                .clamp(MIN_QUEUE_SIZE, MAX_QUEUE_SIZE),
            feed_service: get("DVR_FEED")
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "cctv".into()),
            check_period_secs: get_u64("DVR_CHECK", 30).clamp(1, MAX_PERIOD_SECS),
            full_scan_period_secs: get_u64("DVR_FULL_SCAN", 300).clamp(1, MAX_PERIOD_SECS),
            feed_urls,
            state_path: PathBuf::from(
                get("DVR_STATE").unwrap_or_else(|| "/var/lib/vigil/dvr-state.json".into()),
            ),
            listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8090".into()),
            public_dir: PathBuf::from(
                get("PUBLIC_DIR").unwrap_or_else(|| "/usr/local/share/vigil/public".into()),
            ),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_map(&HashMap::new())
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    info!("Loaded config from {}", path.display());
    Ok(Config::from_map(&map))
}

/// Like [`load`], but falls back to the defaults when the file does not
/// exist.  A file that exists but cannot be read is still an error.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        warn!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    load(path)
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
