//! HTTP protocol types for talking to feed servers.
//!
//! A feed server exposes:
//!   GET /check                  → [`CheckResponse`]
//!   GET /status                 → [`FeedStatus`]
//!   GET /recording/<path>       → the recording file (Range supported)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A recording without an explicit stable flag is only trusted once it is
/// this old (seconds); younger files may still be written to.
pub const QUIESCENCE_SECS: i64 = 60;

/// Response of the cheap freshness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub host: String,
    /// Version token; changes whenever the server's status changes.
    #[serde(default)]
    pub updated: Option<i64>,
}

/// Full status document of a feed server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedStatus {
    pub host: String,
    /// Version token. Early feed servers do not report it (0 = unknown).
    #[serde(default)]
    pub updated: i64,
    pub cctv: CctvStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CctvStatus {
    /// Administration web page of the feed server.
    pub console: String,
    /// Free space, as a human string like `512M` or `2G`.
    #[serde(default)]
    pub available: Option<Value>,
    /// Device name → stream URL.
    #[serde(default)]
    pub feeds: Option<BTreeMap<String, Value>>,
    /// `[timestamp, relativePath, size, stable?]` tuples.
    #[serde(default)]
    pub recordings: Option<Vec<Value>>,
}

impl CctvStatus {
    /// The free space text, or `"0"` when absent or not a string.
    pub fn free_space_text(&self) -> &str {
        self.available
            .as_ref()
            .and_then(Value::as_str)
            .unwrap_or("0")
    }

    /// Devices with a string stream URL; other entries are ignored.
    pub fn devices(&self) -> Vec<(&str, &str)> {
        self.feeds
            .iter()
            .flatten()
            .filter_map(|(name, url)| Some((name.as_str(), url.as_str()?)))
            .collect()
    }

    /// Well-formed recording descriptors, malformed entries skipped.
    pub fn recordings(&self) -> Vec<RecordingDescriptor> {
        self.recordings
            .iter()
            .flatten()
            .filter_map(RecordingDescriptor::from_value)
            .collect()
    }
}

/// One entry of the `recordings` list in a feed status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingDescriptor {
    /// Unix time of the recording, when reported as an integer.
    pub timestamp: Option<i64>,
    /// Path relative to the archive root (`YYYY/MM/DD/<file>`).
    pub path: String,
    pub size: u64,
    /// Explicit stable flag (only present in 4-element tuples).
    pub stable: Option<bool>,
}

impl RecordingDescriptor {
    pub fn from_value(value: &Value) -> Option<Self> {
        let fields = value.as_array()?;
        if fields.len() < 3 {
            return None;
        }
        let path = fields[1].as_str()?.to_string();
        let size = fields[2].as_u64()?;
        let stable = if fields.len() >= 4 {
            Some(fields[3].as_bool().unwrap_or(false))
        } else {
            None
        };
        Some(Self {
            timestamp: fields[0].as_i64(),
            path,
            size,
            stable,
        })
    }

    /// Whether the file is fully written and safe to transfer.
    pub fn is_stable(&self, now: i64) -> bool {
        match self.stable {
            Some(flag) => flag,
            None => self
                .timestamp
                .is_some_and(|ts| ts < now - QUIESCENCE_SECS),
        }
    }
}
