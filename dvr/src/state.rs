//! Known cameras, remembered across restarts.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedState {
    #[serde(default)]
    cameras: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// The saved camera names.  Losing the state only loses history, so any
    /// error gives an empty list.
    pub fn load(&self) -> Vec<String> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                warn!("No saved state at {}: {e}", self.path.display());
                return Vec::new();
            }
        };
        match serde_json::from_str::<SavedState>(&text) {
            Ok(state) => state.cameras,
            Err(e) => {
                warn!("Ignoring invalid state file {}: {e}", self.path.display());
                Vec::new()
            }
        }
    }

    pub fn save(&self, cameras: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let state = SavedState {
            cameras: cameras.to_vec(),
        };
        let text = serde_json::to_string_pretty(&state)?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, text)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        debug!("Saved {} camera(s) to {}", cameras.len(), self.path.display());
        Ok(())
    }
}
