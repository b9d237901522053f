//! Per-installation state
//!
//! A single flag records whether the first permission activation of this
//! installation has completed. It lives in a small JSON file under the
//! user's local data directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MonitorError, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    first_activation_completed: bool,
}

#[derive(Debug, Clone)]
pub struct InstallState {
    path: Option<PathBuf>,
    completed: bool,
}

impl InstallState {
    /// Load the flag from `path`; a missing file means a fresh installation
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let completed = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let state: StateFile = serde_json::from_str(&content).map_err(|e| {
                MonitorError::InstallState(format!("{}: {}", path.display(), e))
            })?;
            state.first_activation_completed
        } else {
            debug!("No install state at {}, treating as fresh install", path.display());
            false
        };

        Ok(Self {
            path: Some(path),
            completed,
        })
    }

    /// State that is never written to disk
    pub fn in_memory(completed: bool) -> Self {
        Self {
            path: None,
            completed,
        }
    }

    /// Get the default state file path
    pub fn default_path() -> PathBuf {
        if let Some(data_dir) = dirs::data_local_dir() {
            data_dir.join("usb-session").join("state.json")
        } else {
            PathBuf::from(".local/share/usb-session/state.json")
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn first_activation_pending(&self) -> bool {
        !self.completed
    }

    /// Mark the first activation done and persist it
    ///
    /// The in-memory flag flips even when writing fails.
    pub fn complete_first_activation(&mut self) -> Result<()> {
        if self.completed {
            return Ok(());
        }
        self.completed = true;

        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&StateFile {
            first_activation_completed: true,
        })
        .map_err(|e| MonitorError::InstallState(e.to_string()))?;
        fs::write(path, content)?;

        info!("First activation completed, saved to {}", path.display());
        Ok(())
    }
}
