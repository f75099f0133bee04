//! Persisted plan state
//!
//! Outputs of the last walk and the build ledger, kept between `fleetctl`
//! invocations so a re-run `apply` reconciles and build records survive.

use crate::apply::{ApplyReport, NodeOutcome};
use crate::build::BuildLedger;
use crate::error::StateError;
use crate::outputs::OutputTable;
use crate::types::Provider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Contents of the state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanState {
    /// Provider the outputs belong to
    #[serde(default)]
    pub provider: Option<Provider>,
    /// Outputs of nodes that exist
    #[serde(default)]
    pub outputs: OutputTable,
    /// Build run history
    #[serde(default)]
    pub builds: BuildLedger,
    /// Last write
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PlanState {
    /// Load state; a missing file is an empty state.
    ///
    /// # Errors
    /// `Io` on read failure, `Corrupt` if the file is not valid state JSON.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no state file; starting empty");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write state through a sibling temp file and rename.
    ///
    /// # Errors
    /// `Io` if the write or rename fails.
    pub fn save(&mut self, path: &Path) -> Result<(), StateError> {
        self.updated_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(self).map_err(|source| StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = temp_path(path);
        let io = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };
        std::fs::write(&tmp, json).map_err(io)?;
        std::fs::rename(&tmp, path).map_err(io)?;
        tracing::debug!(path = %path.display(), nodes = self.outputs.len(), "state saved");
        Ok(())
    }

    /// Fold a walk's report into the state.
    ///
    /// Succeeded nodes replace their outputs, deleted nodes drop them, and
    /// everything else keeps what was recorded before.
    pub fn absorb(&mut self, report: &ApplyReport) {
        for (id, outcome) in &report.outcomes {
            match outcome {
                NodeOutcome::Deleted => {
                    self.outputs.remove(id);
                }
                outcome if outcome.is_success() => {
                    if let Some(outputs) = report.outputs.node(id) {
                        self.outputs.insert(id.clone(), outputs.clone());
                    }
                }
                _ => {}
            }
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
