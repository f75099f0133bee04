//! Build pipeline runs
//!
//! Build jobs are triggered outside the plan (manually or by CI). The plan
//! only records what happened so runner jobs can resolve `LatestBuild`
//! images:
//!
//! ```text
//! Pending -> Running -> Succeeded
//!                    \-> Failed
//! ```
//!
//! Failed runs are terminal and never retried here. A runner keeps pointing
//! at the last successful image; with no successful run the plan does not
//! validate.

use crate::error::ValidationError;
use crate::types::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use ulid::Ulid;

/// Build run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// Recorded, not started
    Pending,
    /// Executing
    Running,
    /// Image pushed
    Succeeded,
    /// Terminal failure
    Failed,
}

impl BuildStatus {
    /// No further transitions allowed
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Statuses reachable from `from` in one step.
#[must_use]
pub fn allowed_transitions(from: BuildStatus) -> &'static [BuildStatus] {
    match from {
        BuildStatus::Pending => &[BuildStatus::Running],
        BuildStatus::Running => &[BuildStatus::Succeeded, BuildStatus::Failed],
        BuildStatus::Succeeded | BuildStatus::Failed => &[],
    }
}

/// One execution of a build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRun {
    /// Run identifier
    pub run_id: Ulid,
    /// Current status
    pub status: BuildStatus,
    /// Pushed image reference (set on success)
    pub image: Option<String>,
    /// Failure reason (set on failure)
    pub failure: Option<String>,
    /// When the run was recorded
    pub created_at: DateTime<Utc>,
    /// When the run reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
}

/// History of build runs per build node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLedger {
    runs: BTreeMap<NodeId, Vec<BuildRun>>,
}

impl BuildLedger {
    /// Empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new pending run for `build`.
    pub fn record_pending(&mut self, build: &NodeId) -> Ulid {
        let run_id = Ulid::new();
        self.runs.entry(build.clone()).or_default().push(BuildRun {
            run_id,
            status: BuildStatus::Pending,
            image: None,
            failure: None,
            created_at: Utc::now(),
            finished_at: None,
        });
        tracing::debug!(build = %build, run = %run_id, "build run recorded");
        run_id
    }

    /// Move a run to `Running`.
    ///
    /// # Errors
    /// `InvalidBuildTransition` if the run is unknown or not pending.
    pub fn mark_running(&mut self, build: &NodeId, run_id: Ulid) -> Result<(), ValidationError> {
        self.transition(build, run_id, BuildStatus::Running)?;
        Ok(())
    }

    /// Move a run to `Succeeded` with the pushed image.
    ///
    /// # Errors
    /// `InvalidBuildTransition` if the run is unknown or not running.
    pub fn mark_succeeded(
        &mut self,
        build: &NodeId,
        run_id: Ulid,
        image: impl Into<String>,
    ) -> Result<(), ValidationError> {
        let run = self.transition(build, run_id, BuildStatus::Succeeded)?;
        run.image = Some(image.into());
        run.finished_at = Some(Utc::now());
        tracing::info!(build = %build, run = %run_id, "build succeeded");
        Ok(())
    }

    /// Move a run to `Failed`. The failure is terminal.
    ///
    /// # Errors
    /// `InvalidBuildTransition` if the run is unknown or not running.
    pub fn mark_failed(
        &mut self,
        build: &NodeId,
        run_id: Ulid,
        reason: impl Into<String>,
    ) -> Result<(), ValidationError> {
        let reason = reason.into();
        let run = self.transition(build, run_id, BuildStatus::Failed)?;
        run.failure = Some(reason.clone());
        run.finished_at = Some(Utc::now());
        tracing::error!(build = %build, run = %run_id, reason = %reason, "build failed; operator action required");
        Ok(())
    }

    fn transition(
        &mut self,
        build: &NodeId,
        run_id: Ulid,
        to: BuildStatus,
    ) -> Result<&mut BuildRun, ValidationError> {
        let run = self
            .runs
            .get_mut(build)
            .and_then(|runs| runs.iter_mut().find(|r| r.run_id == run_id))
            .ok_or_else(|| ValidationError::InvalidBuildTransition {
                build: build.clone(),
                from: format!("unknown run {run_id}"),
                to: to.to_string(),
            })?;

        if !allowed_transitions(run.status).contains(&to) {
            return Err(ValidationError::InvalidBuildTransition {
                build: build.clone(),
                from: run.status.to_string(),
                to: to.to_string(),
            });
        }
        run.status = to;
        Ok(run)
    }

    /// Most recent successful run of `build`.
    #[must_use]
    pub fn last_successful(&self, build: &NodeId) -> Option<&BuildRun> {
        self.runs
            .get(build)?
            .iter()
            .rev()
            .find(|r| r.status == BuildStatus::Succeeded)
    }

    /// Image of the most recent successful run.
    #[must_use]
    pub fn latest_image(&self, build: &NodeId) -> Option<&str> {
        self.last_successful(build)?.image.as_deref()
    }

    /// Most recent run regardless of status.
    #[must_use]
    pub fn latest(&self, build: &NodeId) -> Option<&BuildRun> {
        self.runs.get(build)?.last()
    }

    /// All runs of `build`, oldest first.
    #[must_use]
    pub fn runs(&self, build: &NodeId) -> &[BuildRun] {
        self.runs.get(build).map_or(&[], Vec::as_slice)
    }

    /// Reject a ledger holding a succeeded run without an image. Ledgers
    /// built through the transition methods never do; deserialized ones
    /// might.
    ///
    /// # Errors
    /// `CorruptBuildRecord` for the first such run.
    pub fn check_integrity(&self) -> Result<(), ValidationError> {
        for (build, runs) in &self.runs {
            if let Some(run) = runs
                .iter()
                .find(|r| r.status == BuildStatus::Succeeded && r.image.is_none())
            {
                return Err(ValidationError::CorruptBuildRecord {
                    build: build.clone(),
                    run: run.run_id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Convenience: record a run that already finished successfully.
    ///
    /// # Errors
    /// Never in practice; the transitions are always valid for a fresh run.
    pub fn record_success(
        &mut self,
        build: &NodeId,
        image: impl Into<String>,
    ) -> Result<Ulid, ValidationError> {
        let run_id = self.record_pending(build);
        self.mark_running(build, run_id)?;
        self.mark_succeeded(build, run_id, image)?;
        Ok(run_id)
    }
}
