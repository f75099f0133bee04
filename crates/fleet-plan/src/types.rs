//! Core identifiers and enums shared by every part of the plan.

use crate::error::ValidationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Caller-chosen node identifier (`ctx`, `identity-runner`, `runner`, ...).
///
/// Ids are lowercase DNS-label style so every adapter can derive resource
/// names from them without further escaping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

fn node_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9-]{0,39}$").unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

impl NodeId {
    /// Parse and validate a node id.
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidNodeId` when the id is empty, longer
    /// than 40 characters, or contains anything but `[a-z0-9-]`.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if node_id_pattern().is_match(&id) && !id.ends_with('-') {
            Ok(Self(id))
        } else {
            Err(ValidationError::InvalidNodeId(id))
        }
    }

    /// Borrow the raw id.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The six abstract node categories a plan is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// Credential principal with attached grants
    Identity,
    /// One-shot image build job
    BuildJob,
    /// Ephemeral runner job definition
    RunnerJob,
    /// Long-running autoscaler service
    Controller,
    /// Per job-family log destination
    LogSink,
    /// Read-only region/network/account lookup
    ContextLookup,
}

impl NodeKind {
    /// Compute nodes run a container and must reference an identity and a log sink.
    #[inline]
    #[must_use]
    pub fn is_compute(self) -> bool {
        matches!(self, Self::BuildJob | Self::RunnerJob | Self::Controller)
    }

    /// Job family a compute node belongs to; `None` for everything else.
    #[must_use]
    pub fn job_family(self) -> Option<JobFamily> {
        match self {
            Self::BuildJob => Some(JobFamily::Builder),
            Self::RunnerJob => Some(JobFamily::Runner),
            Self::Controller => Some(JobFamily::Autoscaler),
            Self::Identity | Self::LogSink | Self::ContextLookup => None,
        }
    }

    /// Stable lowercase name used in logs and outputs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::BuildJob => "build-job",
            Self::RunnerJob => "runner-job",
            Self::Controller => "controller",
            Self::LogSink => "log-sink",
            Self::ContextLookup => "context-lookup",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloud provider a plan is applied against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// ECS Fargate task definitions and services
    Aws,
    /// Container Apps jobs and apps
    Azure,
    /// Cloud Run jobs and services
    Gcp,
}

impl Provider {
    /// Lowercase provider name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "azure" => Ok(Self::Azure),
            "gcp" => Ok(Self::Gcp),
            other => Err(format!("unknown provider '{other}' (expected aws, azure or gcp)")),
        }
    }
}

/// Which job family a node belongs to; drives log-sink and identity naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobFamily {
    /// GitHub Actions runner jobs
    Runner,
    /// Kaniko image builds
    Builder,
    /// The autoscaler controller
    Autoscaler,
}

impl JobFamily {
    /// Lowercase family name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Runner => "runner",
            Self::Builder => "builder",
            Self::Autoscaler => "autoscaler",
        }
    }
}

impl fmt::Display for JobFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU in millicores (1000 = one vCPU)
    pub cpu_millicores: u32,
    /// Memory in MiB
    pub memory_mib: u32,
}

impl ResourceLimits {
    /// Create new limits
    #[inline]
    #[must_use]
    pub fn new(cpu_millicores: u32, memory_mib: u32) -> Self {
        Self {
            cpu_millicores,
            memory_mib,
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::new(1000, 2048)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_accepts_dns_labels() {
        assert!(NodeId::new("identity-runner").is_ok());
        assert!(NodeId::new("ctx").is_ok());
        assert!(NodeId::new("build2").is_ok());
    }

    #[test]
    fn node_id_rejects_bad_input() {
        assert!(NodeId::new("").is_err());
        assert!(NodeId::new("Runner").is_err());
        assert!(NodeId::new("1runner").is_err());
        assert!(NodeId::new("runner-").is_err());
        assert!(NodeId::new("runner_job").is_err());
        assert!(NodeId::new("a".repeat(41)).is_err());
    }

    #[test]
    fn node_id_serde_validates() {
        let ok: NodeId = serde_json::from_str("\"runner\"").unwrap();
        assert_eq!(ok.as_str(), "runner");
        assert!(serde_json::from_str::<NodeId>("\"NOPE\"").is_err());
    }

    #[test]
    fn provider_parses_case_insensitively() {
        assert_eq!("AWS".parse::<Provider>().unwrap(), Provider::Aws);
        assert_eq!("gcp".parse::<Provider>().unwrap(), Provider::Gcp);
        assert!("oracle".parse::<Provider>().is_err());
    }

    #[test]
    fn compute_kinds() {
        assert!(NodeKind::RunnerJob.is_compute());
        assert!(NodeKind::Controller.is_compute());
        assert!(!NodeKind::LogSink.is_compute());
        assert!(!NodeKind::Identity.is_compute());
    }
}
