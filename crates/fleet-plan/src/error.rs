//! Error types for fleet plans
//!
//! Three families, matching where a failure is detected:
//! - `ValidationError`: the graph itself is malformed; raised locally before
//!   any provider call is made
//! - `ProviderError`: a provider adapter rejected an operation for a node
//! - `ApplyError`: aggregate outcome of an `apply`/`destroy` walk

use crate::apply::ApplyReport;
use crate::dispatch::LaunchedRunner;
use crate::types::{JobFamily, NodeId, NodeKind};
use std::fmt;

/// Graph or precondition problems found without talking to a provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Node id does not match `[a-z][a-z0-9-]*`
    #[error("invalid-node-id: '{0}' must be 1-40 lowercase letters, digits or '-' and start with a letter")]
    InvalidNodeId(String),

    /// A node with the same id is already in the plan
    #[error("duplicate-id: node '{0}' already exists")]
    DuplicateId(NodeId),

    /// `dependsOn`, an output reference or a structural reference names a missing node
    #[error("dangling-reference: node '{node}' references unknown node '{reference}'")]
    DanglingReference { node: NodeId, reference: NodeId },

    /// The dependency graph contains a cycle
    #[error("cycle-detected: {}", join_ids(.cycle))]
    CycleDetected { cycle: Vec<NodeId> },

    /// A runner job uses a build output that has never succeeded
    #[error("build-precondition-unmet: runner '{runner}' needs a successful run of build '{build}'")]
    BuildPreconditionUnmet { runner: NodeId, build: NodeId },

    /// A reference points at a node of the wrong kind
    #[error("kind-mismatch: node '{node}' expects '{reference}' to be {expected}, found {found}")]
    KindMismatch {
        node: NodeId,
        reference: NodeId,
        expected: NodeKind,
        found: NodeKind,
    },

    /// One identity is bound to both a runner job and a controller
    #[error("shared-identity: identity '{identity}' is used by runner '{runner}' and controller '{controller}'")]
    SharedIdentity {
        identity: NodeId,
        runner: NodeId,
        controller: NodeId,
    },

    /// A compute node uses an identity declared for another job family
    #[error("identity-family-mismatch: {node} is a {expected} job but identity '{identity}' belongs to the {found} family")]
    IdentityFamilyMismatch {
        node: NodeId,
        identity: NodeId,
        expected: JobFamily,
        found: JobFamily,
    },

    /// A build run is recorded as succeeded but carries no image
    #[error("corrupt-build-record: run {run} of build '{build}' succeeded without an image")]
    CorruptBuildRecord { build: NodeId, run: String },

    /// Only a single active controller instance is supported
    #[error("unsupported-concurrency: controller '{node}' requests {requested} instances, only 1 is supported")]
    UnsupportedConcurrency { node: NodeId, requested: u32 },

    /// An env binding references a secret that was never registered
    #[error("unknown-secret: node '{node}' references unregistered secret '{secret}'")]
    UnknownSecret { node: NodeId, secret: String },

    /// A literal env value equals a registered secret's value
    #[error("secret-embedded-as-literal: node '{node}' env '{name}' holds a secret value; use a secret reference")]
    SecretEmbeddedAsLiteral { node: NodeId, name: String },

    /// Two env bindings on one node share a name
    #[error("duplicate-env: node '{node}' binds '{name}' more than once")]
    DuplicateEnv { node: NodeId, name: String },

    /// A build-run transition not allowed by the build state machine
    #[error("invalid-build-transition: build '{build}' cannot move from {from} to {to}")]
    InvalidBuildTransition {
        build: NodeId,
        from: String,
        to: String,
    },
}

impl ValidationError {
    /// Stable machine-readable code, also the prefix of the Display output.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidNodeId(_) => "invalid-node-id",
            Self::DuplicateId(_) => "duplicate-id",
            Self::DanglingReference { .. } => "dangling-reference",
            Self::CycleDetected { .. } => "cycle-detected",
            Self::BuildPreconditionUnmet { .. } => "build-precondition-unmet",
            Self::KindMismatch { .. } => "kind-mismatch",
            Self::SharedIdentity { .. } => "shared-identity",
            Self::IdentityFamilyMismatch { .. } => "identity-family-mismatch",
            Self::CorruptBuildRecord { .. } => "corrupt-build-record",
            Self::UnsupportedConcurrency { .. } => "unsupported-concurrency",
            Self::UnknownSecret { .. } => "unknown-secret",
            Self::SecretEmbeddedAsLiteral { .. } => "secret-embedded-as-literal",
            Self::DuplicateEnv { .. } => "duplicate-env",
            Self::InvalidBuildTransition { .. } => "invalid-build-transition",
        }
    }

    /// The node the error is attributed to, when there is exactly one.
    #[must_use]
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Self::InvalidNodeId(_) | Self::CycleDetected { .. } => None,
            Self::DuplicateId(node) => Some(node),
            Self::DanglingReference { node, .. }
            | Self::KindMismatch { node, .. }
            | Self::UnsupportedConcurrency { node, .. }
            | Self::UnknownSecret { node, .. }
            | Self::SecretEmbeddedAsLiteral { node, .. }
            | Self::DuplicateEnv { node, .. }
            | Self::IdentityFamilyMismatch { node, .. } => Some(node),
            Self::BuildPreconditionUnmet { runner, .. } => Some(runner),
            Self::SharedIdentity { identity, .. } => Some(identity),
            Self::InvalidBuildTransition { build, .. } | Self::CorruptBuildRecord { build, .. } => Some(build),
        }
    }
}

fn join_ids(ids: &[NodeId]) -> String {
    ids.iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failure classes an adapter must surface distinctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderErrorKind {
    /// Account or project quota exhausted
    QuotaExceeded,
    /// The acting identity lacks a grant the plan assumed it had
    PermissionDenied,
    /// Resource name already taken (another region, account or owner)
    ResourceNameCollision,
    /// A referenced provider-side resource is still being created
    DependencyNotReady,
    /// Referenced provider resource does not exist
    NotFound,
    /// Any other control-plane failure
    Transport,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::QuotaExceeded => "QuotaExceeded",
            Self::PermissionDenied => "PermissionDenied",
            Self::ResourceNameCollision => "ResourceNameCollision",
            Self::DependencyNotReady => "DependencyNotReady",
            Self::NotFound => "NotFound",
            Self::Transport => "Transport",
        };
        f.write_str(s)
    }
}

/// Error returned by a provider adapter for a specific node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[error("{kind} on node '{node}': {message}")]
pub struct ProviderError {
    /// Node whose operation failed
    pub node: NodeId,
    /// Failure class
    pub kind: ProviderErrorKind,
    /// Provider-supplied detail
    pub message: String,
}

impl ProviderError {
    /// Create a new provider error
    #[inline]
    pub fn new(node: NodeId, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            node,
            kind,
            message: message.into(),
        }
    }

    /// Only `DependencyNotReady` is eligible for automatic retry
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::DependencyNotReady)
    }
}

/// A runner launch that failed, possibly after starting some runners.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error} ({} runner(s) started before the failure)", .launched.len())]
pub struct LaunchError {
    /// Runners the provider did start
    pub launched: Vec<LaunchedRunner>,
    /// What stopped the rest
    pub error: ProviderError,
}

impl From<ProviderError> for LaunchError {
    fn from(error: ProviderError) -> Self {
        Self {
            launched: Vec::new(),
            error,
        }
    }
}

/// Outcome of an `apply` or `destroy` that did not fully succeed.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The plan was rejected before any provider call
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Some nodes failed; the report lists every node's outcome
    #[error("partial apply: {} succeeded, {} failed, {} skipped", .0.succeeded().len(), .0.failed().len(), .0.skipped().len())]
    Partial(Box<ApplyReport>),

    /// The caller's deadline passed; in-flight provider calls were left running
    #[error("apply timed out after {elapsed_ms}ms: {} succeeded, {} pending", .report.succeeded().len(), .report.pending().len())]
    Timeout {
        /// Milliseconds elapsed when the deadline hit
        elapsed_ms: u64,
        /// Outcomes gathered so far
        report: Box<ApplyReport>,
    },
}

impl ApplyError {
    /// Report of per-node outcomes, if the walk got past validation.
    #[must_use]
    pub fn report(&self) -> Option<&ApplyReport> {
        match self {
            Self::Validation(_) => None,
            Self::Partial(report) | Self::Timeout { report, .. } => Some(report),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for the schema
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required credential environment variable is unset or empty
    #[error("missing credential: environment variable '{0}' is not set")]
    MissingCredential(String),

    /// Provider section missing for the selected provider
    #[error("missing [{0}] section for selected provider")]
    MissingProviderSection(&'static str),

    /// A value failed validation
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    /// Building the plan from configuration failed
    #[error(transparent)]
    Plan(#[from] ValidationError),
}

/// Errors reading or writing persisted plan state
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// IO failure on the state file
    #[error("io error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// State file is not valid JSON for the schema
    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn display_starts_with_code() {
        let err = ValidationError::BuildPreconditionUnmet {
            runner: id("runner"),
            build: id("build"),
        };
        assert!(err.to_string().starts_with("build-precondition-unmet"));
        assert_eq!(err.code(), "build-precondition-unmet");
    }

    #[test]
    fn cycle_names_every_member() {
        let err = ValidationError::CycleDetected {
            cycle: vec![id("controller"), id("runner")],
        };
        let msg = err.to_string();
        assert!(msg.contains("controller"));
        assert!(msg.contains("runner"));
        assert!(err.node().is_none());
    }

    #[test]
    fn only_dependency_not_ready_retries() {
        let node = id("runner");
        for kind in [
            ProviderErrorKind::QuotaExceeded,
            ProviderErrorKind::PermissionDenied,
            ProviderErrorKind::ResourceNameCollision,
            ProviderErrorKind::NotFound,
            ProviderErrorKind::Transport,
        ] {
            assert!(!ProviderError::new(node.clone(), kind, "x").is_retryable());
        }
        assert!(ProviderError::new(node, ProviderErrorKind::DependencyNotReady, "x").is_retryable());
    }

    #[test]
    fn provider_error_names_node() {
        let err = ProviderError::new(id("controller"), ProviderErrorKind::PermissionDenied, "no");
        assert_eq!(err.to_string(), "PermissionDenied on node 'controller': no");
    }
}
