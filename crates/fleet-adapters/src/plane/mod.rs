//! Control plane seam
//!
//! Adapters translate nodes into provider resources; a `ControlPlane`
//! stores them. Real deployments would put an SDK client behind this
//! trait. The workspace ships the in-memory plane used for dry runs and
//! tests.

mod memory;

pub use memory::InMemoryControlPlane;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_plan::{NodeId, NodeOutputs, ProviderError, ProviderErrorKind, SecretValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Desired state of one provider resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Provider resource type, e.g. `ecs-task-definition`
    pub kind: String,
    /// Provider-side name, unique per kind
    pub name: String,
    /// Provider resource id (ARN, Azure resource id, GCP resource name)
    pub id: String,
    /// Plan node owning the resource; `None` for shared infrastructure
    pub owner: Option<NodeId>,
    /// Provider properties
    pub properties: serde_json::Value,
    /// Tags; never compared
    pub tags: BTreeMap<String, String>,
    /// Fingerprint of the request that produced this state
    pub fingerprint: String,
    /// Outputs exposed once the resource exists
    pub outputs: NodeOutputs,
}

impl ResourceSpec {
    /// Resource with empty properties and outputs
    pub fn new(kind: impl Into<String>, name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            id: id.into(),
            owner: None,
            properties: serde_json::Value::Null,
            tags: BTreeMap::new(),
            fingerprint: String::new(),
            outputs: NodeOutputs::new(),
        }
    }

    /// Set the owning node
    #[must_use]
    pub fn owned_by(mut self, node: &NodeId) -> Self {
        self.owner = Some(node.clone());
        self
    }

    /// Set provider properties
    #[must_use]
    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }

    /// Set tags
    #[must_use]
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Set fingerprint
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    /// Add an output
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

/// A stored provider resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Desired state last written
    pub spec: ResourceSpec,
    /// First write
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

/// One execution of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    /// Provider execution id
    pub id: String,
    /// Idempotency token the execution was started with
    pub token: String,
    /// Still running or starting
    pub running: bool,
}

/// A token the plane refused to start, like an entry of ECS `failures[]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    /// Token of the execution that did not start
    pub token: String,
    /// Why
    pub reason: PlaneError,
}

/// Answer to `run_job`: a run request can partly succeed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// Executions started by this call, in request order
    pub started: Vec<Execution>,
    /// Executions that already existed for a requested token
    pub existing: Vec<Execution>,
    /// Tokens that were not started
    pub failures: Vec<RunFailure>,
}

/// Errors raised by a control plane, before they are tied to a node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaneError {
    /// Resource does not exist
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// Name is held by another owner or account
    #[error("{kind} name '{name}' is already taken")]
    NameTaken { kind: String, name: String },

    /// Account/project limit reached
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Caller lacks the permission
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// A resource this one refers to is still being created
    #[error("not ready: {0}")]
    NotReady(String),

    /// Anything else on the wire
    #[error("transport: {0}")]
    Transport(String),
}

impl PlaneError {
    /// Provider error kind for this failure
    #[must_use]
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::NotFound { .. } => ProviderErrorKind::NotFound,
            Self::NameTaken { .. } => ProviderErrorKind::ResourceNameCollision,
            Self::QuotaExceeded(_) => ProviderErrorKind::QuotaExceeded,
            Self::AccessDenied(_) => ProviderErrorKind::PermissionDenied,
            Self::NotReady(_) => ProviderErrorKind::DependencyNotReady,
            Self::Transport(_) => ProviderErrorKind::Transport,
        }
    }

    /// Attach the node the failure belongs to
    #[must_use]
    pub fn for_node(&self, node: &NodeId) -> ProviderError {
        ProviderError::new(node.clone(), self.kind(), self.to_string())
    }
}

/// Provider control-plane operations adapters are written against.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create or replace a resource.
    ///
    /// Fails with `NameTaken` if the name belongs to another owner.
    async fn upsert(&self, spec: ResourceSpec) -> Result<ResourceRecord, PlaneError>;

    /// Resource by kind and name
    async fn get(&self, kind: &str, name: &str) -> Result<Option<ResourceRecord>, PlaneError>;

    /// Every resource owned by a node
    async fn owned_by(&self, owner: &NodeId) -> Result<Vec<ResourceRecord>, PlaneError>;

    /// Delete a resource
    async fn delete(&self, kind: &str, name: &str) -> Result<(), PlaneError>;

    /// Read-only data source, e.g. `aws:default-subnets`
    async fn lookup(&self, key: &str) -> Result<String, PlaneError>;

    /// Store a secret with the fingerprint of its value as a tag, returning
    /// the provider's version id
    async fn put_secret(&self, name: &str, value: &SecretValue, fingerprint: &str) -> Result<String, PlaneError>;

    /// Fingerprint tag of the stored secret, `None` if it does not exist
    async fn secret_fingerprint(&self, name: &str) -> Result<Option<String>, PlaneError>;

    /// Start one execution of a job per token.
    ///
    /// A token that already has an execution is not started again; that
    /// execution is returned under `existing`.
    async fn run_job(
        &self,
        kind: &str,
        name: &str,
        started_by: &str,
        tokens: &[String],
    ) -> Result<RunOutcome, PlaneError>;

    /// Every execution of a job the plane still knows, finished or not
    async fn executions(&self, kind: &str, name: &str) -> Result<Vec<Execution>, PlaneError>;
}
