//! Provider Adapter
//!
//! The capability interface every cloud implements. Apply resolves each
//! node into a fully concrete request (images resolved, output references
//! substituted, secrets replaced by provider handles) and calls exactly one
//! `create_*` operation per node. Create operations are upserts keyed by
//! node id; `observe` lets apply skip nodes whose desired state has not
//! changed.
//!
//! Requests never carry secret values. The only call that sees one is
//! `put_secret`.

use crate::binder::PermissionGrant;
use crate::error::ProviderError;
use crate::node::{ContextKey, RegistryTarget, VolumeMount};
use crate::outputs::NodeOutputs;
use crate::secret::{Secret, SecretHandle};
use crate::types::{JobFamily, NodeId, NodeKind, Provider, ResourceLimits};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Fields shared by every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Node being applied
    pub node: NodeId,
    /// Opaque provider attributes
    pub attributes: BTreeMap<String, String>,
    /// Labels/tags; not part of the fingerprint
    #[serde(skip_serializing, default)]
    pub labels: BTreeMap<String, String>,
    /// Hash of the desired state, recorded by the adapter with the resource
    #[serde(skip_serializing, default)]
    pub fingerprint: String,
    /// Uniqueness key for this desired state of this node
    #[serde(skip_serializing, default)]
    pub idempotency_key: String,
}

impl RequestMeta {
    /// Meta for a node with its attributes and labels
    #[must_use]
    pub fn new(
        node: NodeId,
        attributes: BTreeMap<String, String>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            node,
            attributes,
            labels,
            fingerprint: String::new(),
            idempotency_key: String::new(),
        }
    }
}

/// An env value after apply-time resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvedValue {
    /// Plain value (literal or a substituted node output)
    Literal(String),
    /// Provider-native secret reference
    Secret(SecretHandle),
}

/// A resolved env binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEnv {
    /// Variable name
    pub name: String,
    /// Resolved value
    pub value: ResolvedValue,
}

impl ResolvedEnv {
    /// Literal value, if not a secret
    #[must_use]
    pub fn literal(&self) -> Option<&str> {
        match &self.value {
            ResolvedValue::Literal(v) => Some(v),
            ResolvedValue::Secret(_) => None,
        }
    }
}

/// Resolve read-only context values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRequest {
    /// Common fields
    pub meta: RequestMeta,
    /// Values to look up
    pub lookups: BTreeSet<ContextKey>,
}

/// Create a credential principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRequest {
    /// Common fields
    pub meta: RequestMeta,
    /// Family the identity serves
    pub family: JobFamily,
}

/// Attach one grant to an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRequest {
    /// Compute node the grant belongs to
    pub meta: RequestMeta,
    /// Grant to attach
    pub grant: PermissionGrant,
    /// Kind of the node whose resource the grant is scoped to
    pub scope_kind: NodeKind,
    /// Outputs of the identity receiving the grant
    pub identity: NodeOutputs,
    /// For trigger grants: the target job's identity and its outputs
    pub scope_identity: Option<(NodeId, NodeOutputs)>,
}

/// Create a log destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSinkRequest {
    /// Common fields
    pub meta: RequestMeta,
    /// Family whose logs land here
    pub family: JobFamily,
    /// Retention in days
    pub retention_days: u32,
}

/// Create or update a run-once job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Common fields
    pub meta: RequestMeta,
    /// Resolved image reference
    pub image: String,
    /// Entrypoint override
    pub command: Vec<String>,
    /// Arguments
    pub args: Vec<String>,
    /// CPU/memory
    pub resources: ResourceLimits,
    /// Resolved env, in declaration order
    pub env: Vec<ResolvedEnv>,
    /// Volume mounts
    pub volume_mounts: Vec<VolumeMount>,
    /// Identity node id and outputs
    pub identity: (NodeId, NodeOutputs),
    /// Log sink node id and outputs
    pub log_sink: (NodeId, NodeOutputs),
    /// Context outputs, when the job declares a context
    pub context: Option<NodeOutputs>,
    /// Per-execution timeout
    pub timeout_secs: u32,
}

/// Create or update an image build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJobRequest {
    /// Container shape (Kaniko executor)
    pub job: JobRequest,
    /// Dockerfile path
    pub dockerfile: String,
    /// Build context URL
    pub context_url: String,
    /// Multi-stage target
    pub target: Option<String>,
    /// Destination repository; the adapter creates it if missing
    pub destination: RegistryTarget,
}

impl BuildJobRequest {
    /// Kaniko arguments for this build, given the resolved registry URL.
    #[must_use]
    pub fn kaniko_args(&self, registry_url: &str) -> Vec<String> {
        crate::node::kaniko_args(
            &self.dockerfile,
            &self.context_url,
            self.target.as_deref(),
            &self.destination,
            &self.job.args,
            registry_url,
        )
    }
}

/// Create or update the long-running controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRequest {
    /// Common fields
    pub meta: RequestMeta,
    /// Resolved image reference
    pub image: String,
    /// Runner job this controller triggers
    pub trigger_target: NodeId,
    /// Outputs of the trigger target
    pub target: NodeOutputs,
    /// Active instances (always 1)
    pub concurrency: u32,
    /// Resolved env, in declaration order
    pub env: Vec<ResolvedEnv>,
    /// CPU/memory
    pub resources: ResourceLimits,
    /// Identity node id and outputs
    pub identity: (NodeId, NodeOutputs),
    /// Log sink node id and outputs
    pub log_sink: (NodeId, NodeOutputs),
    /// Context outputs
    pub context: Option<NodeOutputs>,
}

/// A fully resolved request for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NodeRequest {
    /// Context lookup
    Context(ContextRequest),
    /// Identity
    Identity(IdentityRequest),
    /// Log sink
    LogSink(LogSinkRequest),
    /// Build job
    BuildJob(BuildJobRequest),
    /// Runner job
    RunnerJob(JobRequest),
    /// Controller
    Controller(ControllerRequest),
}

impl NodeRequest {
    /// Common fields
    #[must_use]
    pub fn meta(&self) -> &RequestMeta {
        match self {
            Self::Context(r) => &r.meta,
            Self::Identity(r) => &r.meta,
            Self::LogSink(r) => &r.meta,
            Self::BuildJob(r) => &r.job.meta,
            Self::RunnerJob(r) => &r.meta,
            Self::Controller(r) => &r.meta,
        }
    }

    fn meta_mut(&mut self) -> &mut RequestMeta {
        match self {
            Self::Context(r) => &mut r.meta,
            Self::Identity(r) => &mut r.meta,
            Self::LogSink(r) => &mut r.meta,
            Self::BuildJob(r) => &mut r.job.meta,
            Self::RunnerJob(r) => &mut r.meta,
            Self::Controller(r) => &mut r.meta,
        }
    }

    /// Kind of node this request creates
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Context(_) => NodeKind::ContextLookup,
            Self::Identity(_) => NodeKind::Identity,
            Self::LogSink(_) => NodeKind::LogSink,
            Self::BuildJob(_) => NodeKind::BuildJob,
            Self::RunnerJob(_) => NodeKind::RunnerJob,
            Self::Controller(_) => NodeKind::Controller,
        }
    }

    /// Stamp the fingerprint and idempotency key.
    ///
    /// The fingerprint covers the request and the grants applied with it,
    /// but not labels, so out-of-band tag edits never cause an update.
    ///
    /// # Errors
    /// `Transport` if the request cannot be serialized.
    pub fn seal(mut self, grants: &[PermissionGrant]) -> Result<Self, ProviderError> {
        let fingerprint = fingerprint(&(&self, grants)).map_err(|err| {
            ProviderError::new(
                self.meta().node.clone(),
                crate::error::ProviderErrorKind::Transport,
                format!("cannot fingerprint request: {err}"),
            )
        })?;
        let meta = self.meta_mut();
        meta.idempotency_key = format!("{}-{}", meta.node, &fingerprint[..16]);
        meta.fingerprint = fingerprint;
        Ok(self)
    }
}

/// Hex sha256 of the JSON form of `value`.
///
/// # Errors
/// Propagates serialization failures.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Current provider-side state of a node's resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedResource {
    /// Fingerprint recorded at the last create/update
    pub fingerprint: String,
    /// Outputs the resource currently exposes
    pub outputs: NodeOutputs,
}

/// Translates abstract nodes into one cloud's primitives.
///
/// Every `create_*` is an upsert: calling it again for the same node
/// replaces the desired state rather than creating a second resource.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider this adapter targets
    fn provider(&self) -> Provider;

    /// Resolve region/network/account values
    async fn resolve_context(&self, request: &ContextRequest) -> Result<NodeOutputs, ProviderError>;

    /// Create a credential principal
    async fn create_identity(&self, request: &IdentityRequest) -> Result<NodeOutputs, ProviderError>;

    /// Attach a grant to an identity
    async fn grant_permission(&self, request: &GrantRequest) -> Result<(), ProviderError>;

    /// Create a log destination
    async fn create_log_sink(&self, request: &LogSinkRequest) -> Result<NodeOutputs, ProviderError>;

    /// Create the image build job and its destination registry
    async fn create_build_job(&self, request: &BuildJobRequest) -> Result<NodeOutputs, ProviderError>;

    /// Create the runner job definition
    async fn create_runner_job(&self, request: &JobRequest) -> Result<NodeOutputs, ProviderError>;

    /// Create the controller service
    async fn create_controller(&self, request: &ControllerRequest) -> Result<NodeOutputs, ProviderError>;

    /// Current state of a node's resource, `None` if absent
    async fn observe(
        &self,
        node: &NodeId,
        kind: NodeKind,
    ) -> Result<Option<ObservedResource>, ProviderError>;

    /// Store a secret in the provider's secret facility
    async fn put_secret(&self, secret: &Secret) -> Result<SecretHandle, ProviderError>;

    /// Delete a node's resource; `NotFound` when already gone
    async fn destroy(&self, node: &NodeId, kind: NodeKind) -> Result<(), ProviderError>;

    /// Dispatch a resolved request to the matching create operation.
    async fn create(&self, request: &NodeRequest) -> Result<NodeOutputs, ProviderError> {
        match request {
            NodeRequest::Context(r) => self.resolve_context(r).await,
            NodeRequest::Identity(r) => self.create_identity(r).await,
            NodeRequest::LogSink(r) => self.create_log_sink(r).await,
            NodeRequest::BuildJob(r) => self.create_build_job(r).await,
            NodeRequest::RunnerJob(r) => self.create_runner_job(r).await,
            NodeRequest::Controller(r) => self.create_controller(r).await,
        }
    }
}
