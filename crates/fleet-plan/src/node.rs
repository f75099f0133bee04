//! Node model
//!
//! A plan is an arena of `Node`s. Each node carries a kind-specific spec,
//! an explicit `depends_on` set, opaque provider attributes and labels.
//! Structural references (identity, log sink, trigger target, output refs)
//! are edges too; `Node::references` enumerates them with the kind each one
//! must point at.

use crate::secret::SecretRef;
use crate::types::{JobFamily, NodeId, NodeKind, ResourceLimits};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A typed infrastructure node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique id within the plan
    pub id: NodeId,
    /// Kind-specific specification
    pub spec: NodeSpec,
    /// Explicit ordering dependencies
    #[serde(default)]
    pub depends_on: BTreeSet<NodeId>,
    /// Opaque provider-specific attributes, passed through to the adapter
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Labels/tags; excluded from reconcile so out-of-band edits are ignored
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Node {
    fn with_spec(id: NodeId, spec: NodeSpec) -> Self {
        Self {
            id,
            spec,
            depends_on: BTreeSet::new(),
            attributes: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    /// Identity node for a job family
    #[must_use]
    pub fn identity(id: NodeId, family: JobFamily) -> Self {
        Self::with_spec(id, NodeSpec::Identity(IdentitySpec { family }))
    }

    /// Log sink node for a job family
    #[must_use]
    pub fn log_sink(id: NodeId, family: JobFamily) -> Self {
        Self::with_spec(id, NodeSpec::LogSink(LogSinkSpec::new(family)))
    }

    /// Context lookup node
    #[must_use]
    pub fn context(id: NodeId, spec: ContextSpec) -> Self {
        Self::with_spec(id, NodeSpec::ContextLookup(spec))
    }

    /// Image build job node
    #[must_use]
    pub fn build_job(id: NodeId, spec: BuildSpec) -> Self {
        Self::with_spec(id, NodeSpec::BuildJob(spec))
    }

    /// Runner job node
    #[must_use]
    pub fn runner_job(id: NodeId, spec: JobSpec) -> Self {
        Self::with_spec(id, NodeSpec::RunnerJob(spec))
    }

    /// Controller node
    #[must_use]
    pub fn controller(id: NodeId, spec: ControllerSpec) -> Self {
        Self::with_spec(id, NodeSpec::Controller(spec))
    }

    /// Add an explicit dependency
    #[must_use]
    pub fn depends_on(mut self, id: NodeId) -> Self {
        self.depends_on.insert(id);
        self
    }

    /// Add a provider attribute
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Add a label
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Node kind, derived from the spec
    #[inline]
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.spec.kind()
    }

    /// Job shape for build and runner jobs
    #[must_use]
    pub fn job(&self) -> Option<&JobSpec> {
        match &self.spec {
            NodeSpec::BuildJob(build) => Some(&build.job),
            NodeSpec::RunnerJob(job) => Some(job),
            _ => None,
        }
    }

    /// Identity referenced by a compute node
    #[must_use]
    pub fn identity_ref(&self) -> Option<&NodeId> {
        match &self.spec {
            NodeSpec::BuildJob(build) => Some(&build.job.identity),
            NodeSpec::RunnerJob(job) => Some(&job.identity),
            NodeSpec::Controller(ctrl) => Some(&ctrl.identity),
            _ => None,
        }
    }

    /// Log sink referenced by a compute node
    #[must_use]
    pub fn log_sink_ref(&self) -> Option<&NodeId> {
        match &self.spec {
            NodeSpec::BuildJob(build) => Some(&build.job.log_sink),
            NodeSpec::RunnerJob(job) => Some(&job.log_sink),
            NodeSpec::Controller(ctrl) => Some(&ctrl.log_sink),
            _ => None,
        }
    }

    /// Env bindings of a compute node
    #[must_use]
    pub fn env(&self) -> &[EnvBinding] {
        match &self.spec {
            NodeSpec::BuildJob(build) => &build.job.env,
            NodeSpec::RunnerJob(job) => &job.env,
            NodeSpec::Controller(ctrl) => &ctrl.env,
            _ => &[],
        }
    }

    /// Every reference this node makes to another node.
    #[must_use]
    pub fn references(&self) -> Vec<Reference> {
        let mut refs: Vec<Reference> = self
            .depends_on
            .iter()
            .map(|id| Reference::new(id.clone(), ReferenceRole::DependsOn))
            .collect();

        if let Some(identity) = self.identity_ref() {
            refs.push(Reference::new(identity.clone(), ReferenceRole::Identity));
        }
        if let Some(sink) = self.log_sink_ref() {
            refs.push(Reference::new(sink.clone(), ReferenceRole::LogSink));
        }

        let (image, context) = match &self.spec {
            NodeSpec::BuildJob(build) => (Some(&build.job.image), build.job.context.as_ref()),
            NodeSpec::RunnerJob(job) => (Some(&job.image), job.context.as_ref()),
            NodeSpec::Controller(ctrl) => {
                refs.push(Reference::new(
                    ctrl.trigger_target.clone(),
                    ReferenceRole::TriggerTarget,
                ));
                (Some(&ctrl.image), ctrl.context.as_ref())
            }
            _ => (None, None),
        };
        if let Some(ImageRef::LatestBuild(build)) = image {
            refs.push(Reference::new(build.clone(), ReferenceRole::BuildImage));
        }
        if let Some(ctx) = context {
            refs.push(Reference::new(ctx.clone(), ReferenceRole::Context));
        }

        for binding in self.env() {
            if let EnvValue::NodeOutput(output) = &binding.value {
                refs.push(Reference::new(output.node.clone(), ReferenceRole::Output));
            }
        }
        refs
    }

    /// Ids this node must wait for during apply.
    ///
    /// Build-image references resolve from the build ledger, not from the
    /// build node's apply outputs, so they do not order the walk.
    #[must_use]
    pub fn ordering_dependencies(&self) -> BTreeSet<NodeId> {
        self.references()
            .into_iter()
            .filter(|r| r.role.orders_apply())
            .map(|r| r.target)
            .collect()
    }
}

/// A reference from one node to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Referenced node
    pub target: NodeId,
    /// Why the node is referenced
    pub role: ReferenceRole,
}

impl Reference {
    fn new(target: NodeId, role: ReferenceRole) -> Self {
        Self { target, role }
    }
}

/// Purpose of a reference; determines the kind the target must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceRole {
    /// Explicit `depends_on` edge
    DependsOn,
    /// Compute node's identity
    Identity,
    /// Compute node's log sink
    LogSink,
    /// Compute node's context lookup
    Context,
    /// Controller's trigger target
    TriggerTarget,
    /// Image taken from the last successful build
    BuildImage,
    /// Env value taken from another node's outputs
    Output,
}

impl ReferenceRole {
    /// Kind the referenced node must have, if constrained
    #[must_use]
    pub fn expected_kind(self) -> Option<NodeKind> {
        match self {
            Self::DependsOn | Self::Output => None,
            Self::Identity => Some(NodeKind::Identity),
            Self::LogSink => Some(NodeKind::LogSink),
            Self::Context => Some(NodeKind::ContextLookup),
            Self::TriggerTarget => Some(NodeKind::RunnerJob),
            Self::BuildImage => Some(NodeKind::BuildJob),
        }
    }

    /// Whether the reference becomes an edge in the apply order
    #[must_use]
    pub fn orders_apply(self) -> bool {
        !matches!(self, Self::BuildImage)
    }
}

/// Kind-specific node specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NodeSpec {
    /// Credential principal
    Identity(IdentitySpec),
    /// Image build job
    BuildJob(BuildSpec),
    /// Runner job definition
    RunnerJob(JobSpec),
    /// Autoscaler service
    Controller(ControllerSpec),
    /// Log destination
    LogSink(LogSinkSpec),
    /// Read-only lookups
    ContextLookup(ContextSpec),
}

impl NodeSpec {
    /// Kind of this spec
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Identity(_) => NodeKind::Identity,
            Self::BuildJob(_) => NodeKind::BuildJob,
            Self::RunnerJob(_) => NodeKind::RunnerJob,
            Self::Controller(_) => NodeKind::Controller,
            Self::LogSink(_) => NodeKind::LogSink,
            Self::ContextLookup(_) => NodeKind::ContextLookup,
        }
    }
}

/// Identity node: one principal per job family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySpec {
    /// Family the identity serves
    pub family: JobFamily,
}

/// Log sink node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSinkSpec {
    /// Family whose logs land here
    pub family: JobFamily,
    /// Retention in days
    pub retention_days: u32,
}

impl LogSinkSpec {
    /// Sink with 30-day retention
    #[must_use]
    pub fn new(family: JobFamily) -> Self {
        Self {
            family,
            retention_days: 30,
        }
    }
}

/// Values a context lookup can resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextKey {
    /// Region / location
    Region,
    /// AWS account id
    Account,
    /// Subnet ids
    Subnets,
    /// Security group ids
    SecurityGroups,
    /// Azure subscription id
    Subscription,
    /// Azure resource group
    ResourceGroup,
    /// GCP project id
    Project,
}

impl ContextKey {
    /// Output key under which the lookup result is published
    #[must_use]
    pub fn output_key(self) -> &'static str {
        match self {
            Self::Region => "region",
            Self::Account => "account_id",
            Self::Subnets => "subnets",
            Self::SecurityGroups => "security_groups",
            Self::Subscription => "subscription_id",
            Self::ResourceGroup => "resource_group",
            Self::Project => "project",
        }
    }
}

/// Context lookup node: read-only values injected into other nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSpec {
    /// Values to resolve
    pub lookups: BTreeSet<ContextKey>,
}

impl ContextSpec {
    /// Resolve the given keys
    #[must_use]
    pub fn new(keys: impl IntoIterator<Item = ContextKey>) -> Self {
        Self {
            lookups: keys.into_iter().collect(),
        }
    }
}

/// Where a container image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageRef {
    /// Fully qualified image reference
    Literal(String),
    /// Image produced by the last successful run of a build node
    LatestBuild(NodeId),
}

impl ImageRef {
    /// Literal image
    #[must_use]
    pub fn literal(image: impl Into<String>) -> Self {
        Self::Literal(image.into())
    }
}

/// Reference to a named output of another node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    /// Node producing the value
    pub node: NodeId,
    /// Output key (`task_definition_arn`, `name`, ...)
    pub key: String,
}

/// Value of an environment binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvValue {
    /// Plain value
    Literal(String),
    /// Registered secret, passed by reference
    Secret(SecretRef),
    /// Output of a node applied earlier in the walk
    NodeOutput(OutputRef),
}

/// An ordered environment binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvBinding {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: EnvValue,
}

impl EnvBinding {
    /// Literal binding
    #[must_use]
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: EnvValue::Literal(value.into()),
        }
    }

    /// Secret reference binding
    #[must_use]
    pub fn secret(name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: EnvValue::Secret(SecretRef::new(secret)),
        }
    }

    /// Node output binding
    #[must_use]
    pub fn output(name: impl Into<String>, node: NodeId, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: EnvValue::NodeOutput(OutputRef {
                node,
                key: key.into(),
            }),
        }
    }
}

/// Backing storage for a volume mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeSource {
    /// Scratch storage that lives with the job execution
    Ephemeral,
    /// Provider file share / bucket, created by the adapter if missing
    SharedFiles {
        /// Share or bucket name
        share: String,
    },
}

/// A volume mounted into a job's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Volume name
    pub name: String,
    /// Mount path inside the container
    pub mount_path: String,
    /// Backing storage
    pub source: VolumeSource,
}

impl VolumeMount {
    /// New mount
    #[must_use]
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>, source: VolumeSource) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
            source,
        }
    }
}

/// Shared job shape for build and runner jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Container image
    pub image: ImageRef,
    /// Entrypoint override
    #[serde(default)]
    pub command: Vec<String>,
    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// CPU/memory limits
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Ordered environment bindings
    #[serde(default)]
    pub env: Vec<EnvBinding>,
    /// Volume mounts
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    /// Identity node
    pub identity: NodeId,
    /// Log sink node
    pub log_sink: NodeId,
    /// Optional context lookup node
    #[serde(default)]
    pub context: Option<NodeId>,
    /// Per-execution timeout in seconds
    #[serde(default = "default_replica_timeout")]
    pub timeout_secs: u32,
}

fn default_replica_timeout() -> u32 {
    1200
}

impl JobSpec {
    /// Job with default limits and no env
    #[must_use]
    pub fn new(image: ImageRef, identity: NodeId, log_sink: NodeId) -> Self {
        Self {
            image,
            command: Vec::new(),
            args: Vec::new(),
            resources: ResourceLimits::default(),
            env: Vec::new(),
            volume_mounts: Vec::new(),
            identity,
            log_sink,
            context: None,
            timeout_secs: default_replica_timeout(),
        }
    }

    /// With command
    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// With args
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// With resource limits
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    /// Append env binding
    #[must_use]
    pub fn with_env(mut self, binding: EnvBinding) -> Self {
        self.env.push(binding);
        self
    }

    /// Append volume mount
    #[must_use]
    pub fn with_volume(mut self, mount: VolumeMount) -> Self {
        self.volume_mounts.push(mount);
        self
    }

    /// With context lookup
    #[must_use]
    pub fn with_context(mut self, context: NodeId) -> Self {
        self.context = Some(context);
        self
    }
}

/// Where a build pushes its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryTarget {
    /// Repository name inside the provider registry
    pub repository: String,
    /// Tag pushed by each build
    pub tag: String,
}

/// Kaniko build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Container shape (image is the Kaniko executor)
    pub job: JobSpec,
    /// Dockerfile path inside the context
    pub dockerfile: String,
    /// Build context (git URL)
    pub context_url: String,
    /// Multi-stage target
    #[serde(default)]
    pub target: Option<String>,
    /// Destination repository
    pub destination: RegistryTarget,
}

impl BuildSpec {
    /// Kaniko arguments for this build, given the resolved registry URL.
    #[must_use]
    pub fn kaniko_args(&self, registry_url: &str) -> Vec<String> {
        kaniko_args(
            &self.dockerfile,
            &self.context_url,
            self.target.as_deref(),
            &self.destination,
            &self.job.args,
            registry_url,
        )
    }
}

/// Kaniko executor arguments; extra `args` are appended after the build flags.
#[must_use]
pub fn kaniko_args(
    dockerfile: &str,
    context_url: &str,
    target: Option<&str>,
    destination: &RegistryTarget,
    args: &[String],
    registry_url: &str,
) -> Vec<String> {
    let mut out = vec![
        format!("--dockerfile={dockerfile}"),
        format!("--context={context_url}"),
        format!(
            "--destination={registry_url}/{}:{}",
            destination.repository, destination.tag
        ),
    ];
    if let Some(target) = target {
        out.push(format!("--target={target}"));
    }
    out.extend(args.iter().cloned());
    out
}

/// Long-running autoscaler service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSpec {
    /// Controller image
    pub image: ImageRef,
    /// Runner job this controller launches
    pub trigger_target: NodeId,
    /// Active instances; only 1 is supported
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Ordered environment bindings
    #[serde(default)]
    pub env: Vec<EnvBinding>,
    /// CPU/memory limits
    #[serde(default = "controller_resources")]
    pub resources: ResourceLimits,
    /// Identity node
    pub identity: NodeId,
    /// Log sink node
    pub log_sink: NodeId,
    /// Optional context lookup node
    #[serde(default)]
    pub context: Option<NodeId>,
}

fn default_concurrency() -> u32 {
    1
}

fn controller_resources() -> ResourceLimits {
    ResourceLimits::new(256, 512)
}

impl ControllerSpec {
    /// Controller with a single instance and small default limits
    #[must_use]
    pub fn new(image: ImageRef, trigger_target: NodeId, identity: NodeId, log_sink: NodeId) -> Self {
        Self {
            image,
            trigger_target,
            concurrency: default_concurrency(),
            env: Vec::new(),
            resources: controller_resources(),
            identity,
            log_sink,
            context: None,
        }
    }

    /// Append env binding
    #[must_use]
    pub fn with_env(mut self, binding: EnvBinding) -> Self {
        self.env.push(binding);
        self
    }

    /// With context lookup
    #[must_use]
    pub fn with_context(mut self, context: NodeId) -> Self {
        self.context = Some(context);
        self
    }

    /// With resource limits
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn controller_references_include_trigger_target() {
        let node = Node::controller(
            id("controller"),
            ControllerSpec::new(
                ImageRef::literal("ghcr.io/x/autoscaler:latest"),
                id("runner"),
                id("identity-ctrl"),
                id("logs"),
            )
            .with_env(EnvBinding::output("TASK_DEFINITION_ARN", id("runner"), "task_definition_arn")),
        );
        let refs = node.references();
        assert!(refs
            .iter()
            .any(|r| r.target == id("runner") && r.role == ReferenceRole::TriggerTarget));
        assert!(refs
            .iter()
            .any(|r| r.target == id("runner") && r.role == ReferenceRole::Output));
        assert!(refs
            .iter()
            .any(|r| r.target == id("identity-ctrl") && r.role == ReferenceRole::Identity));
    }

    #[test]
    fn latest_build_image_does_not_order_apply() {
        let node = Node::runner_job(
            id("runner"),
            JobSpec::new(ImageRef::LatestBuild(id("build")), id("identity-runner"), id("logs")),
        );
        let deps = node.ordering_dependencies();
        assert!(!deps.contains(&id("build")));
        assert!(deps.contains(&id("identity-runner")));
        assert!(deps.contains(&id("logs")));
    }

    #[test]
    fn kaniko_args_follow_destination() {
        let spec = BuildSpec {
            job: JobSpec::new(
                ImageRef::literal("gcr.io/kaniko-project/executor:v1.23.0"),
                id("identity-build"),
                id("logs"),
            ),
            dockerfile: "images/Dockerfile.gha".into(),
            context_url: "git://github.com/example/runners.git".into(),
            target: Some("nonroot".into()),
            destination: RegistryTarget {
                repository: "results".into(),
                tag: "latest".into(),
            },
        };
        let args = spec.kaniko_args("123.dkr.ecr.eu-north-1.amazonaws.com");
        assert_eq!(
            args,
            vec![
                "--dockerfile=images/Dockerfile.gha",
                "--context=git://github.com/example/runners.git",
                "--destination=123.dkr.ecr.eu-north-1.amazonaws.com/results:latest",
                "--target=nonroot",
            ]
        );
    }

    #[test]
    fn node_spec_serializes_with_kind_tag() {
        let node = Node::identity(id("identity-runner"), JobFamily::Runner);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["spec"]["kind"], "identity");
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, node);
    }
}
