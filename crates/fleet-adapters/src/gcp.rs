//! GCP: Cloud Run
//!
//! Identities are service accounts. A grant is a project custom role bound
//! to the service account on the single job, service or log bucket it
//! names, never at project level. Runner and build jobs are Cloud Run jobs
//! and the controller is a Cloud Run service.

use crate::naming::ResourceNamer;
use crate::plane::{ControlPlane, ResourceSpec};
use crate::provisioner::{self, required, split_env, stable_uuid, Provisioner, CONTEXT_KIND};
use async_trait::async_trait;
use fleet_plan::config::GcpSection;
use fleet_plan::{
    Action, BuildJobRequest, ContextKey, ContextRequest, ControllerRequest, DispatchKey, GrantRequest,
    IdentityRequest, JobRequest, LaunchError, LaunchedRunner, LogSinkRequest, NodeId, NodeKind, NodeOutputs,
    ObservedResource, Provider, ProviderAdapter, ProviderError, ResolvedEnv, ResourceLimits,
    ResourceScope, RunnerExecution, RunnerLauncher, Secret, SecretHandle, VolumeSource,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

const SERVICE_ACCOUNT: &str = "service-account";
const CUSTOM_ROLE: &str = "iam-custom-role";
const IAM_MEMBER: &str = "iam-member";
const LOG_BUCKET: &str = "logging-bucket";
const REPOSITORY: &str = "artifact-registry-repository";
const JOB: &str = "cloud-run-job";
const SERVICE: &str = "cloud-run-service";
const BUCKET: &str = "storage-bucket";

/// Service account ids are 6-30 characters
const ACCOUNT_ID_LIMIT: usize = 30;

/// Cloud Run adapter.
pub struct GcpAdapter {
    settings: GcpSection,
    namer: ResourceNamer,
    accounts: ResourceNamer,
    provisioner: Provisioner,
}

impl GcpAdapter {
    /// Adapter for one project/region
    #[must_use]
    pub fn new(settings: GcpSection, fleet_name: &str, plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            namer: ResourceNamer::for_provider(Provider::Gcp, fleet_name),
            accounts: ResourceNamer::new(fleet_name, ACCOUNT_ID_LIMIT),
            settings,
            provisioner: Provisioner::new(plane),
        }
    }

    fn location_path(&self) -> String {
        format!("projects/{}/locations/{}", self.settings.project, self.settings.location)
    }

    fn name(&self, node: &NodeId) -> String {
        self.namer.name(&[node.as_str()])
    }

    fn account_id(&self, node: &NodeId) -> String {
        self.accounts.name(&[node.as_str()])
    }

    fn registry_url(&self) -> String {
        format!("{}-docker.pkg.dev/{}", self.settings.location, self.settings.project)
    }

    /// Kind and name of the record that represents a node
    #[must_use]
    pub fn primary_resource(&self, node: &NodeId, kind: NodeKind) -> (&'static str, String) {
        match kind {
            NodeKind::Identity => (SERVICE_ACCOUNT, self.account_id(node)),
            NodeKind::LogSink => (LOG_BUCKET, self.name(node)),
            NodeKind::BuildJob | NodeKind::RunnerJob => (JOB, self.name(node)),
            NodeKind::Controller => (SERVICE, self.name(node)),
            NodeKind::ContextLookup => (CONTEXT_KIND, node.to_string()),
        }
    }

    /// Full resource name a grant is bound on
    #[must_use]
    pub fn scope_name(&self, scope: &ResourceScope, scope_kind: NodeKind) -> String {
        let base = self.location_path();
        match scope {
            ResourceScope::Job(node) if scope_kind == NodeKind::Controller => {
                format!("{base}/services/{}", self.name(node))
            }
            ResourceScope::Job(node) => format!("{base}/jobs/{}", self.name(node)),
            ResourceScope::LogSink(node) => format!("{base}/buckets/{}", self.name(node)),
        }
    }

    fn container(image: &str, shape: &ContainerShape<'_>) -> Value {
        let (plain, secrets) = split_env(shape.env);
        let mut env: Vec<Value> = plain.iter().map(|(k, v)| json!({ "name": k, "value": v })).collect();
        env.extend(secrets.iter().map(|(k, handle)| {
            json!({
                "name": k,
                "valueSource": {
                    "secretKeyRef": {
                        "secret": handle.reference.trim_end_matches("/versions/latest"),
                        "version": "latest",
                    },
                },
            })
        }));
        json!({
            "image": image,
            "command": shape.command,
            "args": shape.args,
            "env": env,
            "resources": { "limits": limits(shape.resources) },
            "volumeMounts": shape.mounts,
        })
    }

    async fn job(&self, request: &JobRequest, args: &[String]) -> Result<ResourceSpec, ProviderError> {
        let node = &request.meta.node;
        let (identity, identity_outputs) = &request.identity;
        let email = required(node, identity_outputs, identity, "email")?;

        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        for mount in &request.volume_mounts {
            mounts.push(json!({ "name": mount.name, "mountPath": mount.mount_path }));
            match &mount.source {
                VolumeSource::Ephemeral => {
                    volumes.push(json!({ "name": mount.name, "emptyDir": { "medium": "MEMORY" } }));
                }
                VolumeSource::SharedFiles { share } => {
                    let bucket = format!("{}-{}", self.settings.project, crate::naming::sanitize(share));
                    self.provisioner
                        .put(
                            &request.meta,
                            ResourceSpec::new(BUCKET, &bucket, format!("projects/_/buckets/{bucket}"))
                                .with_properties(json!({
                                    "location": self.settings.location,
                                    "uniformBucketLevelAccess": true,
                                })),
                        )
                        .await?;
                    volumes.push(json!({ "name": mount.name, "gcs": { "bucket": bucket } }));
                }
            }
        }

        let name = self.name(node);
        let id = format!("{}/jobs/{name}", self.location_path());
        let shape = ContainerShape {
            command: &request.command,
            args,
            env: &request.env,
            resources: request.resources,
            mounts: &mounts,
        };
        let spec = ResourceSpec::new(JOB, &name, &id)
            .with_properties(json!({
                "template": {
                    "taskCount": 1,
                    "template": {
                        "serviceAccount": email,
                        "timeout": format!("{}s", request.timeout_secs),
                        "maxRetries": 0,
                        "containers": [Self::container(&request.image, &shape)],
                        "volumes": volumes,
                    },
                },
                "attributes": request.meta.attributes,
            }))
            .with_output("name", &name)
            .with_output("id", &id);
        Ok(spec)
    }
}

struct ContainerShape<'a> {
    command: &'a [String],
    args: &'a [String],
    env: &'a [ResolvedEnv],
    resources: ResourceLimits,
    mounts: &'a [Value],
}

fn limits(limits: ResourceLimits) -> Value {
    json!({
        "cpu": format!("{}m", limits.cpu_millicores),
        "memory": format!("{}Mi", limits.memory_mib),
    })
}

/// IAM permissions backing an abstract action on a job or service.
///
/// `StartOwnJob` maps to nothing: `run.jobs.run` belongs to the trigger
/// holder only.
#[must_use]
pub fn iam_permissions(action: Action, scope_kind: NodeKind) -> &'static [&'static str] {
    let service = scope_kind == NodeKind::Controller;
    match action {
        Action::StartOwnJob => &[],
        Action::DescribeOwnJob if service => &["run.services.get"],
        Action::StartTargetJob => &["run.jobs.run"],
        Action::DescribeOwnJob => &["run.jobs.get", "run.executions.get"],
        Action::WriteOwnLogStream => &["logging.logEntries.create"],
        Action::CreateJob => &["run.jobs.runWithOverrides"],
        Action::StopTargetJob => &["run.executions.cancel"],
    }
}

/// Custom role ids allow `[a-zA-Z0-9_.]`
fn role_id(name: &str) -> String {
    name.replace('-', "_")
}

#[async_trait]
impl ProviderAdapter for GcpAdapter {
    fn provider(&self) -> Provider {
        Provider::Gcp
    }

    async fn resolve_context(&self, request: &ContextRequest) -> Result<NodeOutputs, ProviderError> {
        let settings = &self.settings;
        self.provisioner
            .resolve_context(request, "gcp", |key| match key {
                ContextKey::Region => Some(settings.location.clone()),
                ContextKey::Project => Some(settings.project.clone()),
                _ => None,
            })
            .await
    }

    async fn create_identity(&self, request: &IdentityRequest) -> Result<NodeOutputs, ProviderError> {
        let account_id = self.account_id(&request.meta.node);
        let email = format!("{account_id}@{}.iam.gserviceaccount.com", self.settings.project);
        let id = format!("projects/{}/serviceAccounts/{email}", self.settings.project);
        let spec = ResourceSpec::new(SERVICE_ACCOUNT, &account_id, &id)
            .with_properties(json!({ "displayName": format!("{} identity", request.family) }))
            .with_output("name", &account_id)
            .with_output("id", &id)
            .with_output("email", &email)
            .with_output("unique_id", stable_uuid(&id).replace('-', ""));
        self.provisioner.put_primary(&request.meta, spec).await
    }

    async fn grant_permission(&self, request: &GrantRequest) -> Result<(), ProviderError> {
        let node = &request.meta.node;
        let email = required(node, &request.identity, &request.grant.identity, "email")?;
        let resource = self.scope_name(&request.grant.scope, request.scope_kind);
        let permissions: BTreeSet<&str> = request
            .grant
            .actions
            .iter()
            .flat_map(|a| iam_permissions(*a, request.scope_kind).iter().copied())
            .collect();

        let name = self.namer.name(&[request.grant.slug().as_str()]);
        let role = format!("projects/{}/roles/{}", self.settings.project, role_id(&name));
        self.provisioner
            .put(
                &request.meta,
                ResourceSpec::new(CUSTOM_ROLE, &name, &role).with_properties(json!({
                    "title": name,
                    "includedPermissions": permissions,
                    "stage": "GA",
                })),
            )
            .await?;

        let member = format!("serviceAccount:{email}");
        self.provisioner
            .put(
                &request.meta,
                ResourceSpec::new(IAM_MEMBER, &name, format!("{resource} {role} {member}"))
                    .with_properties(json!({ "resource": resource, "role": role, "member": member })),
            )
            .await?;
        tracing::debug!(node = %node, resource = %resource, "iam member bound");
        Ok(())
    }

    async fn create_log_sink(&self, request: &LogSinkRequest) -> Result<NodeOutputs, ProviderError> {
        let name = self.name(&request.meta.node);
        let id = format!("{}/buckets/{name}", self.location_path());
        let spec = ResourceSpec::new(LOG_BUCKET, &name, &id)
            .with_properties(json!({ "retentionDays": request.retention_days, "family": request.family }))
            .with_output("name", &name)
            .with_output("id", &id);
        self.provisioner.put_primary(&request.meta, spec).await
    }

    async fn create_build_job(&self, request: &BuildJobRequest) -> Result<NodeOutputs, ProviderError> {
        let meta = &request.job.meta;
        let repository = &request.destination.repository;
        self.provisioner
            .put(
                meta,
                ResourceSpec::new(
                    REPOSITORY,
                    repository,
                    format!("{}/repositories/{repository}", self.location_path()),
                )
                .with_properties(json!({ "format": "DOCKER" })),
            )
            .await?;

        let registry_url = self.registry_url();
        let args = request.kaniko_args(&registry_url);
        let spec = self
            .job(&request.job, &args)
            .await?
            .with_output("registry_url", &registry_url)
            .with_output("repository_url", format!("{registry_url}/{repository}"));
        self.provisioner.put_primary(meta, spec).await
    }

    async fn create_runner_job(&self, request: &JobRequest) -> Result<NodeOutputs, ProviderError> {
        let spec = self.job(request, &request.args).await?;
        self.provisioner.put_primary(&request.meta, spec).await
    }

    async fn create_controller(&self, request: &ControllerRequest) -> Result<NodeOutputs, ProviderError> {
        let node = &request.meta.node;
        let target = required(node, &request.target, &request.trigger_target, "id")?;
        let (identity, identity_outputs) = &request.identity;
        let email = required(node, identity_outputs, identity, "email")?;

        let name = self.name(node);
        let id = format!("{}/services/{name}", self.location_path());
        let hash = &stable_uuid(&self.settings.project)[..8];
        let uri = format!("https://{name}-{hash}.{}.run.app", self.settings.location);
        let shape = ContainerShape {
            command: &[],
            args: &[],
            env: &request.env,
            resources: request.resources,
            mounts: &[],
        };
        let spec = ResourceSpec::new(SERVICE, &name, &id)
            .with_properties(json!({
                "template": {
                    "serviceAccount": email,
                    "scaling": {
                        "minInstanceCount": request.concurrency,
                        "maxInstanceCount": request.concurrency,
                    },
                    "containers": [Self::container(&request.image, &shape)],
                },
                "ingress": "INGRESS_TRAFFIC_INTERNAL_ONLY",
                "triggerTarget": target,
                "attributes": request.meta.attributes,
            }))
            .with_output("name", &name)
            .with_output("id", &id)
            .with_output("uri", &uri)
            .with_output("endpoint", &uri);
        self.provisioner.put_primary(&request.meta, spec).await
    }

    async fn observe(&self, node: &NodeId, kind: NodeKind) -> Result<Option<ObservedResource>, ProviderError> {
        let (record_kind, name) = self.primary_resource(node, kind);
        self.provisioner.observe(node, record_kind, &name).await
    }

    async fn put_secret(&self, secret: &Secret) -> Result<SecretHandle, ProviderError> {
        let name = self.namer.name(&[secret.name.as_str()]);
        let project = &self.settings.project;
        self.provisioner
            .put_secret(secret, &name, |name| {
                format!("projects/{project}/secrets/{name}/versions/latest")
            })
            .await
    }

    async fn destroy(&self, node: &NodeId, _kind: NodeKind) -> Result<(), ProviderError> {
        self.provisioner.destroy(node).await
    }
}

#[async_trait]
impl RunnerLauncher for GcpAdapter {
    async fn runner_executions(&self, target: &NodeId) -> Result<Vec<RunnerExecution>, ProviderError> {
        let name = self.name(target);
        let job = format!("{}/jobs/{name}", self.location_path());
        provisioner::runner_executions(self.provisioner.plane().as_ref(), target, JOB, &name, |id| {
            format!("{job}/executions/{id}")
        })
        .await
    }

    /// One `jobs.run` per key; the key is the execution's idempotency token.
    async fn launch(&self, target: &NodeId, keys: &[DispatchKey]) -> Result<Vec<LaunchedRunner>, LaunchError> {
        let name = self.name(target);
        let job = format!("{}/jobs/{name}", self.location_path());
        provisioner::launch_runners(self.provisioner.plane().as_ref(), target, (JOB, &name), keys, 1, |id| {
            format!("{job}/executions/{id}")
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plane::InMemoryControlPlane;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn adapter() -> GcpAdapter {
        let settings = GcpSection {
            project: "ci-project".into(),
            location: "europe-north1".into(),
        };
        GcpAdapter::new(settings, "gha-runner", Arc::new(InMemoryControlPlane::new()))
    }

    #[test]
    fn trigger_binding_is_on_the_job() {
        let name = adapter().scope_name(&ResourceScope::Job(id("runner")), NodeKind::RunnerJob);
        assert_eq!(name, "projects/ci-project/locations/europe-north1/jobs/gha-runner-runner");
    }

    #[test]
    fn account_ids_fit_the_limit() {
        let adapter = adapter();
        let account = adapter.account_id(&id("identity-runner-with-a-long-name"));
        assert!(account.len() <= ACCOUNT_ID_LIMIT);
        assert!(account.len() >= 6);
    }

    #[test]
    fn controller_permissions_differ_from_jobs() {
        assert_eq!(iam_permissions(Action::DescribeOwnJob, NodeKind::Controller), &["run.services.get"]);
        assert_eq!(
            iam_permissions(Action::DescribeOwnJob, NodeKind::RunnerJob),
            &["run.jobs.get", "run.executions.get"]
        );
        assert!(iam_permissions(Action::StartOwnJob, NodeKind::RunnerJob).is_empty());
        assert_eq!(role_id("gha-runner-x"), "gha_runner_x");
    }
}
