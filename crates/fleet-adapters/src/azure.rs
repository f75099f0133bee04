//! Azure: Container Apps
//!
//! Identities are user-assigned managed identities. Each grant becomes a
//! custom role definition plus a role assignment whose scope is the one
//! job, app or workspace the grant names. Runner and build jobs are
//! manually triggered Container Apps jobs; the controller is a Container
//! App pinned to its replica count. All of them live in one managed
//! environment created on first use.

use crate::naming::ResourceNamer;
use crate::plane::{ControlPlane, ResourceSpec};
use crate::provisioner::{self, required, split_env, stable_uuid, Provisioner, CONTEXT_KIND};
use async_trait::async_trait;
use fleet_plan::config::AzureSection;
use fleet_plan::{
    Action, BuildJobRequest, ContextKey, ContextRequest, ControllerRequest, DispatchKey, GrantRequest,
    IdentityRequest, JobRequest, LaunchError, LaunchedRunner, LogSinkRequest, NodeId, NodeKind, NodeOutputs,
    ObservedResource, Provider, ProviderAdapter, ProviderError, ResolvedEnv, ResourceLimits,
    ResourceScope, RunnerExecution, RunnerLauncher, Secret, SecretHandle, VolumeSource,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::OnceCell;

const IDENTITY: &str = "user-assigned-identity";
const ROLE_DEFINITION: &str = "role-definition";
const ROLE_ASSIGNMENT: &str = "role-assignment";
const WORKSPACE: &str = "log-analytics-workspace";
const ENVIRONMENT: &str = "container-app-environment";
const JOB: &str = "container-app-job";
const APP: &str = "container-app";
const FILE_SHARE: &str = "storage-file-share";

/// Key Vault names are limited to 24 characters
const VAULT_NAME_LIMIT: usize = 24;

/// Container Apps job adapter.
pub struct AzureAdapter {
    settings: AzureSection,
    namer: ResourceNamer,
    provisioner: Provisioner,
    environment: OnceCell<String>,
}

impl AzureAdapter {
    /// Adapter for one subscription/resource group
    #[must_use]
    pub fn new(settings: AzureSection, fleet_name: &str, plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            namer: ResourceNamer::for_provider(Provider::Azure, fleet_name),
            settings,
            provisioner: Provisioner::new(plane),
            environment: OnceCell::new(),
        }
    }

    fn resource_id(&self, provider_type: &str, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{provider_type}/{name}",
            self.settings.subscription_id, self.settings.resource_group
        )
    }

    fn name(&self, node: &NodeId) -> String {
        self.namer.name(&[node.as_str()])
    }

    fn registry_url(&self) -> String {
        format!("{}.azurecr.io", self.settings.registry_name)
    }

    fn vault_name(&self) -> String {
        ResourceNamer::new(self.namer.prefix(), VAULT_NAME_LIMIT).name(&["kv"])
    }

    /// Kind and name of the record that represents a node
    #[must_use]
    pub fn primary_resource(&self, node: &NodeId, kind: NodeKind) -> (&'static str, String) {
        match kind {
            NodeKind::Identity => (IDENTITY, self.name(node)),
            NodeKind::LogSink => (WORKSPACE, self.name(node)),
            NodeKind::BuildJob | NodeKind::RunnerJob => (JOB, self.name(node)),
            NodeKind::Controller => (APP, self.name(node)),
            NodeKind::ContextLookup => (CONTEXT_KIND, node.to_string()),
        }
    }

    /// Resource id a grant is scoped to
    #[must_use]
    pub fn scope_id(&self, scope: &ResourceScope, scope_kind: NodeKind) -> String {
        match scope {
            ResourceScope::Job(node) if scope_kind == NodeKind::Controller => {
                self.resource_id("Microsoft.App/containerApps", &self.name(node))
            }
            ResourceScope::Job(node) => self.resource_id("Microsoft.App/jobs", &self.name(node)),
            ResourceScope::LogSink(node) => {
                self.resource_id("Microsoft.OperationalInsights/workspaces", &self.name(node))
            }
        }
    }

    async fn environment(&self, node: &NodeId) -> Result<&String, ProviderError> {
        self.environment
            .get_or_try_init(|| async {
                let name = self.namer.name(&["env"]);
                let id = self.resource_id("Microsoft.App/managedEnvironments", &name);
                let record = self
                    .provisioner
                    .ensure_shared(
                        node,
                        ResourceSpec::new(ENVIRONMENT, &name, id)
                            .with_properties(json!({ "location": self.settings.location }))
                            .with_output("default_domain", format!(
                                "{}.{}.azurecontainerapps.io",
                                &stable_uuid(&name)[..8],
                                self.settings.location
                            )),
                    )
                    .await?;
                Ok::<_, ProviderError>(record.spec.id)
            })
            .await
    }

    fn container(&self, name: &str, image: &str, shape: &ContainerShape<'_>) -> Value {
        let (plain, secrets) = split_env(shape.env);
        let mut env: Vec<Value> = plain.iter().map(|(k, v)| json!({ "name": k, "value": v })).collect();
        env.extend(
            secrets
                .iter()
                .map(|(k, handle)| json!({ "name": k, "secretRef": secret_ref(&handle.name) })),
        );
        json!({
            "name": name,
            "image": image,
            "command": shape.command,
            "args": shape.args,
            "env": env,
            "resources": resources(shape.resources),
            "volumeMounts": shape.mounts,
        })
    }

    fn secrets(env: &[ResolvedEnv], identity_id: &str) -> Vec<Value> {
        let (_, secrets) = split_env(env);
        secrets
            .iter()
            .map(|(_, handle)| {
                json!({
                    "name": secret_ref(&handle.name),
                    "keyVaultUrl": handle.reference,
                    "identity": identity_id,
                })
            })
            .collect()
    }

    async fn job(&self, request: &JobRequest, args: &[String]) -> Result<ResourceSpec, ProviderError> {
        let node = &request.meta.node;
        let environment = self.environment(node).await?.clone();
        let (identity, identity_outputs) = &request.identity;
        let identity_id = required(node, identity_outputs, identity, "id")?;

        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        for mount in &request.volume_mounts {
            mounts.push(json!({ "volumeName": mount.name, "mountPath": mount.mount_path }));
            match &mount.source {
                VolumeSource::Ephemeral => volumes.push(json!({ "name": mount.name, "storageType": "EmptyDir" })),
                VolumeSource::SharedFiles { share } => {
                    let share_name = crate::naming::sanitize(share);
                    self.provisioner
                        .put(
                            &request.meta,
                            ResourceSpec::new(
                                FILE_SHARE,
                                &share_name,
                                format!("{environment}/storages/{share_name}"),
                            )
                            .with_properties(json!({ "accessMode": "ReadWrite", "quotaGiB": 100 })),
                        )
                        .await?;
                    volumes.push(json!({
                        "name": mount.name,
                        "storageType": "AzureFile",
                        "storageName": share_name,
                    }));
                }
            }
        }

        let name = self.name(node);
        let id = self.resource_id("Microsoft.App/jobs", &name);
        let shape = ContainerShape {
            command: &request.command,
            args,
            env: &request.env,
            resources: request.resources,
            mounts: &mounts,
        };
        let spec = ResourceSpec::new(JOB, &name, &id)
            .with_properties(json!({
                "location": self.settings.location,
                "environmentId": environment,
                "identity": { "type": "UserAssigned", "userAssignedIdentities": [identity_id] },
                "configuration": {
                    "triggerType": "Manual",
                    "replicaTimeout": request.timeout_secs,
                    "replicaRetryLimit": 0,
                    "manualTriggerConfig": { "parallelism": 1, "replicaCompletionCount": 1 },
                    "secrets": Self::secrets(&request.env, identity_id),
                    "registries": [{ "server": self.registry_url(), "identity": identity_id }],
                },
                "template": {
                    "containers": [self.container(node.as_str(), &request.image, &shape)],
                    "volumes": volumes,
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

/// Container Apps secret names allow `[a-z0-9-]` only
fn secret_ref(name: &str) -> String {
    crate::naming::sanitize(name)
}

fn resources(limits: ResourceLimits) -> Value {
    json!({
        "cpu": f64::from(limits.cpu_millicores) / 1000.0,
        "memory": format!("{}Gi", f64::from(limits.memory_mib) / 1024.0),
    })
}

/// Azure RBAC actions backing an abstract action on a job or app.
///
/// Executions are started by the platform or by a trigger holder, so
/// `StartOwnJob` maps to no action.
#[must_use]
pub fn rbac_actions(action: Action, scope_kind: NodeKind) -> Vec<String> {
    let resource = if scope_kind == NodeKind::Controller { "containerApps" } else { "jobs" };
    match action {
        Action::StartOwnJob => Vec::new(),
        Action::CreateJob | Action::StartTargetJob => {
            vec![format!("Microsoft.App/{resource}/start/action")]
        }
        Action::DescribeOwnJob => vec![
            format!("Microsoft.App/{resource}/read"),
            format!("Microsoft.App/{resource}/executions/read"),
        ],
        Action::StopTargetJob => vec![format!("Microsoft.App/{resource}/stop/action")],
        Action::WriteOwnLogStream => {
            vec!["Microsoft.OperationalInsights/workspaces/sharedKeys/action".to_string()]
        }
    }
}

#[async_trait]
impl ProviderAdapter for AzureAdapter {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    async fn resolve_context(&self, request: &ContextRequest) -> Result<NodeOutputs, ProviderError> {
        let settings = &self.settings;
        self.provisioner
            .resolve_context(request, "azure", |key| match key {
                ContextKey::Region => Some(settings.location.clone()),
                ContextKey::Subscription => Some(settings.subscription_id.clone()),
                ContextKey::ResourceGroup => Some(settings.resource_group.clone()),
                _ => None,
            })
            .await
    }

    async fn create_identity(&self, request: &IdentityRequest) -> Result<NodeOutputs, ProviderError> {
        let name = self.name(&request.meta.node);
        let id = self.resource_id("Microsoft.ManagedIdentity/userAssignedIdentities", &name);
        let spec = ResourceSpec::new(IDENTITY, &name, &id)
            .with_properties(json!({ "location": self.settings.location, "family": request.family }))
            .with_output("name", &name)
            .with_output("id", &id)
            .with_output("client_id", stable_uuid(&format!("client:{id}")))
            .with_output("principal_id", stable_uuid(&format!("principal:{id}")));
        self.provisioner.put_primary(&request.meta, spec).await
    }

    async fn grant_permission(&self, request: &GrantRequest) -> Result<(), ProviderError> {
        let node = &request.meta.node;
        let principal = required(node, &request.identity, &request.grant.identity, "principal_id")?;
        let scope = self.scope_id(&request.grant.scope, request.scope_kind);
        let actions: BTreeSet<String> = request
            .grant
            .actions
            .iter()
            .flat_map(|a| rbac_actions(*a, request.scope_kind))
            .collect();

        let name = self.namer.name(&[request.grant.slug().as_str()]);
        let definition_id = format!(
            "/subscriptions/{}/providers/Microsoft.Authorization/roleDefinitions/{}",
            self.settings.subscription_id,
            stable_uuid(&name)
        );
        self.provisioner
            .put(
                &request.meta,
                ResourceSpec::new(ROLE_DEFINITION, &name, &definition_id).with_properties(json!({
                    "roleName": name,
                    "permissions": [{ "actions": actions }],
                    "assignableScopes": [scope],
                })),
            )
            .await?;
        self.provisioner
            .put(
                &request.meta,
                ResourceSpec::new(
                    ROLE_ASSIGNMENT,
                    &name,
                    format!(
                        "{scope}/providers/Microsoft.Authorization/roleAssignments/{}",
                        stable_uuid(&format!("{name}:{principal}"))
                    ),
                )
                .with_properties(json!({
                    "principalId": principal,
                    "principalType": "ServicePrincipal",
                    "roleDefinitionId": definition_id,
                    "scope": scope,
                })),
            )
            .await?;
        tracing::debug!(node = %node, scope = %scope, "role assigned");
        Ok(())
    }

    async fn create_log_sink(&self, request: &LogSinkRequest) -> Result<NodeOutputs, ProviderError> {
        let name = self.name(&request.meta.node);
        let id = self.resource_id("Microsoft.OperationalInsights/workspaces", &name);
        let spec = ResourceSpec::new(WORKSPACE, &name, &id)
            .with_properties(json!({
                "location": self.settings.location,
                "sku": "PerGB2018",
                "retentionInDays": request.retention_days,
            }))
            .with_output("name", &name)
            .with_output("id", &id)
            .with_output("customer_id", stable_uuid(&format!("workspace:{id}")));
        self.provisioner.put_primary(&request.meta, spec).await
    }

    async fn create_build_job(&self, request: &BuildJobRequest) -> Result<NodeOutputs, ProviderError> {
        let registry_url = self.registry_url();
        let args = request.kaniko_args(&registry_url);
        let spec = self
            .job(&request.job, &args)
            .await?
            .with_output("registry_url", &registry_url)
            .with_output(
                "repository_url",
                format!("{registry_url}/{}", request.destination.repository),
            );
        self.provisioner.put_primary(&request.job.meta, spec).await
    }

    async fn create_runner_job(&self, request: &JobRequest) -> Result<NodeOutputs, ProviderError> {
        let spec = self.job(request, &request.args).await?;
        self.provisioner.put_primary(&request.meta, spec).await
    }

    async fn create_controller(&self, request: &ControllerRequest) -> Result<NodeOutputs, ProviderError> {
        let node = &request.meta.node;
        let environment = self.environment(node).await?.clone();
        let target = required(node, &request.target, &request.trigger_target, "id")?;
        let (identity, identity_outputs) = &request.identity;
        let identity_id = required(node, identity_outputs, identity, "id")?;

        let domain = self
            .provisioner
            .plane()
            .get(ENVIRONMENT, &self.namer.name(&["env"]))
            .await
            .map_err(|err| err.for_node(node))?
            .and_then(|r| r.spec.outputs.get("default_domain").cloned())
            .unwrap_or_else(|| format!("{}.azurecontainerapps.io", self.settings.location));

        let name = self.name(node);
        let id = self.resource_id("Microsoft.App/containerApps", &name);
        let fqdn = format!("{name}.{domain}");
        let shape = ContainerShape {
            command: &[],
            args: &[],
            env: &request.env,
            resources: request.resources,
            mounts: &[],
        };
        let spec = ResourceSpec::new(APP, &name, &id)
            .with_properties(json!({
                "location": self.settings.location,
                "environmentId": environment,
                "identity": { "type": "UserAssigned", "userAssignedIdentities": [identity_id] },
                "configuration": {
                    "activeRevisionsMode": "Single",
                    "secrets": Self::secrets(&request.env, identity_id),
                },
                "template": {
                    "containers": [self.container(node.as_str(), &request.image, &shape)],
                    "scale": { "minReplicas": request.concurrency, "maxReplicas": request.concurrency },
                },
                "triggerTarget": target,
                "attributes": request.meta.attributes,
            }))
            .with_output("name", &name)
            .with_output("id", &id)
            .with_output("fqdn", &fqdn)
            .with_output("endpoint", format!("https://{fqdn}"));
        self.provisioner.put_primary(&request.meta, spec).await
    }

    async fn observe(&self, node: &NodeId, kind: NodeKind) -> Result<Option<ObservedResource>, ProviderError> {
        let (record_kind, name) = self.primary_resource(node, kind);
        self.provisioner.observe(node, record_kind, &name).await
    }

    async fn put_secret(&self, secret: &Secret) -> Result<SecretHandle, ProviderError> {
        let name = secret_ref(&secret.name);
        let vault = self.vault_name();
        self.provisioner
            .put_secret(secret, &name, |name| format!("https://{vault}.vault.azure.net/secrets/{name}"))
            .await
    }

    async fn destroy(&self, node: &NodeId, _kind: NodeKind) -> Result<(), ProviderError> {
        self.provisioner.destroy(node).await
    }
}

#[async_trait]
impl RunnerLauncher for AzureAdapter {
    async fn runner_executions(&self, target: &NodeId) -> Result<Vec<RunnerExecution>, ProviderError> {
        let name = self.name(target);
        let job = self.resource_id("Microsoft.App/jobs", &name);
        provisioner::runner_executions(self.provisioner.plane().as_ref(), target, JOB, &name, |id| {
            format!("{job}/executions/{id}")
        })
        .await
    }

    /// One start call per key; the key is the execution's idempotency token.
    async fn launch(&self, target: &NodeId, keys: &[DispatchKey]) -> Result<Vec<LaunchedRunner>, LaunchError> {
        let name = self.name(target);
        let job = self.resource_id("Microsoft.App/jobs", &name);
        provisioner::launch_runners(self.provisioner.plane().as_ref(), target, (JOB, &name), keys, 1, |id| {
            format!("{job}/executions/{id}")
        })
        .await
    }
}
