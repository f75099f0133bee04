//! AWS: ECS Fargate
//!
//! | Node          | Resources                                         |
//! |---------------|---------------------------------------------------|
//! | identity      | IAM role trusted by `ecs-tasks.amazonaws.com`     |
//! | grant         | inline IAM policy on the role, one per grant      |
//! | log sink      | CloudWatch log group `/ecs/{name}`                |
//! | build job     | ECR repository + Kaniko task definition           |
//! | runner job    | task definition                                   |
//! | controller    | task definition + ECS service                     |
//!
//! The cluster and the task-execution role are shared by every job and
//! created on first use.

use crate::naming::ResourceNamer;
use crate::plane::{ControlPlane, ResourceSpec};
use crate::provisioner::{self, required, split_env, Provisioner, CONTEXT_KIND};
use async_trait::async_trait;
use fleet_plan::config::AwsSection;
use fleet_plan::{
    Action, BuildJobRequest, ContextKey, ContextRequest, ControllerRequest, DispatchKey, GrantRequest,
    IdentityRequest, JobRequest, LaunchError, LaunchedRunner, LogSinkRequest, NodeId, NodeKind, NodeOutputs,
    ObservedResource, Provider, ProviderAdapter, ProviderError, ResolvedEnv, ResourceLimits,
    ResourceScope, RunnerExecution, RunnerLauncher, Secret, SecretHandle, VolumeMount, VolumeSource,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::OnceCell;

const ROLE: &str = "iam-role";
const POLICY: &str = "iam-policy";
const LOG_GROUP: &str = "cloudwatch-log-group";
const REPOSITORY: &str = "ecr-repository";
const TASK_DEFINITION: &str = "ecs-task-definition";
const SERVICE: &str = "ecs-service";
const CLUSTER: &str = "ecs-cluster";
const FILE_SYSTEM: &str = "efs-file-system";

/// Fargate accepts at most ten tasks per `RunTask`
const RUN_TASK_LIMIT: usize = 10;

#[derive(Debug, Clone)]
struct SharedInfra {
    cluster_arn: String,
    execution_role_arn: String,
}

/// ECS Fargate adapter.
pub struct AwsAdapter {
    settings: AwsSection,
    namer: ResourceNamer,
    provisioner: Provisioner,
    shared: OnceCell<SharedInfra>,
}

impl AwsAdapter {
    /// Adapter for one account/region, naming resources after `fleet_name`
    #[must_use]
    pub fn new(settings: AwsSection, fleet_name: &str, plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            namer: ResourceNamer::for_provider(Provider::Aws, fleet_name),
            settings,
            provisioner: Provisioner::new(plane),
            shared: OnceCell::new(),
        }
    }

    fn arn(&self, service: &str, resource: &str) -> String {
        format!(
            "arn:aws:{service}:{}:{}:{resource}",
            self.settings.region, self.settings.account_id
        )
    }

    fn role_arn(&self, name: &str) -> String {
        format!("arn:aws:iam::{}:role/{name}", self.settings.account_id)
    }

    fn task_arn(&self, execution: &str) -> String {
        self.arn("ecs", &format!("task/{}/{execution}", self.settings.cluster_name))
    }

    fn cluster_arn(&self) -> String {
        self.arn("ecs", &format!("cluster/{}", self.settings.cluster_name))
    }

    fn family(&self, node: &NodeId) -> String {
        self.namer.name(&[node.as_str()])
    }

    fn task_definition_arn(&self, family: &str) -> String {
        self.arn("ecs", &format!("task-definition/{family}"))
    }

    fn log_group(&self, node: &NodeId) -> String {
        format!("/ecs/{}", self.namer.name(&[node.as_str()]))
    }

    fn registry_url(&self) -> String {
        format!(
            "{}.dkr.ecr.{}.amazonaws.com",
            self.settings.account_id, self.settings.region
        )
    }

    /// Kind and name of the record that represents a node
    #[must_use]
    pub fn primary_resource(&self, node: &NodeId, kind: NodeKind) -> (&'static str, String) {
        match kind {
            NodeKind::Identity => (ROLE, self.family(node)),
            NodeKind::LogSink => (LOG_GROUP, self.log_group(node)),
            NodeKind::BuildJob | NodeKind::RunnerJob => (TASK_DEFINITION, self.family(node)),
            NodeKind::Controller => (SERVICE, self.family(node)),
            NodeKind::ContextLookup => (CONTEXT_KIND, node.to_string()),
        }
    }

    /// Resource ARN a grant is scoped to; never a wildcard over other jobs
    #[must_use]
    pub fn scope_arn(&self, scope: &ResourceScope) -> String {
        match scope {
            ResourceScope::Job(node) => self.arn("ecs", &format!("task-definition/{}:*", self.family(node))),
            ResourceScope::LogSink(node) => self.arn("logs", &format!("log-group:{}:*", self.log_group(node))),
        }
    }

    async fn shared(&self, node: &NodeId) -> Result<&SharedInfra, ProviderError> {
        self.shared
            .get_or_try_init(|| async {
                let cluster = self
                    .provisioner
                    .ensure_shared(
                        node,
                        ResourceSpec::new(CLUSTER, &self.settings.cluster_name, self.cluster_arn())
                            .with_properties(json!({ "capacityProviders": ["FARGATE"] })),
                    )
                    .await?;
                let role_name = self.namer.name(&["task-execution"]);
                let role = self
                    .provisioner
                    .ensure_shared(
                        node,
                        ResourceSpec::new(ROLE, &role_name, self.role_arn(&role_name)).with_properties(json!({
                            "assumeRolePolicy": trust_policy(),
                            "managedPolicies": ["arn:aws:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy"],
                        })),
                    )
                    .await?;
                Ok::<_, ProviderError>(SharedInfra {
                    cluster_arn: cluster.spec.id,
                    execution_role_arn: role.spec.id,
                })
            })
            .await
    }

    fn container(&self, name: &str, image: &str, shape: &ContainerShape<'_>, log_group: &str) -> Value {
        let (plain, secrets) = split_env(shape.env);
        json!({
            "name": name,
            "image": image,
            "essential": true,
            "entryPoint": shape.command,
            "command": shape.args,
            "environment": plain.iter().map(|(k, v)| json!({ "name": k, "value": v })).collect::<Vec<_>>(),
            "secrets": secrets.iter().map(|(k, h)| json!({ "name": k, "valueFrom": h.reference })).collect::<Vec<_>>(),
            "mountPoints": shape.mounts.iter().map(|m| json!({ "sourceVolume": m.name, "containerPath": m.mount_path })).collect::<Vec<_>>(),
            "logConfiguration": {
                "logDriver": "awslogs",
                "options": {
                    "awslogs-group": log_group,
                    "awslogs-region": self.settings.region,
                    "awslogs-stream-prefix": name,
                },
            },
        })
    }

    async fn volumes(&self, request: &JobRequest) -> Result<Vec<Value>, ProviderError> {
        let mut volumes = Vec::new();
        for mount in &request.volume_mounts {
            match &mount.source {
                VolumeSource::Ephemeral => volumes.push(json!({ "name": mount.name })),
                VolumeSource::SharedFiles { share } => {
                    let name = self.namer.name(&[share.as_str()]);
                    let id = format!("fs-{}", &crate::provisioner::stable_uuid(&name)[..8]);
                    self.provisioner
                        .put(
                            &request.meta,
                            ResourceSpec::new(FILE_SYSTEM, &name, &id)
                                .with_properties(json!({ "encrypted": true })),
                        )
                        .await?;
                    volumes.push(json!({
                        "name": mount.name,
                        "efsVolumeConfiguration": { "fileSystemId": id, "transitEncryption": "ENABLED" },
                    }));
                }
            }
        }
        Ok(volumes)
    }

    async fn task_definition(
        &self,
        request: &JobRequest,
        args: &[String],
    ) -> Result<ResourceSpec, ProviderError> {
        let node = &request.meta.node;
        let shared = self.shared(node).await?.clone();
        let (identity, identity_outputs) = &request.identity;
        let task_role = required(node, identity_outputs, identity, "role_arn")?;
        let (sink, sink_outputs) = &request.log_sink;
        let log_group = required(node, sink_outputs, sink, "name")?;

        let family = self.family(node);
        let shape = ContainerShape {
            command: &request.command,
            args,
            env: &request.env,
            mounts: &request.volume_mounts,
        };
        let container = self.container(node.as_str(), &request.image, &shape, log_group);
        let ephemeral_gib = request
            .meta
            .attributes
            .get("ephemeral_storage_gib")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(21);

        let arn = self.task_definition_arn(&family);
        let spec = ResourceSpec::new(TASK_DEFINITION, &family, &arn)
            .with_properties(json!({
                "family": family,
                "requiresCompatibilities": ["FARGATE"],
                "networkMode": "awsvpc",
                "cpu": cpu_units(request.resources).to_string(),
                "memory": request.resources.memory_mib.to_string(),
                "taskRoleArn": task_role,
                "executionRoleArn": shared.execution_role_arn,
                "ephemeralStorage": { "sizeInGiB": ephemeral_gib },
                "volumes": self.volumes(request).await?,
                "stopTimeout": request.timeout_secs.min(120),
                "containerDefinitions": [container],
                "attributes": request.meta.attributes,
            }))
            .with_output("name", &family)
            .with_output("id", &arn)
            .with_output("task_definition_arn", &arn)
            .with_output("cluster_arn", &shared.cluster_arn)
            .with_output("cluster_name", &self.settings.cluster_name);
        Ok(spec)
    }
}

struct ContainerShape<'a> {
    command: &'a [String],
    args: &'a [String],
    env: &'a [ResolvedEnv],
    mounts: &'a [VolumeMount],
}

fn trust_policy() -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": "ecs-tasks.amazonaws.com" },
            "Action": "sts:AssumeRole",
        }],
    })
}

/// ECS CPU units (1024 per vCPU) for a millicore limit
fn cpu_units(resources: ResourceLimits) -> u32 {
    resources.cpu_millicores.saturating_mul(1024) / 1000
}

/// IAM actions backing an abstract action.
///
/// A task is started by whoever holds `ecs:RunTask` on its definition, so
/// a job's own role gets nothing for `StartOwnJob`.
#[must_use]
pub fn iam_actions(action: Action) -> &'static [&'static str] {
    match action {
        Action::StartOwnJob => &[],
        Action::CreateJob => &["ecs:RunTask"],
        Action::DescribeOwnJob => &["ecs:DescribeTasks", "ecs:DescribeTaskDefinition"],
        Action::WriteOwnLogStream => &["logs:CreateLogStream", "logs:PutLogEvents"],
        Action::StartTargetJob => &["ecs:StartTask"],
        Action::StopTargetJob => &["ecs:StopTask"],
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ProviderAdapter for AwsAdapter {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    async fn resolve_context(&self, request: &ContextRequest) -> Result<NodeOutputs, ProviderError> {
        let settings = &self.settings;
        self.provisioner
            .resolve_context(request, "aws", |key| match key {
                ContextKey::Region => Some(settings.region.clone()),
                ContextKey::Account => Some(settings.account_id.clone()),
                ContextKey::Subnets if !settings.subnets.is_empty() => Some(settings.subnets.join(",")),
                ContextKey::SecurityGroups if !settings.security_groups.is_empty() => {
                    Some(settings.security_groups.join(","))
                }
                _ => None,
            })
            .await
    }

    async fn create_identity(&self, request: &IdentityRequest) -> Result<NodeOutputs, ProviderError> {
        let name = self.family(&request.meta.node);
        let arn = self.role_arn(&name);
        let spec = ResourceSpec::new(ROLE, &name, &arn)
            .with_properties(json!({
                "assumeRolePolicy": trust_policy(),
                "path": "/",
                "family": request.family,
            }))
            .with_output("name", &name)
            .with_output("id", &arn)
            .with_output("role_arn", &arn);
        self.provisioner.put_primary(&request.meta, spec).await
    }

    async fn grant_permission(&self, request: &GrantRequest) -> Result<(), ProviderError> {
        let node = &request.meta.node;
        let role = required(node, &request.identity, &request.grant.identity, "name")?;
        let actions: BTreeSet<&str> = request
            .grant
            .actions
            .iter()
            .flat_map(|a| iam_actions(*a).iter().copied())
            .collect();

        let mut statement = json!({
            "Effect": "Allow",
            "Action": actions,
            "Resource": [self.scope_arn(&request.grant.scope)],
        });
        if matches!(request.grant.scope, ResourceScope::Job(_)) {
            statement["Condition"] = json!({ "ArnEquals": { "ecs:cluster": self.cluster_arn() } });
        }
        let mut statements = vec![statement];
        if let Some((target_identity, target_outputs)) = &request.scope_identity {
            let task_role = required(node, target_outputs, target_identity, "role_arn")?;
            let execution_role = &self.shared(node).await?.execution_role_arn;
            statements.push(json!({
                "Effect": "Allow",
                "Action": ["iam:PassRole"],
                "Resource": [task_role, execution_role],
                "Condition": { "StringEquals": { "iam:PassedToService": "ecs-tasks.amazonaws.com" } },
            }));
        }

        let name = self.namer.name(&[request.grant.slug().as_str()]);
        let spec = ResourceSpec::new(POLICY, &name, format!("{}/policy/{name}", self.role_arn(role)))
            .with_properties(json!({
                "role": role,
                "document": { "Version": "2012-10-17", "Statement": statements },
            }));
        self.provisioner.put(&request.meta, spec).await?;
        tracing::debug!(node = %node, role, policy = %name, "inline policy attached");
        Ok(())
    }

    async fn create_log_sink(&self, request: &LogSinkRequest) -> Result<NodeOutputs, ProviderError> {
        let name = self.log_group(&request.meta.node);
        let arn = self.arn("logs", &format!("log-group:{name}"));
        let spec = ResourceSpec::new(LOG_GROUP, &name, &arn)
            .with_properties(json!({ "retentionInDays": request.retention_days, "family": request.family }))
            .with_output("name", &name)
            .with_output("id", &arn);
        self.provisioner.put_primary(&request.meta, spec).await
    }

    async fn create_build_job(&self, request: &BuildJobRequest) -> Result<NodeOutputs, ProviderError> {
        let meta = &request.job.meta;
        let repository = &request.destination.repository;
        let repository_arn = self.arn("ecr", &format!("repository/{repository}"));
        self.provisioner
            .put(
                meta,
                ResourceSpec::new(REPOSITORY, repository, &repository_arn)
                    .with_properties(json!({ "imageTagMutability": "MUTABLE", "forceDelete": true })),
            )
            .await?;

        let registry_url = self.registry_url();
        let args = request.kaniko_args(&registry_url);
        let spec = self.task_definition(&request.job, &args).await?;
        let spec = spec
            .with_output("registry_url", &registry_url)
            .with_output("repository_url", format!("{registry_url}/{repository}"));
        self.provisioner.put_primary(meta, spec).await
    }

    async fn create_runner_job(&self, request: &JobRequest) -> Result<NodeOutputs, ProviderError> {
        let spec = self.task_definition(request, &request.args).await?;
        self.provisioner.put_primary(&request.meta, spec).await
    }

    async fn create_controller(&self, request: &ControllerRequest) -> Result<NodeOutputs, ProviderError> {
        let node = &request.meta.node;
        let shared = self.shared(node).await?.clone();
        let target_task = required(node, &request.target, &request.trigger_target, "task_definition_arn")?;
        let (identity, identity_outputs) = &request.identity;
        let task_role = required(node, identity_outputs, identity, "role_arn")?;
        let (sink, sink_outputs) = &request.log_sink;
        let log_group = required(node, sink_outputs, sink, "name")?;

        let family = self.family(node);
        let task_arn = self.task_definition_arn(&family);
        let shape = ContainerShape {
            command: &[],
            args: &[],
            env: &request.env,
            mounts: &[],
        };
        let container = self.container(node.as_str(), &request.image, &shape, log_group);
        self.provisioner
            .put(
                &request.meta,
                ResourceSpec::new(TASK_DEFINITION, &family, &task_arn).with_properties(json!({
                    "family": family,
                    "requiresCompatibilities": ["FARGATE"],
                    "networkMode": "awsvpc",
                    "cpu": cpu_units(request.resources).to_string(),
                    "memory": request.resources.memory_mib.to_string(),
                    "taskRoleArn": task_role,
                    "executionRoleArn": shared.execution_role_arn,
                    "containerDefinitions": [container],
                })),
            )
            .await?;

        let context = request.context.clone().unwrap_or_default();
        let subnets = context
            .get("subnets")
            .map_or_else(|| self.settings.subnets.clone(), |v| split_csv(v));
        let security_groups = context
            .get("security_groups")
            .map_or_else(|| self.settings.security_groups.clone(), |v| split_csv(v));

        let service_arn = self.arn(
            "ecs",
            &format!("service/{}/{family}", self.settings.cluster_name),
        );
        let spec = ResourceSpec::new(SERVICE, &family, &service_arn)
            .with_properties(json!({
                "cluster": shared.cluster_arn,
                "taskDefinition": task_arn,
                "desiredCount": request.concurrency,
                "launchType": "FARGATE",
                "triggerTarget": target_task,
                "networkConfiguration": {
                    "awsvpcConfiguration": {
                        "subnets": subnets,
                        "securityGroups": security_groups,
                        "assignPublicIp": "ENABLED",
                    },
                },
                "attributes": request.meta.attributes,
            }))
            .with_output("name", &family)
            .with_output("id", &service_arn)
            .with_output("service_arn", &service_arn)
            .with_output("task_definition_arn", &task_arn)
            .with_output("cluster_arn", &shared.cluster_arn);
        self.provisioner.put_primary(&request.meta, spec).await
    }

    async fn observe(&self, node: &NodeId, kind: NodeKind) -> Result<Option<ObservedResource>, ProviderError> {
        let (record_kind, name) = self.primary_resource(node, kind);
        self.provisioner.observe(node, record_kind, &name).await
    }

    async fn put_secret(&self, secret: &Secret) -> Result<SecretHandle, ProviderError> {
        let name = self.namer.name(&[secret.name.as_str()]);
        self.provisioner
            .put_secret(secret, &name, |name| self.arn("secretsmanager", &format!("secret:{name}")))
            .await
    }

    async fn destroy(&self, node: &NodeId, _kind: NodeKind) -> Result<(), ProviderError> {
        self.provisioner.destroy(node).await
    }
}

#[async_trait]
impl RunnerLauncher for AwsAdapter {
    async fn runner_executions(&self, target: &NodeId) -> Result<Vec<RunnerExecution>, ProviderError> {
        provisioner::runner_executions(
            self.provisioner.plane().as_ref(),
            target,
            TASK_DEFINITION,
            &self.family(target),
            |id| self.task_arn(id),
        )
        .await
    }

    /// One `RunTask` per batch; the key rides along as its `clientToken`.
    async fn launch(&self, target: &NodeId, keys: &[DispatchKey]) -> Result<Vec<LaunchedRunner>, LaunchError> {
        provisioner::launch_runners(
            self.provisioner.plane().as_ref(),
            target,
            (TASK_DEFINITION, &self.family(target)),
            keys,
            RUN_TASK_LIMIT,
            |id| self.task_arn(id),
        )
        .await
    }

    fn max_batch(&self) -> usize {
        RUN_TASK_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plane::InMemoryControlPlane;

    fn id(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn adapter() -> AwsAdapter {
        let settings = AwsSection {
            region: "eu-north-1".into(),
            account_id: "123456789012".into(),
            cluster_name: "gha-runner-cluster".into(),
            subnets: vec![],
            security_groups: vec![],
        };
        AwsAdapter::new(settings, "gha-runner", Arc::new(InMemoryControlPlane::new()))
    }

    #[test]
    fn job_scope_names_one_task_family() {
        let arn = adapter().scope_arn(&ResourceScope::Job(id("runner")));
        assert_eq!(
            arn,
            "arn:aws:ecs:eu-north-1:123456789012:task-definition/gha-runner-runner:*"
        );
        assert!(!arn.contains("task/"));
    }

    #[test]
    fn log_scope_names_one_group() {
        let arn = adapter().scope_arn(&ResourceScope::LogSink(id("logs-runner")));
        assert_eq!(
            arn,
            "arn:aws:logs:eu-north-1:123456789012:log-group:/ecs/gha-runner-logs-runner:*"
        );
    }

    #[test]
    fn cpu_units_follow_fargate_scale() {
        assert_eq!(cpu_units(ResourceLimits::new(1000, 2048)), 1024);
        assert_eq!(cpu_units(ResourceLimits::new(250, 512)), 256);
    }

    #[test]
    fn trigger_actions_map_to_run_start_stop() {
        let actions: BTreeSet<&str> = Action::TRIGGER
            .iter()
            .flat_map(|a| iam_actions(*a).iter().copied())
            .collect();
        assert_eq!(actions, BTreeSet::from(["ecs:RunTask", "ecs:StartTask", "ecs:StopTask"]));
    }

    #[test]
    fn own_job_actions_cannot_launch_tasks() {
        let actions: BTreeSet<&str> = [Action::StartOwnJob, Action::DescribeOwnJob, Action::WriteOwnLogStream]
            .iter()
            .flat_map(|a| iam_actions(*a).iter().copied())
            .collect();
        assert_eq!(
            actions,
            BTreeSet::from([
                "ecs:DescribeTaskDefinition",
                "ecs:DescribeTasks",
                "logs:CreateLogStream",
                "logs:PutLogEvents",
            ])
        );
    }
}
