//! Standard runner fleet topology
//!
//! One plan shape for every provider:
//!
//! ```text
//! ctx ─┬─> identity-build, logs-build ─────> build
//!      ├─> identity-runner, logs-runner ───> runner ──> controller
//!      └─> identity-ctrl, logs-ctrl ─────────────────────┘
//! ```
//!
//! Every job family gets its own identity and its own log sink, so no
//! identity holds a grant on another family's job or logs.
//!
//! Only the env wiring differs per provider: each controller image reads
//! its own set of variables to find the runner job it triggers.

use crate::build::BuildLedger;
use crate::config::FleetConfig;
use crate::error::ValidationError;
use crate::node::{
    BuildSpec, ContextKey, ContextSpec, ControllerSpec, EnvBinding, ImageRef, JobSpec, Node,
    RegistryTarget, VolumeMount, VolumeSource,
};
use crate::plan::Plan;
use crate::secret::{Secret, SecretValue};
use crate::types::{JobFamily, NodeId, Provider, ResourceLimits};

/// Name of the registered PAT secret
pub const PAT_SECRET: &str = "pat";

/// Node ids of the standard topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetIds {
    /// Context lookup
    pub ctx: NodeId,
    /// Identity of the runner job
    pub identity_runner: NodeId,
    /// Identity of the image build job
    pub identity_build: NodeId,
    /// Identity of the controller
    pub identity_ctrl: NodeId,
    /// Runner log sink
    pub logs_runner: NodeId,
    /// Build log sink
    pub logs_build: NodeId,
    /// Controller log sink
    pub logs_ctrl: NodeId,
    /// Image build job
    pub build: NodeId,
    /// Runner job
    pub runner: NodeId,
    /// Autoscaler controller
    pub controller: NodeId,
}

impl FleetIds {
    /// The fixed ids used by `standard_plan`
    ///
    /// # Errors
    /// Never for the built-in names.
    pub fn standard() -> Result<Self, ValidationError> {
        Ok(Self {
            ctx: NodeId::new("ctx")?,
            identity_runner: NodeId::new("identity-runner")?,
            identity_build: NodeId::new("identity-build")?,
            identity_ctrl: NodeId::new("identity-ctrl")?,
            logs_runner: NodeId::new("logs-runner")?,
            logs_build: NodeId::new("logs-build")?,
            logs_ctrl: NodeId::new("logs-ctrl")?,
            build: NodeId::new("build")?,
            runner: NodeId::new("runner")?,
            controller: NodeId::new("controller")?,
        })
    }
}

/// Context keys each provider resolves.
#[must_use]
pub fn context_keys(provider: Provider) -> Vec<ContextKey> {
    match provider {
        Provider::Aws => vec![
            ContextKey::Region,
            ContextKey::Account,
            ContextKey::Subnets,
            ContextKey::SecurityGroups,
        ],
        Provider::Azure => vec![
            ContextKey::Region,
            ContextKey::Subscription,
            ContextKey::ResourceGroup,
        ],
        Provider::Gcp => vec![ContextKey::Region, ContextKey::Project],
    }
}

/// Assemble the standard ten-node plan for `config`.
///
/// The runner uses `[runner].image` when set, otherwise the image of the
/// last successful run of the build node recorded in `builds`.
///
/// # Errors
/// Any `ValidationError` from adding nodes. The returned plan is not yet
/// validated; a missing successful build surfaces from `Plan::validate`.
pub fn standard_plan(
    config: &FleetConfig,
    builds: BuildLedger,
    pat: SecretValue,
) -> Result<Plan, ValidationError> {
    let ids = FleetIds::standard()?;
    let provider = config.fleet.provider;
    let mut plan = Plan::with_builds(builds);
    plan.add_secret(Secret::new(PAT_SECRET, pat));

    let labelled = |node: Node| {
        node.with_label("managed-by", "fleetctl")
            .with_label("fleet", config.fleet.name.as_str())
    };

    plan.add_node(labelled(Node::context(
        ids.ctx.clone(),
        ContextSpec::new(context_keys(provider)),
    )))?;
    for (identity, logs, family) in [
        (&ids.identity_build, &ids.logs_build, JobFamily::Builder),
        (&ids.identity_runner, &ids.logs_runner, JobFamily::Runner),
        (&ids.identity_ctrl, &ids.logs_ctrl, JobFamily::Autoscaler),
    ] {
        plan.add_node(labelled(
            Node::identity(identity.clone(), family).depends_on(ids.ctx.clone()),
        ))?;
        plan.add_node(labelled(
            Node::log_sink(logs.clone(), family).depends_on(ids.ctx.clone()),
        ))?;
    }

    let build = BuildSpec {
        job: JobSpec::new(
            ImageRef::literal(config.builder.image.as_str()),
            ids.identity_build.clone(),
            ids.logs_build.clone(),
        )
        .with_context(ids.ctx.clone()),
        dockerfile: config.builder.dockerfile.clone(),
        context_url: config.builder.context.clone(),
        target: config.builder.target.clone(),
        destination: RegistryTarget {
            repository: config.builder.destination_repository.clone(),
            tag: config.builder.tag.clone(),
        },
    };
    plan.add_node(labelled(Node::build_job(ids.build.clone(), build)))?;

    let runner_image = config
        .runner
        .image
        .as_ref()
        .map_or_else(|| ImageRef::LatestBuild(ids.build.clone()), ImageRef::literal);
    let mut runner = JobSpec::new(runner_image, ids.identity_runner.clone(), ids.logs_runner.clone())
        .with_context(ids.ctx.clone())
        .with_command(config.runner.command.clone())
        .with_resources(ResourceLimits::new(
            config.runner.cpu_millicores,
            config.runner.memory_mib,
        ));
    runner.timeout_secs = config.runner.timeout_secs;
    for binding in runner_env(config, &ids) {
        runner = runner.with_env(binding);
    }
    for mount in runner_volumes(config) {
        runner = runner.with_volume(mount);
    }
    plan.add_node(labelled(Node::runner_job(ids.runner.clone(), runner)))?;

    let mut controller = ControllerSpec::new(
        ImageRef::literal(config.autoscaler.image.as_str()),
        ids.runner.clone(),
        ids.identity_ctrl.clone(),
        ids.logs_ctrl.clone(),
    )
    .with_context(ids.ctx.clone())
    .with_resources(ResourceLimits::new(
        config.autoscaler.cpu_millicores,
        config.autoscaler.memory_mib,
    ));
    for binding in controller_env(config, &ids) {
        controller = controller.with_env(binding);
    }
    plan.add_node(labelled(Node::controller(ids.controller.clone(), controller)))?;

    tracing::debug!(provider = %provider, nodes = plan.len(), "standard plan assembled");
    Ok(plan)
}

fn runner_env(config: &FleetConfig, ids: &FleetIds) -> Vec<EnvBinding> {
    let mut env = vec![EnvBinding::literal("GITHUB_CONFIG_URL", config.github.config_url.as_str())];
    match config.fleet.provider {
        Provider::Aws => {
            if let Some(aws) = &config.aws {
                env.push(EnvBinding::literal("ECS_CLUSTER_NAME", aws.cluster_name.as_str()));
            }
        }
        Provider::Azure => {
            env.push(EnvBinding::output("AZURE_CLIENT_ID", ids.identity_runner.clone(), "client_id"));
            env.push(EnvBinding::output("SUBSCRIPTION_ID", ids.ctx.clone(), "subscription_id"));
            env.push(EnvBinding::output("RG_NAME", ids.ctx.clone(), "resource_group"));
            env.push(EnvBinding::output("LOG_ID", ids.logs_runner.clone(), "id"));
            env.push(EnvBinding::literal("STORAGE_NAME", work_share(config)));
        }
        Provider::Gcp => {
            env.push(EnvBinding::output("CLOUDSDK_RUN_REGION", ids.ctx.clone(), "region"));
            env.push(EnvBinding::output("GOOGLE_CLOUD_PROJECT", ids.ctx.clone(), "project"));
            env.push(EnvBinding::literal("EXTERNAL_STORAGE_NAME", work_share(config)));
        }
    }
    env
}

fn runner_volumes(config: &FleetConfig) -> Vec<VolumeMount> {
    match config.fleet.provider {
        Provider::Aws => vec![VolumeMount::new("work", "/home/runner/_work", VolumeSource::Ephemeral)],
        Provider::Azure | Provider::Gcp => vec![VolumeMount::new(
            "work",
            "/home/runner/_work",
            VolumeSource::SharedFiles {
                share: work_share(config),
            },
        )],
    }
}

fn work_share(config: &FleetConfig) -> String {
    format!("{}-work", config.fleet.name)
}

fn controller_env(config: &FleetConfig, ids: &FleetIds) -> Vec<EnvBinding> {
    let mut env = vec![
        EnvBinding::secret("PAT", PAT_SECRET),
        EnvBinding::literal("GITHUB_CONFIG_URL", config.github.config_url.as_str()),
        EnvBinding::literal("SCALE_SET_NAME", config.fleet.scale_set_name.as_str()),
    ];
    match config.fleet.provider {
        Provider::Aws => {
            env.push(EnvBinding::output("TASK_DEFINITION_ARN", ids.runner.clone(), "task_definition_arn"));
            env.push(EnvBinding::output("ECS_CLUSTER", ids.runner.clone(), "cluster_arn"));
            env.push(EnvBinding::output("ECS_SUBNETS", ids.ctx.clone(), "subnets"));
            env.push(EnvBinding::output("ECS_SECURITY_GROUPS", ids.ctx.clone(), "security_groups"));
        }
        Provider::Azure => {
            env.push(EnvBinding::output("AZURE_CLIENT_ID", ids.identity_ctrl.clone(), "client_id"));
            env.push(EnvBinding::output("SUBSCRIPTION_ID", ids.ctx.clone(), "subscription_id"));
            env.push(EnvBinding::output("RESOURCE_GROUP_NAME", ids.ctx.clone(), "resource_group"));
            env.push(EnvBinding::output("APP_NAME", ids.runner.clone(), "name"));
        }
        Provider::Gcp => {
            env.push(EnvBinding::output("JOB_NAME", ids.runner.clone(), "name"));
            env.push(EnvBinding::output("CLOUDSDK_RUN_REGION", ids.ctx.clone(), "region"));
            env.push(EnvBinding::output("GOOGLE_CLOUD_PROJECT", ids.ctx.clone(), "project"));
        }
    }
    env
}
