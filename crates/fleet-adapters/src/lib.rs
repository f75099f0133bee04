//! Provider adapters for fleet plans
//!
//! One `ProviderAdapter` + `RunnerLauncher` per cloud:
//! - [`AwsAdapter`]: ECS Fargate task definitions and services
//! - [`AzureAdapter`]: Container Apps jobs and apps
//! - [`GcpAdapter`]: Cloud Run jobs and services
//!
//! Adapters talk to a [`ControlPlane`]; [`InMemoryControlPlane`] backs dry
//! runs and tests.
//!
//! ```ignore
//! let config = FleetConfig::from_file(Path::new("fleet.toml"))?;
//! let plane = Arc::new(fleet_adapters::dry_run_plane());
//! let adapters = fleet_adapters::adapters_for(&config, plane)?;
//! let plan = standard_plan(&config, BuildLedger::new(), config.pat()?)?;
//! let report = plan.apply(adapters.provider, config.apply_options()).await?;
//! ```

#![warn(unreachable_pub)]

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod naming;
pub mod plane;
mod provisioner;

pub use aws::AwsAdapter;
pub use azure::AzureAdapter;
pub use gcp::GcpAdapter;
pub use naming::ResourceNamer;
pub use plane::{
    ControlPlane, Execution, InMemoryControlPlane, PlaneError, ResourceRecord, ResourceSpec, RunFailure,
    RunOutcome,
};
pub use provisioner::{CONTEXT_KIND, MANAGED_NODE_TAG};

use fleet_plan::{ConfigError, FleetConfig, Provider, ProviderAdapter, RunnerLauncher};
use std::sync::Arc;

/// `startedBy` tag on runner executions launched by the controller
pub const STARTED_BY: &str = "action-runner-scaler";

/// The adapter for the configured provider, as both apply target and
/// runner launcher.
#[derive(Clone)]
pub struct Adapters {
    /// Apply/destroy target
    pub provider: Arc<dyn ProviderAdapter>,
    /// Runner launching for the controller's dispatch loop
    pub launcher: Arc<dyn RunnerLauncher>,
}

fn pair<A>(adapter: A) -> Adapters
where
    A: ProviderAdapter + RunnerLauncher + 'static,
{
    let adapter = Arc::new(adapter);
    Adapters {
        provider: adapter.clone(),
        launcher: adapter,
    }
}

/// Build the adapter selected by `[fleet].provider`.
///
/// # Errors
/// `MissingProviderSection` when the provider's section is absent.
pub fn adapters_for(config: &FleetConfig, plane: Arc<dyn ControlPlane>) -> Result<Adapters, ConfigError> {
    let name = config.fleet.name.as_str();
    let adapters = match config.fleet.provider {
        Provider::Aws => {
            let settings = config.aws.clone().ok_or(ConfigError::MissingProviderSection("aws"))?;
            pair(AwsAdapter::new(settings, name, plane))
        }
        Provider::Azure => {
            let settings = config
                .azure
                .clone()
                .ok_or(ConfigError::MissingProviderSection("azure"))?;
            pair(AzureAdapter::new(settings, name, plane))
        }
        Provider::Gcp => {
            let settings = config.gcp.clone().ok_or(ConfigError::MissingProviderSection("gcp"))?;
            pair(GcpAdapter::new(settings, name, plane))
        }
    };
    tracing::debug!(provider = %config.fleet.provider, fleet = name, "adapter ready");
    Ok(adapters)
}

/// In-memory plane seeded with placeholder network lookups, for plans
/// whose `[aws]` section leaves subnets or security groups to discovery.
#[must_use]
pub fn dry_run_plane() -> InMemoryControlPlane {
    InMemoryControlPlane::new()
        .with_lookup("aws:subnets", "subnet-dryrun-a,subnet-dryrun-b")
        .with_lookup("aws:security_groups", "sg-dryrun")
}
