//! Fleet Plan - provider-agnostic provisioning of GitHub Actions runner fleets
//!
//! A fleet is a dependency graph of typed nodes (context lookup, identity,
//! log sink, build job, runner job, controller) held in a [`Plan`] arena.
//! The plan is validated locally, then walked rank by rank against a
//! [`ProviderAdapter`], one implementation per cloud.
//!
//! # Example
//!
//! ```rust,ignore
//! use fleet_plan::prelude::*;
//!
//! # async fn example(adapter: std::sync::Arc<dyn ProviderAdapter>) -> Result<(), Box<dyn std::error::Error>> {
//! let config: FleetConfig = std::fs::read_to_string("fleet.toml")?.parse()?;
//! let plan = standard_plan(&config, BuildLedger::new(), config.pat()?)?;
//! let report = plan.apply(adapter, config.apply_options()).await?;
//!
//! for line in report.outputs.to_lines() {
//!     println!("{line}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod adapter;
pub mod apply;
pub mod binder;
pub mod build;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod node;
pub mod outputs;
pub mod plan;
pub mod secret;
pub mod state;
pub mod topology;
pub mod types;

pub use adapter::{
    fingerprint, BuildJobRequest, ContextRequest, ControllerRequest, GrantRequest, IdentityRequest,
    JobRequest, LogSinkRequest, NodeRequest, ObservedResource, ProviderAdapter, RequestMeta,
    ResolvedEnv, ResolvedValue,
};
pub use apply::{Applier, ApplyOptions, ApplyReport, NodeOutcome, RetryPolicy};
pub use binder::{Action, IdentityBinder, IdentityBindings, PermissionGrant, ResourceScope};
pub use build::{allowed_transitions, BuildLedger, BuildRun, BuildStatus};
pub use config::FleetConfig;
pub use dispatch::{
    ControllerState, DispatchKey, DispatchOutcome, Dispatcher, LaunchedRunner, RunnerExecution,
    RunnerLauncher,
};
pub use error::{
    ApplyError, ConfigError, LaunchError, ProviderError, ProviderErrorKind, StateError,
    ValidationError,
};
pub use node::{
    BuildSpec, ContextKey, ContextSpec, ControllerSpec, EnvBinding, EnvValue, ImageRef, JobSpec,
    Node, NodeSpec, OutputRef, RegistryTarget, VolumeMount, VolumeSource,
};
pub use outputs::{NodeOutputs, OutputTable};
pub use plan::{Plan, ValidatedPlan};
pub use secret::{Secret, SecretHandle, SecretRef, SecretStore, SecretValue};
pub use state::PlanState;
pub use topology::{standard_plan, FleetIds};
pub use types::{JobFamily, NodeId, NodeKind, Provider, ResourceLimits};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for building and applying plans
    pub use crate::{
        standard_plan, ApplyError, ApplyOptions, ApplyReport, BuildLedger, EnvBinding, FleetConfig,
        ImageRef, JobFamily, JobSpec, Node, NodeId, NodeKind, NodeOutcome, Plan, ProviderAdapter,
        ProviderError, ProviderErrorKind, Secret, SecretValue, ValidationError,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
