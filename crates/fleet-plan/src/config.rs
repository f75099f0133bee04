//! fleet.toml configuration
//!
//! ```toml
//! [fleet]
//! provider = "aws"
//! name = "gha-runner"
//! scale_set_name = "ecs-runner-set"
//!
//! [github]
//! config_url = "https://github.com/org/repo"
//! pat_env = "GITHUB_PAT"
//!
//! [aws]
//! region = "eu-north-1"
//! account_id = "123456789012"
//! ```
//!
//! The PAT itself is never in the file; `FleetConfig::pat` reads it from
//! the named environment variable and fails if it is unset.

use crate::apply::{ApplyOptions, RetryPolicy};
use crate::error::ConfigError;
use crate::secret::SecretValue;
use crate::types::{NodeId, Provider};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Root of fleet.toml
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Provider selection and naming
    pub fleet: FleetSection,
    /// GitHub registration
    pub github: GithubSection,
    /// Runner job shape
    #[serde(default)]
    pub runner: RunnerSection,
    /// Image build job
    #[serde(default)]
    pub builder: BuilderSection,
    /// Autoscaler controller
    #[serde(default)]
    pub autoscaler: AutoscalerSection,
    /// AWS account settings
    pub aws: Option<AwsSection>,
    /// Azure subscription settings
    pub azure: Option<AzureSection>,
    /// GCP project settings
    pub gcp: Option<GcpSection>,
    /// Apply behavior
    #[serde(default)]
    pub apply: ApplySection,
}

/// `[fleet]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSection {
    /// Target cloud
    pub provider: Provider,
    /// Resource name prefix
    #[serde(default = "default_name")]
    pub name: String,
    /// Runner scale set name registered with GitHub
    #[serde(default = "default_scale_set")]
    pub scale_set_name: String,
}

fn default_name() -> String {
    "gha-runner".to_string()
}

fn default_scale_set() -> String {
    "managed-runner-set".to_string()
}

/// `[github]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GithubSection {
    /// Repository or organization URL runners register against
    pub config_url: String,
    /// Environment variable holding the PAT
    #[serde(default = "default_pat_env")]
    pub pat_env: String,
}

fn default_pat_env() -> String {
    "GITHUB_PAT".to_string()
}

/// `[runner]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSection {
    /// Literal image; unset means the image of the last successful build
    pub image: Option<String>,
    /// CPU in millicores
    #[serde(default = "default_runner_cpu")]
    pub cpu_millicores: u32,
    /// Memory in MiB
    #[serde(default = "default_runner_memory")]
    pub memory_mib: u32,
    /// Entrypoint
    #[serde(default = "default_runner_command")]
    pub command: Vec<String>,
    /// Per-execution timeout
    #[serde(default = "default_replica_timeout")]
    pub timeout_secs: u32,
}

fn default_runner_cpu() -> u32 {
    1000
}

fn default_runner_memory() -> u32 {
    2048
}

fn default_runner_command() -> Vec<String> {
    vec!["/home/runner/run.sh".to_string()]
}

fn default_replica_timeout() -> u32 {
    1200
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            image: None,
            cpu_millicores: default_runner_cpu(),
            memory_mib: default_runner_memory(),
            command: default_runner_command(),
            timeout_secs: default_replica_timeout(),
        }
    }
}

/// `[builder]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderSection {
    /// Kaniko executor image
    #[serde(default = "default_kaniko")]
    pub image: String,
    /// Dockerfile path inside the context
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    /// Build context
    #[serde(default = "default_build_context")]
    pub context: String,
    /// Multi-stage target
    pub target: Option<String>,
    /// Repository the runner image is pushed to
    #[serde(default = "default_repository")]
    pub destination_repository: String,
    /// Tag pushed by each build
    #[serde(default = "default_tag")]
    pub tag: String,
}

fn default_kaniko() -> String {
    "gcr.io/kaniko-project/executor:latest".to_string()
}

fn default_dockerfile() -> String {
    "images/Dockerfile".to_string()
}

fn default_build_context() -> String {
    "git://github.com/actions/runner.git".to_string()
}

fn default_repository() -> String {
    "results".to_string()
}

fn default_tag() -> String {
    "latest".to_string()
}

impl Default for BuilderSection {
    fn default() -> Self {
        Self {
            image: default_kaniko(),
            dockerfile: default_dockerfile(),
            context: default_build_context(),
            target: None,
            destination_repository: default_repository(),
            tag: default_tag(),
        }
    }
}

/// `[autoscaler]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerSection {
    /// Controller image
    #[serde(default = "default_autoscaler_image")]
    pub image: String,
    /// CPU in millicores
    #[serde(default = "default_autoscaler_cpu")]
    pub cpu_millicores: u32,
    /// Memory in MiB
    #[serde(default = "default_autoscaler_memory")]
    pub memory_mib: u32,
}

fn default_autoscaler_image() -> String {
    "ghcr.io/hi-fi/gha-runners-on-managed-env:latest".to_string()
}

fn default_autoscaler_cpu() -> u32 {
    256
}

fn default_autoscaler_memory() -> u32 {
    512
}

impl Default for AutoscalerSection {
    fn default() -> Self {
        Self {
            image: default_autoscaler_image(),
            cpu_millicores: default_autoscaler_cpu(),
            memory_mib: default_autoscaler_memory(),
        }
    }
}

/// `[aws]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsSection {
    /// Region
    pub region: String,
    /// Account id
    pub account_id: String,
    /// ECS cluster name
    #[serde(default = "default_cluster")]
    pub cluster_name: String,
    /// Subnets runner tasks attach to
    #[serde(default)]
    pub subnets: Vec<String>,
    /// Security groups runner tasks attach to
    #[serde(default)]
    pub security_groups: Vec<String>,
}

fn default_cluster() -> String {
    "gha-runner-cluster".to_string()
}

/// `[azure]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureSection {
    /// Subscription id
    pub subscription_id: String,
    /// Resource group
    pub resource_group: String,
    /// Location
    pub location: String,
    /// Container registry name
    pub registry_name: String,
}

/// `[gcp]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpSection {
    /// Project id
    pub project: String,
    /// Region
    pub location: String,
}

/// `[apply]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySection {
    /// Overall deadline
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts for `DependencyNotReady`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

fn default_timeout_secs() -> u64 {
    900
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    500
}

impl Default for ApplySection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl FleetConfig {
    /// Load and validate a config file.
    ///
    /// # Errors
    /// `Io`, `Parse`, or any error from [`FleetConfig::validate`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    /// Render back to TOML
    ///
    /// # Errors
    /// `InvalidValue` if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|err| ConfigError::InvalidValue {
            field: "config".into(),
            message: err.to_string(),
        })
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    /// - `MissingProviderSection` if the selected provider has no section
    /// - `InvalidValue` for names, URLs and limits out of range
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.fleet.provider {
            Provider::Aws if self.aws.is_none() => return Err(ConfigError::MissingProviderSection("aws")),
            Provider::Azure if self.azure.is_none() => {
                return Err(ConfigError::MissingProviderSection("azure"))
            }
            Provider::Gcp if self.gcp.is_none() => return Err(ConfigError::MissingProviderSection("gcp")),
            _ => {}
        }

        if NodeId::new(self.fleet.name.as_str()).is_err() {
            return Err(invalid(
                "fleet.name",
                "must be lowercase letters, digits or '-' and start with a letter",
            ));
        }
        if !self.github.config_url.starts_with("https://") {
            return Err(invalid("github.config_url", "must be an https:// URL"));
        }
        if self.github.pat_env.trim().is_empty() {
            return Err(invalid("github.pat_env", "must name an environment variable"));
        }
        for (field, value) in [
            ("runner.cpu_millicores", self.runner.cpu_millicores),
            ("runner.memory_mib", self.runner.memory_mib),
            ("autoscaler.cpu_millicores", self.autoscaler.cpu_millicores),
            ("autoscaler.memory_mib", self.autoscaler.memory_mib),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.apply.max_retries == 0 {
            return Err(invalid("apply.max_retries", "must be at least 1"));
        }
        Ok(())
    }

    /// Read the PAT from the configured environment variable.
    ///
    /// # Errors
    /// `MissingCredential` if the variable is unset or empty. There is no
    /// fallback value.
    pub fn pat(&self) -> Result<SecretValue, ConfigError> {
        match std::env::var(&self.github.pat_env) {
            Ok(value) if !value.is_empty() => Ok(SecretValue::new(value)),
            _ => Err(ConfigError::MissingCredential(self.github.pat_env.clone())),
        }
    }

    /// Region/location of the selected provider
    #[must_use]
    pub fn region(&self) -> Option<&str> {
        match self.fleet.provider {
            Provider::Aws => self.aws.as_ref().map(|a| a.region.as_str()),
            Provider::Azure => self.azure.as_ref().map(|a| a.location.as_str()),
            Provider::Gcp => self.gcp.as_ref().map(|g| g.location.as_str()),
        }
    }

    /// Apply options from `[apply]`
    #[must_use]
    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions::default()
            .with_timeout(Duration::from_secs(self.apply.timeout_secs))
            .with_retry(RetryPolicy::new(
                self.apply.max_retries,
                Duration::from_millis(self.apply.retry_base_ms),
            ))
    }
}

impl FromStr for FleetConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[fleet]
provider = "aws"

[github]
config_url = "https://github.com/example/repo"

[aws]
region = "eu-north-1"
account_id = "123456789012"
"#;

    #[test]
    fn parse_minimal_uses_defaults() {
        let config: FleetConfig = MINIMAL.parse().unwrap();
        assert_eq!(config.fleet.provider, Provider::Aws);
        assert_eq!(config.fleet.name, "gha-runner");
        assert_eq!(config.github.pat_env, "GITHUB_PAT");
        assert_eq!(config.aws.as_ref().unwrap().cluster_name, "gha-runner-cluster");
        assert_eq!(config.autoscaler.cpu_millicores, 256);
        assert_eq!(config.region(), Some("eu-north-1"));
        assert!(config.runner.image.is_none());
    }

    #[test]
    fn missing_provider_section() {
        let toml = MINIMAL.replace("provider = \"aws\"", "provider = \"gcp\"");
        let err = toml.parse::<FleetConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::MissingProviderSection("gcp")));
    }

    #[test]
    fn rejects_http_url() {
        let toml = MINIMAL.replace("https://", "http://");
        let err = toml.parse::<FleetConfig>().unwrap_err();
        assert!(err.to_string().contains("github.config_url"));
    }

    #[test]
    fn missing_pat_is_an_error_not_a_default() {
        let toml = MINIMAL.replace(
            "[github]\n",
            "[github]\npat_env = \"FLEET_TEST_PAT_THAT_IS_NEVER_SET\"\n",
        );
        let config: FleetConfig = toml.parse().unwrap();
        let err = config.pat().unwrap_err();
        assert!(matches!(err, ConfigError::MissingCredential(name) if name == "FLEET_TEST_PAT_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn apply_options_follow_section() {
        let config: FleetConfig = MINIMAL.parse().unwrap();
        let options = config.apply_options();
        assert_eq!(options.timeout, Some(Duration::from_secs(900)));
        assert_eq!(options.retry.max_attempts, 5);
    }

    #[test]
    fn round_trips_through_toml() {
        let config: FleetConfig = MINIMAL.parse().unwrap();
        let rendered = config.to_toml_string().unwrap();
        let back: FleetConfig = rendered.parse().unwrap();
        assert_eq!(back, config);
    }
}
