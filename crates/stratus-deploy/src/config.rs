//! Configuration for stratus-deploy.
//!
//! Loaded from `stratus.toml`, found by walking up from a start directory,
//! then overridden by `STRATUS_`-prefixed environment variables (nested keys
//! separated by `__`, e.g. `STRATUS_FUNCTION__MEMORY=1024`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{DeployError, DeployResult};
use crate::function::FunctionSpec;
use crate::queues::QueueSpec;
use crate::retry::RetryPolicy;
use crate::rules::ScheduleSpec;
use crate::transport::{LoggingConfig, VpcConfig};

/// Name of the project configuration file.
pub const CONFIG_FILE: &str = "stratus.toml";

/// Top-level deploy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfig {
    /// Project identity.
    pub project: ProjectConfig,

    /// Deploy target, e.g. `qa` or `prod`.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Function settings.
    #[serde(default)]
    pub function: FunctionConfig,

    /// Local image to deploy; defaults to the project name.
    #[serde(default)]
    pub image_name: Option<String>,

    /// Payload key naming the action on scheduled invocations.
    #[serde(default = "default_action_key")]
    pub action_key: String,

    /// Scheduled invocations by rule identifier.
    #[serde(default)]
    pub event_rules: BTreeMap<String, ScheduleSpec>,

    /// Queues by identifier.
    #[serde(default)]
    pub queues: BTreeMap<String, QueueSpec>,

    /// Extra managed policies attached to the execution role.
    #[serde(default)]
    pub policy_arns: Vec<String>,

    /// Provider account settings.
    #[serde(default)]
    pub aws: AwsConfig,

    /// Backoff for every wait.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Log retrieval settings.
    #[serde(default)]
    pub logs: LogsConfig,
}

fn default_environment() -> String {
    "dev".to_owned()
}

fn default_action_key() -> String {
    "do-action".to_owned()
}

impl DeployConfig {
    /// Load configuration starting the file search at `start`.
    pub fn load(start: &Path) -> DeployResult<Self> {
        let path = find_upwards(start, CONFIG_FILE).ok_or_else(|| {
            DeployError::Config(format!(
                "no {CONFIG_FILE} found in {} or its parents",
                start.display()
            ))
        })?;
        Self::from_file(path)
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> DeployResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STRATUS_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> DeployResult<()> {
        if slug(&self.project.org).is_empty() || slug(&self.project.name).is_empty() {
            return Err(DeployError::Config(
                "project.org and project.name must be set".to_owned(),
            ));
        }
        if slug(&self.environment).is_empty() {
            return Err(DeployError::Config("environment must not be empty".to_owned()));
        }
        Ok(())
    }

    /// Slugged project identifier, `{org}-{name}` unless set explicitly.
    #[must_use]
    pub fn project_ident(&self) -> String {
        match &self.project.ident {
            Some(ident) => slug(ident),
            None => slug(&format!("{}-{}", self.project.org, self.project.name)),
        }
    }

    /// Name of the deployed function.
    #[must_use]
    pub fn function_name(&self) -> String {
        slug(&format!(
            "{}-{}-{}",
            self.project_ident(),
            self.function.name,
            self.environment
        ))
    }

    /// Name shared by the role, repository, rules and queues.
    #[must_use]
    pub fn resource_ident(&self) -> String {
        slug(&format!(
            "{}-lambda-{}-{}",
            self.project_ident(),
            self.function.name,
            self.environment
        ))
    }

    /// Slugged name of the local image.
    #[must_use]
    pub fn image_name(&self) -> String {
        slug(self.image_name.as_deref().unwrap_or(&self.project.name))
    }

    /// Execution role ARN.
    #[must_use]
    pub fn role_arn(&self, account_id: &str) -> String {
        format!("arn:aws:iam::{account_id}:role/{}", self.resource_ident())
    }

    /// Image repository ARN.
    #[must_use]
    pub fn repository_arn(&self, account_id: &str) -> String {
        format!(
            "arn:aws:ecr:{}:{account_id}:repository/{}",
            self.aws.region,
            self.resource_ident()
        )
    }

    /// ARN pattern covering every queue of the function.
    #[must_use]
    pub fn queue_resource(&self, account_id: &str) -> String {
        format!(
            "arn:aws:sqs:{}:{account_id}:{}-*",
            self.aws.region,
            self.resource_ident()
        )
    }

    /// Log group the function writes to.
    #[must_use]
    pub fn log_group(&self) -> String {
        format!("/aws/lambda/{}", self.function_name())
    }

    /// Whether the function is placed in a VPC.
    #[must_use]
    pub fn has_vpc(&self) -> bool {
        !self.function.subnet_ids.is_empty()
    }

    /// Desired function configuration.
    #[must_use]
    pub fn function_spec(&self, role_arn: &str) -> FunctionSpec {
        let vpc = self.has_vpc().then(|| VpcConfig {
            subnet_ids: self.function.subnet_ids.clone(),
            security_group_ids: self.function.security_group_ids.clone(),
        });
        FunctionSpec {
            role: Some(role_arn.to_owned()),
            memory_size: Some(self.function.memory),
            timeout: Some(self.function.timeout),
            environment: Some(self.function.env.clone()),
            vpc,
            logging: Some(LoggingConfig {
                log_format: "JSON".to_owned(),
                application_log_level: self.function.log_level.to_uppercase(),
                system_log_level: self.function.log_level.to_uppercase(),
            }),
            ..FunctionSpec::new(self.function_name())
        }
    }
}

/// Project identity.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Owning organisation.
    pub org: String,
    /// Project name.
    pub name: String,
    /// Overrides `{org}-{name}` as the identifier.
    #[serde(default)]
    pub ident: Option<String>,
}

/// Function settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionConfig {
    /// Short name combined into the function name.
    #[serde(default = "default_function_name")]
    pub name: String,

    /// Memory in MB.
    #[serde(default = "default_memory")]
    pub memory: u32,

    /// Timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u32,

    /// Environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Subnets for VPC placement; empty means no VPC.
    #[serde(default)]
    pub subnet_ids: Vec<String>,

    /// Security groups for VPC placement.
    #[serde(default)]
    pub security_group_ids: Vec<String>,

    /// Application and platform log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_function_name() -> String {
    "func".to_owned()
}

const fn default_memory() -> u32 {
    2048
}

const fn default_timeout() -> u32 {
    900
}

fn default_log_level() -> String {
    "INFO".to_owned()
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            name: default_function_name(),
            memory: default_memory(),
            timeout: default_timeout(),
            env: BTreeMap::new(),
            subnet_ids: Vec::new(),
            security_group_ids: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

/// Provider account settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// Region to deploy to.
    #[serde(default = "default_region")]
    pub region: String,

    /// Account id; asked from the provider when unset.
    #[serde(default)]
    pub account_id: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            account_id: None,
        }
    }
}

/// Log retrieval settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LogsConfig {
    /// Most streams merged per request.
    #[serde(default = "default_max_streams")]
    pub max_streams: u32,
}

const fn default_max_streams() -> u32 {
    5
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            max_streams: default_max_streams(),
        }
    }
}

/// Lower-case `value`, replacing runs of other characters with single dashes.
#[must_use]
pub fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Find `filename` in `start` or the closest parent containing it.
#[must_use]
pub fn find_upwards(start: &Path, filename: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(filename))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const MINIMAL: &str = r#"
        environment = "qa"

        [project]
        org = "Greek"
        name = "mu"
    "#;

    #[test]
    fn minimal_config_derives_names() {
        let config: DeployConfig = toml::from_str(MINIMAL).unwrap();

        assert_eq!(config.project_ident(), "greek-mu");
        assert_eq!(config.function_name(), "greek-mu-func-qa");
        assert_eq!(config.resource_ident(), "greek-mu-lambda-func-qa");
        assert_eq!(config.image_name(), "mu");
        assert_eq!(config.action_key, "do-action");
        assert_eq!(config.log_group(), "/aws/lambda/greek-mu-func-qa");
        assert_eq!(
            config.role_arn("123456789012"),
            "arn:aws:iam::123456789012:role/greek-mu-lambda-func-qa"
        );
        assert_eq!(
            config.queue_resource("123456789012"),
            "arn:aws:sqs:us-east-1:123456789012:greek-mu-lambda-func-qa-*"
        );
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn full_config_from_toml() {
        let toml = r#"
            environment = "prod"
            image_name = "Mu Image"
            action_key = "action"
            policy_arns = ["arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess"]

            [project]
            org = "greek"
            name = "mu"
            ident = "Starport_Mu"

            [function]
            memory = 512
            timeout = 30
            env = { APP_ENV = "prod" }
            subnet_ids = ["subnet-1"]
            security_group_ids = ["sg-1"]
            log_level = "debug"

            [event_rules.nightly]
            cron = "0 3 * * ? *"
            action = "cleanup"

            [queues.jobs]
            visibility_timeout = 120

            [aws]
            region = "eu-west-1"
            account_id = "123456789012"

            [retry]
            attempts = 3
        "#;

        let config: DeployConfig = toml::from_str(toml).unwrap();
        let spec = config.function_spec("arn:role");

        assert_eq!(config.project_ident(), "starport-mu");
        assert_eq!(config.image_name(), "mu-image");
        assert_eq!(config.event_rules["nightly"].state, "enabled");
        assert_eq!(config.queues["jobs"].batch_size, 10);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, 250);
        assert_eq!(spec.name, "starport-mu-func-prod");
        assert_eq!(spec.memory_size, Some(512));
        assert_eq!(spec.vpc.unwrap().subnet_ids, vec!["subnet-1"]);
        assert_eq!(spec.logging.unwrap().application_log_level, "DEBUG");
    }

    #[test]
    fn load_walks_up_to_the_config_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), MINIMAL).unwrap();
        let nested = dir.path().join("src/handlers");
        std::fs::create_dir_all(&nested).unwrap();

        let config = DeployConfig::load(&nested).unwrap();

        assert_eq!(config.function_name(), "greek-mu-func-qa");
    }

    #[test]
    fn missing_file_and_missing_project_are_config_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            DeployConfig::load(dir.path()),
            Err(DeployError::Config(_))
        ));

        std::fs::write(dir.path().join(CONFIG_FILE), "environment = \"qa\"\n").unwrap();
        assert!(matches!(
            DeployConfig::load(dir.path()),
            Err(DeployError::Config(_))
        ));
    }

    #[test]
    fn slug_collapses_separators() {
        assert_eq!(slug("Greek  Mu__Func!"), "greek-mu-func");
        assert_eq!(slug("--a--"), "a");
        assert_eq!(slug(""), "");
    }
}
