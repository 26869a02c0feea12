//! Common test utilities for deploy integration tests.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use stratus_deploy::{Cloud, DeployConfig, Deployer, MemoryCloud};

pub const ACCOUNT_ID: &str = "123456789012";
pub const FUNCTION: &str = "greek-mu-func-qa";
pub const RESOURCE: &str = "greek-mu-lambda-func-qa";
pub const IMAGE: &str = "mu";

/// One function with a nightly rule and a job queue.
pub const PROJECT_CONFIG: &str = r#"
    environment = "qa"

    [project]
    org = "greek"
    name = "mu"

    [function]
    memory = 1024
    timeout = 60
    env = { APP_ENV = "qa" }

    [event_rules.nightly]
    cron = "0 3 * * ? *"
    action = "cleanup"

    [queues.jobs]
    visibility_timeout = 120

    [retry]
    attempts = 5
    initial_delay_ms = 10
    max_delay_ms = 40
"#;

/// Print library logs when a test fails.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("stratus_deploy=debug")
        .with_test_writer()
        .try_init();
}

/// Creation time of the local test image.
pub fn built_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
        .single()
        .unwrap_or_default()
}

/// A provider and a deployer wired to it.
pub struct TestDeploy {
    pub cloud: Arc<MemoryCloud>,
    pub deployer: Deployer,
}

impl TestDeploy {
    /// Deployer for [`PROJECT_CONFIG`], account resolved from the provider.
    pub async fn new() -> Self {
        Self::with_config(PROJECT_CONFIG).await
    }

    pub async fn with_config(config: &str) -> Self {
        init_tracing();
        let cloud = Arc::new(MemoryCloud::new());
        let config: DeployConfig = toml::from_str(config).unwrap();
        let deployer = Deployer::connect(Cloud::from_provider(cloud.clone()), config)
            .await
            .unwrap();
        Self { cloud, deployer }
    }

    /// Register the local image the deploy pushes.
    pub fn build_image(&self) {
        self.cloud.add_local_image(IMAGE, built_at());
    }
}
