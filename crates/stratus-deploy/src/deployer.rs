//! Provision, deploy, tear down and inspect one project's function.
//!
//! Resources are handled in a fixed order so later steps can use what
//! earlier ones produced:
//!
//! ```text
//! role ─▶ policies ─▶ repository ─▶ queues ─▶ function ─▶ mappings ─▶ rules ─▶ url
//! ```
//!
//! Every step is idempotent; running any operation twice is safe.

use serde_json::{json, Value};
use tracing::info;

use crate::config::DeployConfig;
use crate::error::{DeployError, DeployResult};
use crate::function::{DeployOutcome, FunctionDeployer, FunctionUrls, Functions};
use crate::iam::{
    function_principal, policy_doc, Policies, PolicyScope, Roles, VPC_ACCESS_POLICY_ARN,
};
use crate::logs::{LogDirection, LogLines, LogReader};
use crate::queues::{Mappings, Queues};
use crate::registry::{Repositories, PULL_ACTIONS};
use crate::rules::EventRules;
use crate::transport::Cloud;

/// Actions the execution role needs to write its logs.
pub const LOG_ACTIONS: [&str; 3] = [
    "logs:CreateLogGroup",
    "logs:CreateLogStream",
    "logs:PutLogEvents",
];

/// Actions the execution role needs on its queues.
pub const QUEUE_ACTIONS: [&str; 7] = [
    "sqs:SendMessage",
    "sqs:ReceiveMessage",
    "sqs:DeleteMessage",
    "sqs:GetQueueAttributes",
    "sqs:GetQueueUrl",
    "sqs:ChangeMessageVisibility",
    "sqs:PurgeQueue",
];

/// Purposes of the inline policies attached to the execution role.
pub const ROLE_POLICY_PURPOSES: [&str; 3] = ["logs", "ecr-repo", "sqs-queues"];

/// Result of [`Deployer::provision`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionSummary {
    /// Execution role ARN.
    pub role_arn: String,
    /// Repository URI images are pushed to.
    pub repository_uri: String,
    /// Names of the declared queues.
    pub queues: Vec<String>,
}

/// Result of [`Deployer::deploy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploySummary {
    /// Repository name.
    pub repository: String,
    /// Image the function runs.
    pub image_uri: String,
    /// Function name.
    pub function_name: String,
    /// Function ARN.
    pub function_arn: String,
    /// Public function URL.
    pub function_url: String,
    /// Names of the declared event rules.
    pub rules: Vec<String>,
    /// What happened to the function.
    pub outcome: DeployOutcome,
}

/// Runs the lifecycle operations for one configured function.
pub struct Deployer {
    cloud: Cloud,
    config: DeployConfig,
    account_id: String,
}

impl std::fmt::Debug for Deployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployer")
            .field("function", &self.config.function_name())
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

impl Deployer {
    /// Create a deployer for a known account.
    #[must_use]
    pub fn new(cloud: Cloud, config: DeployConfig, account_id: impl Into<String>) -> Self {
        Self {
            cloud,
            config,
            account_id: account_id.into(),
        }
    }

    /// Create a deployer, asking the provider for the account id when the
    /// configuration does not set one.
    pub async fn connect(cloud: Cloud, config: DeployConfig) -> DeployResult<Self> {
        let account_id = match &config.aws.account_id {
            Some(account_id) => account_id.clone(),
            None => cloud.iam.account_id().await?,
        };
        Ok(Self::new(cloud, config, account_id))
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &DeployConfig {
        &self.config
    }

    fn repositories(&self) -> Repositories {
        Repositories::new(
            self.cloud.registry.clone(),
            self.cloud.engine.clone(),
            &self.account_id,
            &self.config.aws.region,
            self.config.retry,
        )
    }

    fn queues(&self) -> Queues {
        Queues::new(
            self.cloud.queues.clone(),
            self.config.resource_ident(),
            self.config.retry,
        )
    }

    fn rules(&self) -> EventRules {
        EventRules::new(
            self.cloud.events.clone(),
            self.cloud.functions.clone(),
            self.config.resource_ident(),
            self.config.retry,
        )
    }

    fn mappings(&self) -> Mappings {
        Mappings::new(
            self.cloud.functions.clone(),
            self.config.function_name(),
            self.config.retry,
        )
    }

    /// Create or update the role, its policies, the repository and the queues.
    pub async fn provision(&self) -> DeployResult<ProvisionSummary> {
        let role_name = self.config.resource_ident();
        let function_name = self.config.function_name();

        let mut managed = self.config.policy_arns.clone();
        if self.config.has_vpc() {
            managed.push(VPC_ACCESS_POLICY_ARN.to_owned());
        }
        let mut roles = Roles::new(self.cloud.iam.clone(), &self.account_id, self.config.retry);
        let role_arn = roles
            .ensure_role(&role_name, &function_principal(), &managed)
            .await?;

        let mut policies = Policies::new(self.cloud.iam.clone(), self.config.retry);
        let documents = [
            policy_doc(&LOG_ACTIONS, PolicyScope::Resource(json!("arn:aws:logs:*:*:*"))),
            policy_doc(
                &PULL_ACTIONS,
                PolicyScope::Resource(json!(self.config.repository_arn(&self.account_id))),
            ),
            policy_doc(
                &QUEUE_ACTIONS,
                PolicyScope::Resource(json!(self.config.queue_resource(&self.account_id))),
            ),
        ];
        for (purpose, document) in ROLE_POLICY_PURPOSES.iter().zip(&documents) {
            policies.attach_policy(&role_name, purpose, document).await?;
        }

        let repository = self.repositories().ensure(&role_name, &role_arn).await?;
        let queues = self
            .queues()
            .sync(&self.config.queues)
            .await?
            .into_iter()
            .map(|(record, _)| record.queue_name)
            .collect();

        info!(function = %function_name, "Provision finished for: {function_name}");
        Ok(ProvisionSummary {
            role_arn,
            repository_uri: repository.uri().to_owned(),
            queues,
        })
    }

    /// Push `image_name` and bring the function and its triggers up to date.
    ///
    /// The repository must already exist; see [`Deployer::provision`].
    pub async fn deploy(&self, image_name: &str) -> DeployResult<DeploySummary> {
        let resource_ident = self.config.resource_ident();
        let function_name = self.config.function_name();

        let Some(mut repository) = self.repositories().get(&resource_ident).await? else {
            return Err(DeployError::NotFound {
                operation: "deploy",
                message: format!("repository {resource_ident} does not exist, run provision first"),
            });
        };
        let tag = repository.push(image_name, None).await?;
        let image_uri = repository.image_uri(&tag);

        let deployer = FunctionDeployer::new(self.cloud.functions.clone(), self.config.retry);
        let spec = self.config.function_spec(&self.config.role_arn(&self.account_id));
        let deployed = deployer.ensure_func(&spec, &image_uri).await?;

        let sources: Vec<(String, u32)> = self
            .queues()
            .sync(&self.config.queues)
            .await?
            .into_iter()
            .map(|(record, batch_size)| (record.queue_arn, batch_size))
            .collect();
        self.mappings().sync(&sources).await?;

        let rules = self
            .rules()
            .sync(&self.config.action_key, &deployed.arn, &self.config.event_rules)
            .await?;

        let function_url = FunctionUrls::new(self.cloud.functions.clone())
            .ensure(&function_name)
            .await?;
        deployer.wait_updated(&function_name).await?;

        info!(repository = %repository.name(), "Repository: {}", repository.name());
        info!(image = %image_uri, "Image URI: {image_uri}");
        info!(function = %function_name, "Function: {function_name}");
        info!(url = %function_url, "Function URL: {function_url}");

        Ok(DeploySummary {
            repository: repository.name().to_owned(),
            image_uri,
            function_name,
            function_arn: deployed.arn,
            function_url,
            rules,
            outcome: deployed.outcome,
        })
    }

    /// Tear everything down. Resources that are already gone are skipped.
    ///
    /// Without `force_repo` a repository that still holds images is kept and
    /// the error is returned.
    pub async fn delete(&self, force_repo: bool) -> DeployResult<()> {
        let resource_ident = self.config.resource_ident();
        let function_name = self.config.function_name();

        let urls = FunctionUrls::new(self.cloud.functions.clone());
        urls.delete(&function_name).await?;
        urls.remove_permissions(&function_name).await?;
        self.mappings().delete_all().await?;

        Functions::new(self.cloud.functions.clone(), self.config.retry)
            .delete(&function_name)
            .await?;

        let rule_idents: Vec<String> = self.config.event_rules.keys().cloned().collect();
        self.rules().delete(&rule_idents).await?;

        Roles::new(self.cloud.iam.clone(), &self.account_id, self.config.retry)
            .delete(&resource_ident)
            .await?;
        let policy_names: Vec<String> = ROLE_POLICY_PURPOSES
            .iter()
            .map(|purpose| format!("{resource_ident}-{purpose}"))
            .collect();
        Policies::new(self.cloud.iam.clone(), self.config.retry)
            .delete(&policy_names)
            .await?;

        self.queues().delete_all().await?;
        self.repositories()
            .delete(&[resource_ident.as_str()], force_repo)
            .await?;

        info!(function = %function_name, "Delete finished for: {function_name}");
        Ok(())
    }

    /// Rendered function logs.
    pub async fn logs(&self, limit: u32, direction: LogDirection) -> DeployResult<LogLines> {
        LogReader::new(self.cloud.logs.clone(), self.config.logs.max_streams)
            .lines(&self.config.log_group(), limit, direction)
            .await
    }

    /// Invoke the function with an action and wait for its response.
    pub async fn invoke(&self, action: &str, args: Value) -> DeployResult<Value> {
        let payload = json!({
            self.config.action_key.as_str(): action,
            "action-args": args,
        });
        let function_name = self.config.function_name();
        info!(function = %function_name, action, "Invoking function");
        Ok(self.cloud.functions.invoke(&function_name, &payload).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::test_fixtures::{capture_logs, cloud, deploy_config};
    use crate::transport::MemoryCloud;

    fn deployer(cloud: &Arc<MemoryCloud>, config: DeployConfig) -> Deployer {
        Deployer::new(Cloud::from_provider(cloud.clone()), config, "123456789012")
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn provision_is_repeatable(cloud: Arc<MemoryCloud>, deploy_config: DeployConfig) {
        let logs = capture_logs();
        let deployer = deployer(&cloud, deploy_config);

        let first = deployer.provision().await.unwrap();
        let second = deployer.provision().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cloud.calls("create_role"), 1);
        assert_eq!(cloud.calls("create_policy"), 3);
        assert_eq!(cloud.calls("create_policy_version"), 0);
        assert_eq!(cloud.calls("create_repository"), 1);
        assert_eq!(
            logs.messages().last().map(String::as_str),
            Some("Provision finished for: greek-mu-func-qa")
        );
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn deploy_requires_provisioned_repository(
        cloud: Arc<MemoryCloud>,
        deploy_config: DeployConfig,
    ) {
        let err = deployer(&cloud, deploy_config)
            .deploy("mu")
            .await
            .unwrap_err();

        match err {
            DeployError::NotFound { message, .. } => assert!(message.contains("provision")),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn invoke_sends_action_payload(cloud: Arc<MemoryCloud>, deploy_config: DeployConfig) {
        cloud.seed_function(
            "greek-mu-func-qa",
            crate::transport::PackageType::Image,
            Some("repo:tag"),
        );

        deployer(&cloud, deploy_config)
            .invoke("ping", json!({ "n": 1 }))
            .await
            .unwrap();

        assert_eq!(
            cloud.invocations(),
            vec![(
                "greek-mu-func-qa".to_owned(),
                json!({ "do-action": "ping", "action-args": { "n": 1 } })
            )]
        );
    }
}
