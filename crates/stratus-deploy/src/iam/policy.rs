//! Customer-managed policies attached to the execution role.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::document::{documents_equal, parse};
use crate::error::DeployResult;
use crate::ledger::{decode, Ensured, Ledger, RemoteRecord, ResourceKind};
use crate::retry::RetryPolicy;
use crate::transport::IamClient;

/// A policy as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyRecord {
    /// Policy name.
    pub policy_name: String,
    /// Policy ARN.
    pub arn: String,
    /// Authoritative version.
    pub default_version_id: String,
}

impl RemoteRecord for PolicyRecord {
    const KIND: &'static str = "policy";

    fn ident(&self) -> String {
        self.policy_name.clone()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyVersion {
    version_id: String,
    #[serde(default)]
    is_default_version: bool,
    #[serde(default)]
    document: Option<Value>,
}

/// Ledger operations for policies.
pub struct PolicyKind {
    iam: Arc<dyn IamClient>,
}

#[async_trait]
impl ResourceKind for PolicyKind {
    type Record = PolicyRecord;
    type CreateArgs = Value;
    type DeleteArgs = ();

    const LABEL: &'static str = "Policy";
    const LAGS_AFTER_CREATE: bool = true;

    async fn list(&self) -> DeployResult<Vec<PolicyRecord>> {
        self.iam
            .list_policies()
            .await?
            .iter()
            .map(PolicyRecord::from_remote)
            .collect()
    }

    async fn create(&self, ident: &str, document: &Value) -> DeployResult<()> {
        self.iam.create_policy(ident, document).await?;
        Ok(())
    }

    async fn delete(&self, record: &PolicyRecord, _args: &()) -> DeployResult<()> {
        let arn = &record.arn;
        for role in self.iam.list_entities_for_policy(arn).await? {
            self.iam.detach_role_policy(&role, arn).await?;
            debug!(policy = %record.policy_name, role = %role, "Policy detached from role");
        }

        for raw in self.iam.list_policy_versions(arn).await? {
            let version: PolicyVersion = decode("policy version", &raw)?;
            if version.is_default_version {
                continue;
            }
            self.iam.delete_policy_version(arn, &version.version_id).await?;
        }

        self.iam.delete_policy(arn).await?;
        Ok(())
    }
}

/// Reconciles named policy documents onto roles.
#[derive(Debug)]
pub struct Policies {
    ledger: Ledger<PolicyKind>,
    retry: RetryPolicy,
}

impl Policies {
    /// Create a reconciler with an unloaded ledger.
    #[must_use]
    pub fn new(iam: Arc<dyn IamClient>, retry: RetryPolicy) -> Self {
        Self {
            ledger: Ledger::new(PolicyKind { iam }, retry),
            retry,
        }
    }

    fn iam(&self) -> &Arc<dyn IamClient> {
        &self.ledger.kind().iam
    }

    /// Ensure policy `{role}-{purpose}` holds `desired` and is attached to `role`.
    ///
    /// A drifted document is replaced by publishing a new default version;
    /// older versions are kept. Returns the policy ARN.
    pub async fn attach_policy(
        &mut self,
        role: &str,
        purpose: &str,
        desired: &Value,
    ) -> DeployResult<String> {
        let name = format!("{role}-{purpose}");

        let record = match self.ledger.ensure(&name, desired).await? {
            Ensured::Created(record) => {
                info!(policy = %name, "Policy created: {name}");
                record
            }
            Ensured::Existed(record) => {
                let current = self.default_document(&record).await?;
                if documents_equal(desired, &current) {
                    info!(policy = %name, "Policy existed, document current: {name}");
                    record
                } else {
                    info!(policy = %name, "Policy existed, updating document: {name}");
                    let raw = self
                        .iam()
                        .create_policy_version(&record.arn, desired, true)
                        .await?;
                    let version: PolicyVersion = decode("policy version", &raw)?;
                    self.wait_default(&name, &version.version_id).await?
                }
            }
        };

        self.iam().attach_role_policy(role, &record.arn).await?;
        Ok(record.arn)
    }

    /// Delete policies by name, detaching them and removing old versions first.
    pub async fn delete(&mut self, names: &[String]) -> DeployResult<()> {
        for name in names {
            self.ledger.delete(name, &()).await?;
        }
        self.ledger.invalidate();
        Ok(())
    }

    /// Current policy record, if the policy exists.
    pub async fn get(&mut self, name: &str) -> DeployResult<Option<PolicyRecord>> {
        self.ledger.get(name).await
    }

    async fn default_document(&self, record: &PolicyRecord) -> DeployResult<Value> {
        let raw = self
            .iam()
            .get_policy_version(&record.arn, &record.default_version_id)
            .await?;
        let version: PolicyVersion = decode("policy version", &raw)?;
        Ok(version.document.as_ref().map(parse).unwrap_or_default())
    }

    async fn wait_default(&mut self, name: &str, version_id: &str) -> DeployResult<PolicyRecord> {
        let mut backoff = self
            .retry
            .backoff(format!("policy {name} default version {version_id}"));
        loop {
            self.ledger.invalidate();
            let observed = self.ledger.get_wait(name).await?;
            if observed.default_version_id == version_id {
                return Ok(observed);
            }
            backoff
                .pause(format!("default version {}", observed.default_version_id))
                .await?;
        }
    }
}
