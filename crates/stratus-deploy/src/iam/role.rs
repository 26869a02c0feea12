//! Execution role provisioning.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::document::{assume_role_doc, documents_equal};
use crate::error::DeployResult;
use crate::ledger::{decode, Ensured, Ledger, RemoteRecord, ResourceKind};
use crate::retry::RetryPolicy;
use crate::transport::IamClient;

/// A role as listed by the provider.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoleRecord {
    /// Role name.
    pub role_name: String,
    /// Role ARN.
    pub arn: String,
    /// Trust policy, either an object or its JSON encoding.
    pub assume_role_policy_document: Value,
}

impl RemoteRecord for RoleRecord {
    const KIND: &'static str = "role";

    fn ident(&self) -> String {
        self.role_name.clone()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachedPolicy {
    policy_arn: String,
}

/// Ledger operations for roles.
pub struct RoleKind {
    iam: Arc<dyn IamClient>,
}

#[async_trait]
impl ResourceKind for RoleKind {
    type Record = RoleRecord;
    type CreateArgs = Value;
    type DeleteArgs = ();

    const LABEL: &'static str = "Role";
    const LAGS_AFTER_CREATE: bool = true;

    async fn list(&self) -> DeployResult<Vec<RoleRecord>> {
        self.iam
            .list_roles()
            .await?
            .iter()
            .map(RoleRecord::from_remote)
            .collect()
    }

    async fn create(&self, ident: &str, assume_document: &Value) -> DeployResult<()> {
        self.iam.create_role(ident, assume_document).await?;
        Ok(())
    }

    async fn delete(&self, record: &RoleRecord, _args: &()) -> DeployResult<()> {
        let name = &record.role_name;
        for raw in self.iam.list_attached_role_policies(name).await? {
            let attached: AttachedPolicy = decode("attached policy", &raw)?;
            self.iam.detach_role_policy(name, &attached.policy_arn).await?;
            info!(role = %name, "Policy detached: {}", attached.policy_arn);
        }
        self.iam.delete_role(name).await?;
        Ok(())
    }
}

/// Creates, updates and tears down execution roles.
#[derive(Debug)]
pub struct Roles {
    ledger: Ledger<RoleKind>,
    account_id: String,
}

impl Roles {
    /// Create a provisioner for roles in `account_id`.
    #[must_use]
    pub fn new(iam: Arc<dyn IamClient>, account_id: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            ledger: Ledger::new(RoleKind { iam }, retry),
            account_id: account_id.into(),
        }
    }

    /// ARN of a role in this account.
    #[must_use]
    pub fn arn(&self, name: &str) -> String {
        format!("arn:aws:iam::{}:role/{name}", self.account_id)
    }

    /// Ensure the role exists, trusts `principal` and has the managed
    /// policies attached. Returns the role ARN.
    pub async fn ensure_role(
        &mut self,
        name: &str,
        principal: &Value,
        managed_policy_arns: &[String],
    ) -> DeployResult<String> {
        let desired = assume_role_doc(principal);
        let iam = self.ledger.kind().iam.clone();

        match self.ledger.ensure(name, &desired).await? {
            Ensured::Created(_) => info!(role = %name, "Role created: {name}"),
            Ensured::Existed(record) => {
                if documents_equal(&desired, &record.assume_role_policy_document) {
                    info!(role = %name, "Role existed, assume role policy current: {name}");
                } else {
                    iam.update_assume_role_policy(name, &desired).await?;
                    self.ledger.invalidate();
                    info!(role = %name, "Role existed, assume role policy updated: {name}");
                }
            }
        }

        for arn in managed_policy_arns {
            let policy_name = arn.rsplit('/').next().unwrap_or(arn);
            info!(role = %name, "Attaching managed policy: {policy_name}");
            iam.attach_role_policy(name, arn).await?;
        }

        Ok(self.arn(name))
    }

    /// Detach every policy and delete the role. A missing role is not an error.
    pub async fn delete(&mut self, name: &str) -> DeployResult<()> {
        if !self.ledger.delete(name, &()).await? {
            info!(role = %name, "Role not found: {name}");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::test_fixtures::{capture_logs, cloud, fast_retry};
    use crate::transport::MemoryCloud;

    const VPC_POLICY: &str = "arn:aws:iam::aws:policy/service-role/AWSLambdaVPCAccessExecutionRole";

    fn lambda() -> Value {
        json!({ "Service": "lambda.amazonaws.com" })
    }

    fn roles(cloud: &Arc<MemoryCloud>) -> Roles {
        Roles::new(cloud.clone(), "123456789012", fast_retry())
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn second_ensure_leaves_current_trust_policy(cloud: Arc<MemoryCloud>) {
        let logs = capture_logs();
        let mut roles = roles(&cloud);

        let arn = roles.ensure_role("app-role", &lambda(), &[]).await.unwrap();
        roles.ensure_role("app-role", &lambda(), &[]).await.unwrap();

        assert_eq!(arn, "arn:aws:iam::123456789012:role/app-role");
        assert_eq!(cloud.calls("create_role"), 1);
        assert_eq!(cloud.calls("update_assume_role_policy"), 0);
        assert!(logs.contains("Role created: app-role"));
        assert!(logs.contains("Role existed, assume role policy current: app-role"));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn drifted_trust_policy_is_updated(cloud: Arc<MemoryCloud>) {
        let logs = capture_logs();
        cloud
            .create_role("app-role", &assume_role_doc(&json!({ "Service": "ec2.amazonaws.com" })))
            .await
            .unwrap();
        let mut roles = roles(&cloud);

        roles.ensure_role("app-role", &lambda(), &[]).await.unwrap();

        assert_eq!(cloud.calls("update_assume_role_policy"), 1);
        assert!(logs.contains("Role existed, assume role policy updated: app-role"));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn managed_policies_are_attached(cloud: Arc<MemoryCloud>) {
        let logs = capture_logs();
        let mut roles = roles(&cloud);

        roles
            .ensure_role("app-role", &lambda(), &[VPC_POLICY.to_owned()])
            .await
            .unwrap();

        assert_eq!(cloud.attached_policies("app-role"), vec![VPC_POLICY.to_owned()]);
        assert!(logs.contains("Attaching managed policy: AWSLambdaVPCAccessExecutionRole"));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn delete_detaches_before_removing(cloud: Arc<MemoryCloud>) {
        let logs = capture_logs();
        let mut roles = roles(&cloud);
        roles
            .ensure_role("app-role", &lambda(), &[VPC_POLICY.to_owned()])
            .await
            .unwrap();

        roles.delete("app-role").await.unwrap();
        roles.delete("app-role").await.unwrap();

        assert!(!cloud.has_role("app-role"));
        assert_eq!(cloud.calls("detach_role_policy"), 1);
        assert!(logs.contains("Role delete: record deleted"));
        assert!(logs.contains("Role not found: app-role"));
    }
}
