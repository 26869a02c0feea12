//! The deployed function: desired configuration, deploy state machine, URL
//! and teardown.

pub mod machine;
pub mod spec;
pub mod state;
pub mod url;

pub use machine::{DeployOutcome, DeployedFunction, FunctionDeployer};
pub use spec::{FunctionRecord, FunctionSpec};
pub use state::{FunctionDeployment, FunctionPhase};
pub use url::FunctionUrls;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::DeployResult;
use crate::ledger::{Ledger, RemoteRecord, ResourceKind};
use crate::retry::RetryPolicy;
use crate::transport::{CreateFunctionRequest, FunctionClient};

/// Ledger operations for functions.
///
/// [`Functions`] only lists and deletes through this kind. Creation belongs
/// to [`FunctionDeployer`], which needs the raw already-exists answer to
/// decide between update and replace.
pub struct FunctionKind {
    functions: Arc<dyn FunctionClient>,
}

#[async_trait]
impl ResourceKind for FunctionKind {
    type Record = FunctionRecord;
    type CreateArgs = CreateFunctionRequest;
    type DeleteArgs = ();

    const LABEL: &'static str = "Function";

    async fn list(&self) -> DeployResult<Vec<FunctionRecord>> {
        self.functions
            .list_functions()
            .await?
            .iter()
            .map(FunctionRecord::from_remote)
            .collect()
    }

    async fn create(&self, _ident: &str, request: &CreateFunctionRequest) -> DeployResult<()> {
        self.functions.create_function(request).await?;
        Ok(())
    }

    async fn delete(&self, record: &FunctionRecord, _args: &()) -> DeployResult<()> {
        Ok(self.functions.delete_function(&record.function_name).await?)
    }
}

/// Listing and teardown of functions.
#[derive(Debug)]
pub struct Functions {
    ledger: Ledger<FunctionKind>,
}

impl Functions {
    /// Create a view over the account's functions.
    #[must_use]
    pub fn new(functions: Arc<dyn FunctionClient>, retry: RetryPolicy) -> Self {
        Self {
            ledger: Ledger::new(FunctionKind { functions }, retry),
        }
    }

    /// Listed record of a function.
    pub async fn get(&mut self, name: &str) -> DeployResult<Option<FunctionRecord>> {
        self.ledger.get(name).await
    }

    /// Delete the function if it exists.
    pub async fn delete(&mut self, name: &str) -> DeployResult<bool> {
        let deleted = self.ledger.delete(name, &()).await?;
        if deleted {
            info!(function = %name, "Function deleted");
        } else {
            info!(function = %name, "Function not found");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::test_fixtures::{capture_logs, cloud, fast_retry};
    use crate::transport::{MemoryCloud, PackageType};

    #[rstest]
    #[tokio::test]
    async fn delete_tolerates_missing_function(cloud: Arc<MemoryCloud>) {
        let logs = capture_logs();
        cloud.seed_function("app-func-qa", PackageType::Image, Some("repo:tag"));
        let mut functions = Functions::new(cloud.clone(), fast_retry());

        assert!(functions.get("app-func-qa").await.unwrap().is_some());
        assert!(functions.delete("app-func-qa").await.unwrap());
        assert!(!functions.delete("app-func-qa").await.unwrap());

        assert_eq!(cloud.calls("delete_function"), 1);
        assert!(!cloud.has_function("app-func-qa"));
        assert!(logs.contains("Function deleted"));
        assert!(logs.contains("Function not found"));
    }

    #[rstest]
    #[tokio::test]
    async fn ledger_ensure_creates_function_once(cloud: Arc<MemoryCloud>) {
        let mut ledger = Ledger::new(
            FunctionKind {
                functions: cloud.clone(),
            },
            fast_retry(),
        );
        let spec = FunctionSpec {
            role: Some("arn:aws:iam::123456789012:role/app".to_owned()),
            ..FunctionSpec::new("app-func-qa")
        };
        let request = CreateFunctionRequest {
            configuration: spec.to_update(),
            package_type: PackageType::Image,
            image_uri: "repo:tag".to_owned(),
        };

        let first = ledger.ensure("app-func-qa", &request).await.unwrap();
        let second = ledger.ensure("app-func-qa", &request).await.unwrap();

        assert!(first.was_created());
        assert!(!second.was_created());
        assert_eq!(first.record(), second.record());
        assert_eq!(cloud.calls("create_function"), 1);
    }
}
