//! Public function URL and the resource policy statements on a function.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::error::DeployResult;
use crate::iam::document::parse;
use crate::ledger::decode;
use crate::transport::{FunctionClient, PermissionRequest, RemoteErrorKind};

/// Statement id of the public URL grant.
pub const PUBLIC_URL_STATEMENT: &str = "AllowPublicAccessFunctionUrl";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UrlConfig {
    function_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResourcePolicy {
    #[serde(default)]
    statement: Vec<StatementId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatementId {
    sid: String,
}

/// Manages a function's public URL and resource policy.
pub struct FunctionUrls {
    functions: Arc<dyn FunctionClient>,
}

impl std::fmt::Debug for FunctionUrls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionUrls").finish_non_exhaustive()
    }
}

impl FunctionUrls {
    /// Create a manager.
    #[must_use]
    pub fn new(functions: Arc<dyn FunctionClient>) -> Self {
        Self { functions }
    }

    /// Ensure an unauthenticated URL exists and anyone may invoke through it.
    pub async fn ensure(&self, function: &str) -> DeployResult<String> {
        let raw = match self.functions.create_function_url_config(function, "NONE").await {
            Ok(raw) => {
                info!(function = %function, "Function url config created");
                raw
            }
            Err(e) if e.kind == RemoteErrorKind::AlreadyExists => {
                info!(function = %function, "Function url config existed");
                self.functions.get_function_url_config(function).await?
            }
            Err(e) => return Err(e.into()),
        };
        let config: UrlConfig = decode("function url", &raw)?;

        let grant = PermissionRequest {
            function: function.to_owned(),
            statement_id: PUBLIC_URL_STATEMENT.to_owned(),
            action: "lambda:InvokeFunctionUrl".to_owned(),
            principal: "*".to_owned(),
            source_arn: None,
            function_url_auth_type: Some("NONE".to_owned()),
        };
        match self.functions.add_permission(&grant).await {
            Ok(()) => info!(function = %function, "Function url config permission added"),
            Err(e) if e.kind == RemoteErrorKind::AlreadyExists => {
                info!(function = %function, "Function url config permission existed");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(config.function_url)
    }

    /// Remove the URL configuration if there is one.
    pub async fn delete(&self, function: &str) -> DeployResult<()> {
        match self.functions.delete_function_url_config(function).await {
            Ok(()) => info!(function = %function, "Function URL config deleted"),
            Err(e) if e.kind == RemoteErrorKind::NotFound => {
                info!(function = %function, "Function URL config not found");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Remove every statement from the function's resource policy.
    pub async fn remove_permissions(&self, function: &str) -> DeployResult<()> {
        let raw = match self.functions.get_policy(function).await {
            Ok(raw) => raw,
            Err(e) if e.kind == RemoteErrorKind::NotFound => {
                info!(function = %function, "No policy found for this function");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let policy: ResourcePolicy = decode("resource policy", &parse(&raw))?;

        for statement in policy.statement {
            self.functions
                .remove_permission(function, &statement.sid)
                .await?;
            info!(function = %function, "Removed permission {} from function", statement.sid);
        }
        Ok(())
    }
}
