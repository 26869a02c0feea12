//! Provider transport interface.
//!
//! One async client trait per provider service, one method per remote
//! operation. Listing and describe calls return the provider's raw records
//! (`serde_json::Value`, PascalCase keys); the reconcilers map them into
//! explicit record types. Failures carry a [`RemoteErrorKind`] that callers
//! match on instead of inspecting messages.

pub mod memory;

pub use memory::MemoryCloud;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result type for transport calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The addressed resource does not exist.
    NotFound,
    /// A resource with the same name already exists.
    AlreadyExists,
    /// The provider rejected a parameter.
    InvalidParameter,
    /// Throttling or a retryable network failure.
    Transient,
    /// Anything else.
    Other,
}

/// A failed remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Failure classification.
    pub kind: RemoteErrorKind,
    /// Operation name, e.g. `create_function`.
    pub operation: &'static str,
    /// Provider message.
    pub message: String,
}

impl RemoteError {
    /// Create a remote error.
    #[must_use]
    pub fn new(kind: RemoteErrorKind, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation,
            message: message.into(),
        }
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, operation, message)
    }

    /// Create an already-exists error.
    #[must_use]
    pub fn already_exists(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::AlreadyExists, operation, message)
    }

    /// Create an invalid-parameter error.
    #[must_use]
    pub fn invalid_parameter(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidParameter, operation, message)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} in {}: {}", self.kind, self.operation, self.message)
    }
}

impl std::error::Error for RemoteError {}

// =============================================================================
// Request types
// =============================================================================

/// How a function's code is packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageType {
    /// Container image.
    Image,
    /// Zip archive.
    Zip,
}

impl PackageType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "Image",
            Self::Zip => "Zip",
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network placement of a function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VpcConfig {
    /// Subnet identifiers.
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    /// Security group identifiers.
    #[serde(default)]
    pub security_group_ids: Vec<String>,
}

/// Function log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoggingConfig {
    /// `JSON` or `Text`.
    pub log_format: String,
    /// Minimum application log level.
    pub application_log_level: String,
    /// Minimum platform log level.
    pub system_log_level: String,
}

/// Configuration fields sent on create and on configuration update.
///
/// `None` fields are left untouched by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionConfigurationUpdate {
    /// Function name.
    pub function_name: String,
    /// Execution role ARN.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Memory in MB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_size: Option<u32>,
    /// Timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
    /// Environment variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
    /// Network placement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc_config: Option<VpcConfig>,
    /// Log output settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging_config: Option<LoggingConfig>,
}

/// Request to create a function.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateFunctionRequest {
    /// Configuration to create with.
    pub configuration: FunctionConfigurationUpdate,
    /// Packaging of the code.
    pub package_type: PackageType,
    /// Image to run.
    pub image_uri: String,
}

/// Resource policy statement granting invoke rights on a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionRequest {
    /// Function name or ARN.
    pub function: String,
    /// Statement identifier, unique per function.
    pub statement_id: String,
    /// Granted action.
    pub action: String,
    /// Granted principal.
    pub principal: String,
    /// Restrict to calls from this source.
    pub source_arn: Option<String>,
    /// Function URL auth type the grant applies to.
    pub function_url_auth_type: Option<String>,
}

/// Request to create a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRepositoryRequest {
    /// Repository name.
    pub name: String,
    /// Reject re-pushing an existing tag.
    pub immutable_tags: bool,
    /// Encryption type, e.g. `AES256`.
    pub encryption: String,
}

/// Credentials for logging the container engine in to a registry.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    /// Registry user.
    pub username: String,
    /// Registry password.
    pub password: String,
    /// Registry endpoint.
    pub registry: String,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Request to create or update a scheduled rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRuleRequest {
    /// Rule name.
    pub name: String,
    /// `rate(...)` or `cron(...)`.
    pub schedule_expression: String,
    /// `ENABLED` or `DISABLED`.
    pub state: String,
}

/// Target invoked by a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuleTarget {
    /// Target identifier, unique per rule.
    pub id: String,
    /// Target ARN.
    pub arn: String,
    /// JSON payload delivered to the target.
    pub input: String,
}

/// Request to connect a queue to a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMappingRequest {
    /// Function name.
    pub function: String,
    /// Queue ARN.
    pub event_source_arn: String,
    /// Messages per invocation.
    pub batch_size: u32,
}

/// Request to list log streams in a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeStreamsRequest {
    /// Log group name.
    pub group: String,
    /// Most recently active first.
    pub descending: bool,
    /// Maximum streams to return.
    pub limit: u32,
}

/// Request to read events from one log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetEventsRequest {
    /// Log group name.
    pub group: String,
    /// Log stream name.
    pub stream: String,
    /// Oldest events first.
    pub start_from_head: bool,
    /// Maximum events to return.
    pub limit: u32,
}

// =============================================================================
// Client traits
// =============================================================================

/// Identity and access management.
#[async_trait]
pub trait IamClient: Send + Sync {
    /// Account the credentials belong to.
    async fn account_id(&self) -> RemoteResult<String>;

    /// List roles.
    async fn list_roles(&self) -> RemoteResult<Vec<Value>>;
    /// Create a role with an assume-role document.
    async fn create_role(&self, name: &str, assume_document: &Value) -> RemoteResult<Value>;
    /// Replace a role's assume-role document.
    async fn update_assume_role_policy(&self, name: &str, document: &Value) -> RemoteResult<()>;
    /// Delete a role. Fails while policies are attached.
    async fn delete_role(&self, name: &str) -> RemoteResult<()>;

    /// Policies attached to a role.
    async fn list_attached_role_policies(&self, role: &str) -> RemoteResult<Vec<Value>>;
    /// Attach a policy to a role. Idempotent.
    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> RemoteResult<()>;
    /// Detach a policy from a role.
    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> RemoteResult<()>;

    /// List customer-managed policies.
    async fn list_policies(&self) -> RemoteResult<Vec<Value>>;
    /// Create a policy.
    async fn create_policy(&self, name: &str, document: &Value) -> RemoteResult<Value>;
    /// Fetch one version of a policy.
    async fn get_policy_version(&self, policy_arn: &str, version_id: &str) -> RemoteResult<Value>;
    /// List all versions of a policy.
    async fn list_policy_versions(&self, policy_arn: &str) -> RemoteResult<Vec<Value>>;
    /// Publish a new version of a policy.
    async fn create_policy_version(
        &self,
        policy_arn: &str,
        document: &Value,
        set_as_default: bool,
    ) -> RemoteResult<Value>;
    /// Delete a non-default version.
    async fn delete_policy_version(&self, policy_arn: &str, version_id: &str) -> RemoteResult<()>;
    /// Delete a policy with no attachments and no extra versions.
    async fn delete_policy(&self, policy_arn: &str) -> RemoteResult<()>;
    /// Roles the policy is attached to.
    async fn list_entities_for_policy(&self, policy_arn: &str) -> RemoteResult<Vec<String>>;
}

/// Container image registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// List repositories.
    async fn list_repositories(&self) -> RemoteResult<Vec<Value>>;
    /// Create a repository.
    async fn create_repository(&self, request: &CreateRepositoryRequest) -> RemoteResult<Value>;
    /// Replace the repository access policy.
    async fn set_repository_policy(&self, name: &str, policy: &Value) -> RemoteResult<()>;
    /// Current repository access policy.
    async fn get_repository_policy(&self, name: &str) -> RemoteResult<Value>;
    /// Delete a repository. Without `force`, fails when images remain.
    async fn delete_repository(&self, name: &str, force: bool) -> RemoteResult<()>;
    /// Image details, including tags.
    async fn describe_images(&self, name: &str) -> RemoteResult<Vec<Value>>;
    /// Registry login token.
    async fn get_authorization_token(&self) -> RemoteResult<Value>;
    /// Manifest of a tagged image.
    async fn get_image_manifest(&self, name: &str, tag: &str) -> RemoteResult<String>;
    /// Store a manifest under a tag.
    async fn put_image(&self, name: &str, tag: &str, manifest: &str) -> RemoteResult<()>;
}

/// Local container engine holding built images.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Creation time of a local image.
    async fn image_created(&self, image: &str) -> RemoteResult<DateTime<Utc>>;
    /// Tag a local image as `{repository}:{tag}`.
    async fn tag_image(&self, image: &str, repository: &str, tag: &str) -> RemoteResult<()>;
    /// Authenticate against a registry.
    async fn login(&self, credentials: &RegistryCredentials) -> RemoteResult<()>;
    /// Upload `{repository}:{tag}`.
    async fn push_image(&self, repository: &str, tag: &str) -> RemoteResult<()>;
}

/// Serverless functions and their permissions, URLs and event source mappings.
#[async_trait]
pub trait FunctionClient: Send + Sync {
    /// List function configurations.
    async fn list_functions(&self) -> RemoteResult<Vec<Value>>;
    /// `{"Configuration": {...}, "Code": {...}}` for one function.
    async fn get_function(&self, name: &str) -> RemoteResult<Value>;
    /// Create a function.
    async fn create_function(&self, request: &CreateFunctionRequest) -> RemoteResult<Value>;
    /// Update configuration fields.
    async fn update_function_configuration(
        &self,
        request: &FunctionConfigurationUpdate,
    ) -> RemoteResult<Value>;
    /// Point the function at a new image.
    async fn update_function_code(&self, name: &str, image_uri: &str) -> RemoteResult<Value>;
    /// Delete a function.
    async fn delete_function(&self, name: &str) -> RemoteResult<()>;

    /// Add a resource policy statement.
    async fn add_permission(&self, request: &PermissionRequest) -> RemoteResult<()>;
    /// Resource policy document.
    async fn get_policy(&self, function: &str) -> RemoteResult<Value>;
    /// Remove a resource policy statement.
    async fn remove_permission(&self, function: &str, statement_id: &str) -> RemoteResult<()>;

    /// Create a public URL for the function.
    async fn create_function_url_config(&self, function: &str, auth_type: &str)
        -> RemoteResult<Value>;
    /// Existing URL configuration.
    async fn get_function_url_config(&self, function: &str) -> RemoteResult<Value>;
    /// Remove the URL configuration.
    async fn delete_function_url_config(&self, function: &str) -> RemoteResult<()>;

    /// Event source mappings targeting a function.
    async fn list_event_source_mappings(&self, function: &str) -> RemoteResult<Vec<Value>>;
    /// Connect an event source to a function.
    async fn create_event_source_mapping(&self, request: &CreateMappingRequest)
        -> RemoteResult<Value>;
    /// Change the batch size of an event source mapping.
    async fn update_event_source_mapping(&self, uuid: &str, batch_size: u32)
        -> RemoteResult<Value>;
    /// Remove an event source mapping.
    async fn delete_event_source_mapping(&self, uuid: &str) -> RemoteResult<()>;

    /// Invoke synchronously and return the decoded response payload.
    async fn invoke(&self, function: &str, payload: &Value) -> RemoteResult<Value>;
}

/// Scheduled event rules.
#[async_trait]
pub trait EventsClient: Send + Sync {
    /// Rules whose names start with `prefix`.
    async fn list_rules(&self, prefix: &str) -> RemoteResult<Vec<Value>>;
    /// Create or update a rule, returning its ARN.
    async fn put_rule(&self, request: &PutRuleRequest) -> RemoteResult<String>;
    /// Create or update rule targets.
    async fn put_targets(&self, rule: &str, targets: &[RuleTarget]) -> RemoteResult<()>;
    /// Remove rule targets.
    async fn remove_targets(&self, rule: &str, ids: &[String]) -> RemoteResult<()>;
    /// Delete a rule. Succeeds when the rule does not exist.
    async fn delete_rule(&self, name: &str) -> RemoteResult<()>;
}

/// Message queues.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Queues whose names start with `prefix`, with attributes.
    async fn list_queues(&self, prefix: &str) -> RemoteResult<Vec<Value>>;
    /// Create a queue.
    async fn create_queue(&self, name: &str, attributes: &BTreeMap<String, String>)
        -> RemoteResult<Value>;
    /// Replace queue attributes.
    async fn set_queue_attributes(
        &self,
        url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> RemoteResult<()>;
    /// Delete a queue.
    async fn delete_queue(&self, url: &str) -> RemoteResult<()>;
}

/// Function execution logs.
#[async_trait]
pub trait LogsClient: Send + Sync {
    /// Streams in a log group ordered by last event time.
    async fn describe_log_streams(&self, request: &DescribeStreamsRequest)
        -> RemoteResult<Vec<Value>>;
    /// Events of one stream.
    async fn get_log_events(&self, request: &GetEventsRequest) -> RemoteResult<Vec<Value>>;
}

/// Handles to every provider service the deployer talks to.
#[derive(Clone)]
pub struct Cloud {
    /// Identity and access management.
    pub iam: Arc<dyn IamClient>,
    /// Image registry.
    pub registry: Arc<dyn RegistryClient>,
    /// Local container engine.
    pub engine: Arc<dyn ContainerEngine>,
    /// Functions.
    pub functions: Arc<dyn FunctionClient>,
    /// Event rules.
    pub events: Arc<dyn EventsClient>,
    /// Queues.
    pub queues: Arc<dyn QueueClient>,
    /// Logs.
    pub logs: Arc<dyn LogsClient>,
}

impl Cloud {
    /// Use one provider object for every service.
    #[must_use]
    pub fn from_provider<P>(provider: Arc<P>) -> Self
    where
        P: IamClient
            + RegistryClient
            + ContainerEngine
            + FunctionClient
            + EventsClient
            + QueueClient
            + LogsClient
            + 'static,
    {
        Self {
            iam: provider.clone(),
            registry: provider.clone(),
            engine: provider.clone(),
            functions: provider.clone(),
            events: provider.clone(),
            queues: provider.clone(),
            logs: provider,
        }
    }
}

impl fmt::Debug for Cloud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cloud").finish_non_exhaustive()
    }
}
