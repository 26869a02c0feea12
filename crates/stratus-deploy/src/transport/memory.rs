//! In-memory provider for tests and local dry runs.
//!
//! Implements every transport trait against a single mutex-guarded state.
//! Records every call by operation name, lets tests queue failures per
//! operation, and simulates the provider behaviours the reconcilers must cope
//! with: listings that lag behind creates, function updates that stay
//! `InProgress` for a number of polls, policy versions that propagate slowly
//! and deletes that take a while to disappear.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{
    ContainerEngine, CreateFunctionRequest, CreateMappingRequest, CreateRepositoryRequest,
    DescribeStreamsRequest, EventsClient, FunctionClient, FunctionConfigurationUpdate,
    GetEventsRequest, IamClient, LoggingConfig, LogsClient, PackageType, PermissionRequest,
    PutRuleRequest, QueueClient, RegistryClient, RegistryCredentials, RemoteError,
    RemoteErrorKind, RemoteResult, RuleTarget, VpcConfig,
};

const REGISTRY_USER: &str = "AWS";
const REGISTRY_PASSWORD: &str = "memory-registry-token";
const AWS_MANAGED_POLICY_PREFIX: &str = "arn:aws:iam::aws:policy/";

/// In-memory implementation of every provider service.
///
/// Data is lost when the value is dropped.
#[derive(Debug)]
pub struct MemoryCloud {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    account_id: String,
    region: String,

    roles: BTreeMap<String, MemRole>,
    policies: BTreeMap<String, MemPolicy>,
    repositories: BTreeMap<String, MemRepository>,
    local_images: BTreeMap<String, DateTime<Utc>>,
    local_tags: BTreeMap<String, String>,
    logged_in: BTreeSet<String>,
    functions: BTreeMap<String, MemFunction>,
    mappings: BTreeMap<String, MemMapping>,
    rules: BTreeMap<String, MemRule>,
    queues: BTreeMap<String, MemQueue>,
    log_groups: BTreeMap<String, Vec<MemStream>>,
    invocations: Vec<(String, Value)>,

    calls: BTreeMap<&'static str, usize>,
    faults: BTreeMap<&'static str, VecDeque<RemoteError>>,
    list_lag: BTreeMap<&'static str, u32>,
    hidden: BTreeMap<(&'static str, String), u32>,
    update_polls: u32,
    delete_polls: u32,
    policy_version_lag: u32,
    sequence: u64,
}

#[derive(Debug)]
struct MemRole {
    arn: String,
    assume: Value,
    attached: BTreeSet<String>,
}

#[derive(Debug)]
struct MemPolicy {
    name: String,
    versions: Vec<(String, Value)>,
    default_version: String,
    reported_default: String,
    default_lag: u32,
    next_version: u32,
}

#[derive(Debug)]
struct MemRepository {
    uri: String,
    arn: String,
    immutable: bool,
    encryption: String,
    policy: Option<Value>,
    images: Vec<MemImage>,
}

#[derive(Debug)]
struct MemImage {
    digest: String,
    manifest: String,
    tags: Vec<String>,
}

#[derive(Debug)]
struct MemFunction {
    arn: String,
    package_type: PackageType,
    image_uri: Option<String>,
    role: String,
    memory_size: u32,
    timeout: u32,
    environment: BTreeMap<String, String>,
    vpc: VpcConfig,
    logging: Option<LoggingConfig>,
    pending_polls: u32,
    failure: Option<String>,
    deleting: Option<u32>,
    statements: BTreeMap<String, Value>,
    url: Option<String>,
}

#[derive(Debug)]
struct MemMapping {
    function: String,
    function_arn: String,
    source_arn: String,
    batch_size: u32,
}

#[derive(Debug)]
struct MemRule {
    arn: String,
    schedule: String,
    state: String,
    targets: Vec<RuleTarget>,
}

#[derive(Debug)]
struct MemQueue {
    url: String,
    arn: String,
    attributes: BTreeMap<String, String>,
}

#[derive(Debug)]
struct MemStream {
    name: String,
    events: Vec<(i64, String)>,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCloud {
    /// Create an empty provider for account `123456789012` in `eu-west-1`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_account("123456789012", "eu-west-1")
    }

    /// Create an empty provider for the given account and region.
    #[must_use]
    pub fn with_account(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(State {
                account_id: account_id.into(),
                region: region.into(),
                ..State::default()
            }),
        }
    }

    fn enter(&self, operation: &'static str) -> RemoteResult<MutexGuard<'_, State>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RemoteError::new(RemoteErrorKind::Other, operation, "lock poisoned"))?;

        *state.calls.entry(operation).or_default() += 1;
        if let Some(err) = state.faults.get_mut(operation).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    // -------------------------------------------------------------------------
    // Test controls
    // -------------------------------------------------------------------------

    /// Number of times an operation was called.
    #[must_use]
    pub fn calls(&self, operation: &str) -> usize {
        self.with_state(|s| s.calls.get(operation).copied().unwrap_or(0))
    }

    /// Make the next call of `operation` fail.
    pub fn fail_next(&self, operation: &'static str, kind: RemoteErrorKind, message: &str) {
        self.with_state(|s| {
            s.faults
                .entry(operation)
                .or_default()
                .push_back(RemoteError::new(kind, operation, message));
        });
    }

    /// Hide newly created records from the next `lists` calls of `list_operation`.
    pub fn set_list_lag(&self, list_operation: &'static str, lists: u32) {
        self.with_state(|s| {
            s.list_lag.insert(list_operation, lists);
        });
    }

    /// Number of `get_function` polls that report `InProgress` after each
    /// create or update.
    pub fn set_update_polls(&self, polls: u32) {
        self.with_state(|s| s.update_polls = polls);
    }

    /// Number of `get_function` polls that still see a deleted function.
    pub fn set_delete_polls(&self, polls: u32) {
        self.with_state(|s| s.delete_polls = polls);
    }

    /// Number of `list_policies` calls that still report the previous default
    /// version after a new one is published.
    pub fn set_policy_version_lag(&self, lists: u32) {
        self.with_state(|s| s.policy_version_lag = lists);
    }

    /// Report `Failed` with `reason` once the function's update settles.
    pub fn fail_function_updates(&self, function: &str, reason: &str) {
        self.with_state(|s| {
            if let Some(f) = s.functions.get_mut(function) {
                f.failure = Some(reason.to_owned());
            }
        });
    }

    /// Register a locally built image.
    pub fn add_local_image(&self, image: &str, created: DateTime<Utc>) {
        self.with_state(|s| {
            s.local_images.insert(image.to_owned(), created);
        });
    }

    /// Create a function directly, bypassing call accounting.
    pub fn seed_function(&self, name: &str, package_type: PackageType, image_uri: Option<&str>) {
        self.with_state(|s| {
            let arn = s.function_arn(name);
            s.functions.insert(
                name.to_owned(),
                MemFunction::new(arn, package_type, image_uri.map(ToOwned::to_owned), 0),
            );
        });
    }

    /// Append events to a log stream, creating group and stream as needed.
    pub fn put_log_events(&self, group: &str, stream: &str, events: &[(i64, &str)]) {
        self.with_state(|s| {
            let streams = s.log_groups.entry(group.to_owned()).or_default();
            let position = streams.iter().position(|st| st.name == stream);
            let index = position.unwrap_or_else(|| {
                streams.push(MemStream {
                    name: stream.to_owned(),
                    events: Vec::new(),
                });
                streams.len() - 1
            });
            if let Some(target) = streams.get_mut(index) {
                target
                    .events
                    .extend(events.iter().map(|(ts, msg)| (*ts, (*msg).to_owned())));
            }
        });
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Whether a role exists.
    #[must_use]
    pub fn has_role(&self, name: &str) -> bool {
        self.with_state(|s| s.roles.contains_key(name))
    }

    /// ARNs of the policies attached to a role.
    #[must_use]
    pub fn attached_policies(&self, role: &str) -> Vec<String> {
        self.with_state(|s| {
            s.roles
                .get(role)
                .map(|r| r.attached.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Number of stored versions of a policy, by name.
    #[must_use]
    pub fn policy_version_count(&self, name: &str) -> usize {
        self.with_state(|s| {
            s.policies
                .values()
                .find(|p| p.name == name)
                .map_or(0, |p| p.versions.len())
        })
    }

    /// Default document of a policy, by name.
    #[must_use]
    pub fn policy_document(&self, name: &str) -> Option<Value> {
        self.with_state(|s| {
            s.policies
                .values()
                .find(|p| p.name == name)
                .and_then(MemPolicy::default_document)
                .cloned()
        })
    }

    /// Whether a repository exists.
    #[must_use]
    pub fn has_repository(&self, name: &str) -> bool {
        self.with_state(|s| s.repositories.contains_key(name))
    }

    /// All tags in a repository.
    #[must_use]
    pub fn repository_tags(&self, name: &str) -> Vec<String> {
        self.with_state(|s| {
            s.repositories
                .get(name)
                .map(|r| r.images.iter().flat_map(|i| i.tags.clone()).collect())
                .unwrap_or_default()
        })
    }

    /// Whether a function exists.
    #[must_use]
    pub fn has_function(&self, name: &str) -> bool {
        self.with_state(|s| s.functions.contains_key(name))
    }

    /// Image and packaging of a function.
    #[must_use]
    pub fn function_image(&self, name: &str) -> Option<(PackageType, Option<String>)> {
        self.with_state(|s| {
            s.functions
                .get(name)
                .map(|f| (f.package_type, f.image_uri.clone()))
        })
    }

    /// Resource policy statement ids of a function.
    #[must_use]
    pub fn function_permissions(&self, name: &str) -> Vec<String> {
        self.with_state(|s| {
            s.functions
                .get(name)
                .map(|f| f.statements.keys().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Public URL of a function.
    #[must_use]
    pub fn function_url(&self, name: &str) -> Option<String> {
        self.with_state(|s| s.functions.get(name).and_then(|f| f.url.clone()))
    }

    /// Names of all rules.
    #[must_use]
    pub fn rule_names(&self) -> Vec<String> {
        self.with_state(|s| s.rules.keys().cloned().collect())
    }

    /// Schedule expression and state of a rule.
    #[must_use]
    pub fn rule_schedule(&self, name: &str) -> Option<(String, String)> {
        self.with_state(|s| {
            s.rules
                .get(name)
                .map(|r| (r.schedule.clone(), r.state.clone()))
        })
    }

    /// Targets of a rule.
    #[must_use]
    pub fn rule_targets(&self, name: &str) -> Vec<RuleTarget> {
        self.with_state(|s| {
            s.rules
                .get(name)
                .map(|r| r.targets.clone())
                .unwrap_or_default()
        })
    }

    /// Names of all queues.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        self.with_state(|s| s.queues.keys().cloned().collect())
    }

    /// Attributes of a queue.
    #[must_use]
    pub fn queue_attributes(&self, name: &str) -> BTreeMap<String, String> {
        self.with_state(|s| {
            s.queues
                .get(name)
                .map(|q| q.attributes.clone())
                .unwrap_or_default()
        })
    }

    /// Event source ARNs mapped to a function.
    #[must_use]
    pub fn mapping_sources(&self, function: &str) -> Vec<String> {
        self.with_state(|s| {
            s.mappings
                .values()
                .filter(|m| m.function == function)
                .map(|m| m.source_arn.clone())
                .collect()
        })
    }

    /// Batch size of the mapping from `source_arn` to a function.
    #[must_use]
    pub fn mapping_batch_size(&self, function: &str, source_arn: &str) -> Option<u32> {
        self.with_state(|s| {
            s.mappings
                .values()
                .find(|m| m.function == function && m.source_arn == source_arn)
                .map(|m| m.batch_size)
        })
    }

    /// Payloads passed to `invoke`, in call order.
    #[must_use]
    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.with_state(|s| s.invocations.clone())
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn function_arn(&self, name: &str) -> String {
        format!(
            "arn:aws:lambda:{}:{}:function:{name}",
            self.region, self.account_id
        )
    }

    fn hide(&mut self, list_operation: &'static str, ident: &str) {
        if let Some(&lists) = self.list_lag.get(list_operation) {
            if lists > 0 {
                self.hidden.insert((list_operation, ident.to_owned()), lists);
            }
        }
    }

    fn function_mut(
        &mut self,
        operation: &'static str,
        name: &str,
    ) -> RemoteResult<&mut MemFunction> {
        // accepts a name or an unqualified ARN
        let name = name.rsplit(':').next().unwrap_or(name);
        self.functions
            .get_mut(name)
            .ok_or_else(|| RemoteError::not_found(operation, format!("Function not found: {name}")))
    }

    fn role_mut(&mut self, operation: &'static str, name: &str) -> RemoteResult<&mut MemRole> {
        self.roles.get_mut(name).ok_or_else(|| {
            RemoteError::not_found(operation, format!("The role with name {name} cannot be found."))
        })
    }

    fn policy_mut(&mut self, operation: &'static str, arn: &str) -> RemoteResult<&mut MemPolicy> {
        self.policies.get_mut(arn).ok_or_else(|| {
            RemoteError::not_found(operation, format!("Policy {arn} does not exist."))
        })
    }

    fn repository_mut(
        &mut self,
        operation: &'static str,
        name: &str,
    ) -> RemoteResult<&mut MemRepository> {
        self.repositories.get_mut(name).ok_or_else(|| {
            RemoteError::not_found(operation, format!("The repository '{name}' does not exist"))
        })
    }
}

/// Consume one unit of listing lag; `true` when the record is visible.
fn reveal(
    hidden: &mut BTreeMap<(&'static str, String), u32>,
    list_operation: &'static str,
    ident: &str,
) -> bool {
    let key = (list_operation, ident.to_owned());
    let Some(remaining) = hidden.get_mut(&key) else {
        return true;
    };
    *remaining = remaining.saturating_sub(1);
    if *remaining == 0 {
        hidden.remove(&key);
    }
    false
}

fn policy_name(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

impl MemPolicy {
    fn default_document(&self) -> Option<&Value> {
        self.versions
            .iter()
            .find(|(id, _)| *id == self.default_version)
            .map(|(_, doc)| doc)
    }
}

impl MemFunction {
    fn new(
        arn: String,
        package_type: PackageType,
        image_uri: Option<String>,
        pending_polls: u32,
    ) -> Self {
        Self {
            arn,
            package_type,
            image_uri,
            role: String::new(),
            memory_size: 128,
            timeout: 3,
            environment: BTreeMap::new(),
            vpc: VpcConfig::default(),
            logging: None,
            pending_polls,
            failure: None,
            deleting: None,
            statements: BTreeMap::new(),
            url: None,
        }
    }

    fn apply(&mut self, update: &FunctionConfigurationUpdate) {
        if let Some(role) = &update.role {
            self.role.clone_from(role);
        }
        if let Some(memory) = update.memory_size {
            self.memory_size = memory;
        }
        if let Some(timeout) = update.timeout {
            self.timeout = timeout;
        }
        if let Some(env) = &update.environment {
            self.environment.clone_from(env);
        }
        if let Some(vpc) = &update.vpc_config {
            self.vpc.clone_from(vpc);
        }
        if let Some(logging) = &update.logging_config {
            self.logging = Some(logging.clone());
        }
    }

    fn configuration(&self, name: &str, status: &str) -> Value {
        let mut config = json!({
            "FunctionName": name,
            "FunctionArn": self.arn,
            "PackageType": self.package_type.as_str(),
            "Role": self.role,
            "MemorySize": self.memory_size,
            "Timeout": self.timeout,
            "Environment": { "Variables": self.environment },
            "VpcConfig": self.vpc,
            "LastUpdateStatus": status,
        });
        if let Some(fields) = config.as_object_mut() {
            if let Some(logging) = &self.logging {
                fields.insert("LoggingConfig".to_owned(), json!(logging));
            }
            if status == "Failed" {
                if let Some(reason) = &self.failure {
                    fields.insert("LastUpdateStatusReason".to_owned(), json!(reason));
                }
            }
        }
        config
    }

    fn in_progress(&self, operation: &'static str) -> RemoteResult<()> {
        if self.pending_polls > 0 {
            return Err(RemoteError::new(
                RemoteErrorKind::Other,
                operation,
                format!("An update is in progress for resource: {}", self.arn),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// IAM
// =============================================================================

#[async_trait]
impl IamClient for MemoryCloud {
    async fn account_id(&self) -> RemoteResult<String> {
        let state = self.enter("get_caller_identity")?;
        Ok(state.account_id.clone())
    }

    async fn list_roles(&self) -> RemoteResult<Vec<Value>> {
        let mut guard = self.enter("list_roles")?;
        let state = &mut *guard;
        Ok(state
            .roles
            .iter()
            .filter(|(name, _)| reveal(&mut state.hidden, "list_roles", name))
            .map(|(name, role)| {
                json!({
                    "RoleName": name,
                    "Arn": role.arn,
                    "AssumeRolePolicyDocument": role.assume.to_string(),
                })
            })
            .collect())
    }

    async fn create_role(&self, name: &str, assume_document: &Value) -> RemoteResult<Value> {
        let mut state = self.enter("create_role")?;
        if state.roles.contains_key(name) {
            return Err(RemoteError::already_exists(
                "create_role",
                format!("Role with name {name} already exists."),
            ));
        }
        let arn = format!("arn:aws:iam::{}:role/{name}", state.account_id);
        state.roles.insert(
            name.to_owned(),
            MemRole {
                arn: arn.clone(),
                assume: assume_document.clone(),
                attached: BTreeSet::new(),
            },
        );
        state.hide("list_roles", name);
        Ok(json!({ "RoleName": name, "Arn": arn }))
    }

    async fn update_assume_role_policy(&self, name: &str, document: &Value) -> RemoteResult<()> {
        let mut state = self.enter("update_assume_role_policy")?;
        state.role_mut("update_assume_role_policy", name)?.assume = document.clone();
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> RemoteResult<()> {
        let mut state = self.enter("delete_role")?;
        let role = state.role_mut("delete_role", name)?;
        if !role.attached.is_empty() {
            return Err(RemoteError::new(
                RemoteErrorKind::Other,
                "delete_role",
                "Cannot delete entity, must detach all policies first.",
            ));
        }
        state.roles.remove(name);
        Ok(())
    }

    async fn list_attached_role_policies(&self, role: &str) -> RemoteResult<Vec<Value>> {
        let mut state = self.enter("list_attached_role_policies")?;
        let role = state.role_mut("list_attached_role_policies", role)?;
        Ok(role
            .attached
            .iter()
            .map(|arn| json!({ "PolicyName": policy_name(arn), "PolicyArn": arn }))
            .collect())
    }

    async fn attach_role_policy(&self, role: &str, policy_arn: &str) -> RemoteResult<()> {
        let mut state = self.enter("attach_role_policy")?;
        if !policy_arn.starts_with(AWS_MANAGED_POLICY_PREFIX)
            && !state.policies.contains_key(policy_arn)
        {
            return Err(RemoteError::not_found(
                "attach_role_policy",
                format!("Policy {policy_arn} does not exist or is not attachable."),
            ));
        }
        state
            .role_mut("attach_role_policy", role)?
            .attached
            .insert(policy_arn.to_owned());
        Ok(())
    }

    async fn detach_role_policy(&self, role: &str, policy_arn: &str) -> RemoteResult<()> {
        let mut state = self.enter("detach_role_policy")?;
        if !state
            .role_mut("detach_role_policy", role)?
            .attached
            .remove(policy_arn)
        {
            return Err(RemoteError::not_found(
                "detach_role_policy",
                format!("Policy {policy_arn} was not found."),
            ));
        }
        Ok(())
    }

    async fn list_policies(&self) -> RemoteResult<Vec<Value>> {
        let mut guard = self.enter("list_policies")?;
        let state = &mut *guard;
        let mut records = Vec::new();
        for (arn, policy) in &mut state.policies {
            if !reveal(&mut state.hidden, "list_policies", &policy.name) {
                continue;
            }
            let reported = if policy.default_lag > 0 {
                policy.default_lag -= 1;
                policy.reported_default.clone()
            } else {
                policy.reported_default.clone_from(&policy.default_version);
                policy.default_version.clone()
            };
            records.push(json!({
                "PolicyName": policy.name,
                "Arn": arn,
                "DefaultVersionId": reported,
            }));
        }
        Ok(records)
    }

    async fn create_policy(&self, name: &str, document: &Value) -> RemoteResult<Value> {
        let mut state = self.enter("create_policy")?;
        let arn = format!("arn:aws:iam::{}:policy/{name}", state.account_id);
        if state.policies.contains_key(&arn) {
            return Err(RemoteError::already_exists(
                "create_policy",
                format!("A policy called {name} already exists."),
            ));
        }
        state.policies.insert(
            arn.clone(),
            MemPolicy {
                name: name.to_owned(),
                versions: vec![("v1".to_owned(), document.clone())],
                default_version: "v1".to_owned(),
                reported_default: "v1".to_owned(),
                default_lag: 0,
                next_version: 2,
            },
        );
        state.hide("list_policies", name);
        Ok(json!({ "PolicyName": name, "Arn": arn, "DefaultVersionId": "v1" }))
    }

    async fn get_policy_version(&self, policy_arn: &str, version_id: &str) -> RemoteResult<Value> {
        let mut state = self.enter("get_policy_version")?;
        let policy = state.policy_mut("get_policy_version", policy_arn)?;
        let (id, document) = policy
            .versions
            .iter()
            .find(|(id, _)| id == version_id)
            .ok_or_else(|| {
                RemoteError::not_found(
                    "get_policy_version",
                    format!("Policy {policy_arn} version {version_id} does not exist."),
                )
            })?;
        Ok(json!({
            "VersionId": id,
            "IsDefaultVersion": *id == policy.default_version,
            "Document": document.to_string(),
        }))
    }

    async fn list_policy_versions(&self, policy_arn: &str) -> RemoteResult<Vec<Value>> {
        let mut state = self.enter("list_policy_versions")?;
        let policy = state.policy_mut("list_policy_versions", policy_arn)?;
        Ok(policy
            .versions
            .iter()
            .map(|(id, _)| {
                json!({ "VersionId": id, "IsDefaultVersion": *id == policy.default_version })
            })
            .collect())
    }

    async fn create_policy_version(
        &self,
        policy_arn: &str,
        document: &Value,
        set_as_default: bool,
    ) -> RemoteResult<Value> {
        let mut state = self.enter("create_policy_version")?;
        let lag = state.policy_version_lag;
        let policy = state.policy_mut("create_policy_version", policy_arn)?;
        let id = format!("v{}", policy.next_version);
        policy.next_version += 1;
        policy.versions.push((id.clone(), document.clone()));
        if set_as_default {
            policy.reported_default.clone_from(&policy.default_version);
            policy.default_version.clone_from(&id);
            policy.default_lag = lag;
        }
        Ok(json!({ "VersionId": id, "IsDefaultVersion": set_as_default }))
    }

    async fn delete_policy_version(&self, policy_arn: &str, version_id: &str) -> RemoteResult<()> {
        let mut state = self.enter("delete_policy_version")?;
        let policy = state.policy_mut("delete_policy_version", policy_arn)?;
        if policy.default_version == version_id {
            return Err(RemoteError::new(
                RemoteErrorKind::Other,
                "delete_policy_version",
                "Cannot delete the default version of a policy.",
            ));
        }
        let before = policy.versions.len();
        policy.versions.retain(|(id, _)| id != version_id);
        if policy.versions.len() == before {
            return Err(RemoteError::not_found(
                "delete_policy_version",
                format!("Policy {policy_arn} version {version_id} does not exist."),
            ));
        }
        Ok(())
    }

    async fn delete_policy(&self, policy_arn: &str) -> RemoteResult<()> {
        let mut state = self.enter("delete_policy")?;
        let attached = state
            .roles
            .values()
            .any(|r| r.attached.contains(policy_arn));
        let policy = state.policy_mut("delete_policy", policy_arn)?;
        if attached || policy.versions.len() > 1 {
            return Err(RemoteError::new(
                RemoteErrorKind::Other,
                "delete_policy",
                "Cannot delete a policy attached to entities or with non-default versions.",
            ));
        }
        state.policies.remove(policy_arn);
        Ok(())
    }

    async fn list_entities_for_policy(&self, policy_arn: &str) -> RemoteResult<Vec<String>> {
        let mut state = self.enter("list_entities_for_policy")?;
        state.policy_mut("list_entities_for_policy", policy_arn)?;
        Ok(state
            .roles
            .iter()
            .filter(|(_, role)| role.attached.contains(policy_arn))
            .map(|(name, _)| name.clone())
            .collect())
    }
}

// =============================================================================
// Registry and container engine
// =============================================================================

#[async_trait]
impl RegistryClient for MemoryCloud {
    async fn list_repositories(&self) -> RemoteResult<Vec<Value>> {
        let mut guard = self.enter("list_repositories")?;
        let state = &mut *guard;
        Ok(state
            .repositories
            .iter()
            .filter(|(name, _)| reveal(&mut state.hidden, "list_repositories", name))
            .map(|(name, repo)| {
                json!({
                    "RepositoryName": name,
                    "RepositoryUri": repo.uri,
                    "RepositoryArn": repo.arn,
                    "ImageTagMutability": if repo.immutable { "IMMUTABLE" } else { "MUTABLE" },
                    "EncryptionConfiguration": { "EncryptionType": repo.encryption },
                })
            })
            .collect())
    }

    async fn create_repository(&self, request: &CreateRepositoryRequest) -> RemoteResult<Value> {
        let mut state = self.enter("create_repository")?;
        let name = &request.name;
        if state.repositories.contains_key(name) {
            return Err(RemoteError::already_exists(
                "create_repository",
                format!("The repository with name '{name}' already exists"),
            ));
        }
        let uri = format!(
            "{}.dkr.ecr.{}.amazonaws.com/{name}",
            state.account_id, state.region
        );
        let arn = format!(
            "arn:aws:ecr:{}:{}:repository/{name}",
            state.region, state.account_id
        );
        state.repositories.insert(
            name.clone(),
            MemRepository {
                uri: uri.clone(),
                arn: arn.clone(),
                immutable: request.immutable_tags,
                encryption: request.encryption.clone(),
                policy: None,
                images: Vec::new(),
            },
        );
        state.hide("list_repositories", name);
        Ok(json!({ "RepositoryName": name, "RepositoryUri": uri, "RepositoryArn": arn }))
    }

    async fn set_repository_policy(&self, name: &str, policy: &Value) -> RemoteResult<()> {
        let mut state = self.enter("set_repository_policy")?;
        state.repository_mut("set_repository_policy", name)?.policy = Some(policy.clone());
        Ok(())
    }

    async fn get_repository_policy(&self, name: &str) -> RemoteResult<Value> {
        let mut state = self.enter("get_repository_policy")?;
        state
            .repository_mut("get_repository_policy", name)?
            .policy
            .clone()
            .ok_or_else(|| {
                RemoteError::not_found(
                    "get_repository_policy",
                    format!("Repository policy does not exist for '{name}'"),
                )
            })
    }

    async fn delete_repository(&self, name: &str, force: bool) -> RemoteResult<()> {
        let mut state = self.enter("delete_repository")?;
        let repo = state.repository_mut("delete_repository", name)?;
        if !force && !repo.images.is_empty() {
            return Err(RemoteError::new(
                RemoteErrorKind::Other,
                "delete_repository",
                format!("The repository '{name}' cannot be deleted because it still contains images"),
            ));
        }
        state.repositories.remove(name);
        Ok(())
    }

    async fn describe_images(&self, name: &str) -> RemoteResult<Vec<Value>> {
        let mut state = self.enter("describe_images")?;
        let repo = state.repository_mut("describe_images", name)?;
        Ok(repo
            .images
            .iter()
            .map(|image| json!({ "ImageDigest": image.digest, "ImageTags": image.tags }))
            .collect())
    }

    async fn get_authorization_token(&self) -> RemoteResult<Value> {
        let state = self.enter("get_authorization_token")?;
        let token = STANDARD.encode(format!("{REGISTRY_USER}:{REGISTRY_PASSWORD}"));
        Ok(json!({
            "AuthorizationToken": token,
            "ProxyEndpoint": format!(
                "https://{}.dkr.ecr.{}.amazonaws.com",
                state.account_id, state.region
            ),
        }))
    }

    async fn get_image_manifest(&self, name: &str, tag: &str) -> RemoteResult<String> {
        let mut state = self.enter("batch_get_image")?;
        let repo = state.repository_mut("batch_get_image", name)?;
        repo.images
            .iter()
            .find(|image| image.tags.iter().any(|t| t == tag))
            .map(|image| image.manifest.clone())
            .ok_or_else(|| {
                RemoteError::not_found("batch_get_image", format!("Image tag {tag} not found"))
            })
    }

    async fn put_image(&self, name: &str, tag: &str, manifest: &str) -> RemoteResult<()> {
        let mut guard = self.enter("put_image")?;
        let state = &mut *guard;
        let digest = format!("sha256:{:064x}", state.next_id());
        let repo = state.repository_mut("put_image", name)?;
        store_image(repo, "put_image", tag, manifest, digest)
    }
}

fn store_image(
    repo: &mut MemRepository,
    operation: &'static str,
    tag: &str,
    manifest: &str,
    digest: String,
) -> RemoteResult<()> {
    if repo.immutable && repo.images.iter().any(|i| i.tags.iter().any(|t| t == tag)) {
        return Err(RemoteError::already_exists(
            operation,
            format!("The image tag '{tag}' already exists and cannot be overwritten"),
        ));
    }
    for image in &mut repo.images {
        image.tags.retain(|t| t != tag);
    }
    if let Some(image) = repo.images.iter_mut().find(|i| i.manifest == manifest) {
        image.tags.push(tag.to_owned());
    } else {
        repo.images.push(MemImage {
            digest,
            manifest: manifest.to_owned(),
            tags: vec![tag.to_owned()],
        });
    }
    Ok(())
}

#[async_trait]
impl ContainerEngine for MemoryCloud {
    async fn image_created(&self, image: &str) -> RemoteResult<DateTime<Utc>> {
        let state = self.enter("image_created")?;
        state
            .local_images
            .get(image)
            .copied()
            .ok_or_else(|| RemoteError::not_found("image_created", format!("No such image: {image}")))
    }

    async fn tag_image(&self, image: &str, repository: &str, tag: &str) -> RemoteResult<()> {
        let mut state = self.enter("tag_image")?;
        if !state.local_images.contains_key(image) {
            return Err(RemoteError::not_found(
                "tag_image",
                format!("No such image: {image}"),
            ));
        }
        state
            .local_tags
            .insert(format!("{repository}:{tag}"), image.to_owned());
        Ok(())
    }

    async fn login(&self, credentials: &RegistryCredentials) -> RemoteResult<()> {
        let mut state = self.enter("login")?;
        if credentials.username != REGISTRY_USER || credentials.password != REGISTRY_PASSWORD {
            return Err(RemoteError::new(
                RemoteErrorKind::Other,
                "login",
                "unauthorized: authentication required",
            ));
        }
        let registry = credentials.registry.trim_start_matches("https://").to_owned();
        state.logged_in.insert(registry);
        Ok(())
    }

    async fn push_image(&self, repository: &str, tag: &str) -> RemoteResult<()> {
        let mut guard = self.enter("push_image")?;
        let state = &mut *guard;
        let registry = repository.split('/').next().unwrap_or(repository);
        if !state.logged_in.contains(registry) {
            return Err(RemoteError::new(
                RemoteErrorKind::Other,
                "push_image",
                "no basic auth credentials",
            ));
        }
        let image = state
            .local_tags
            .get(&format!("{repository}:{tag}"))
            .cloned()
            .ok_or_else(|| {
                RemoteError::not_found(
                    "push_image",
                    format!("An image does not exist locally with the tag: {repository}:{tag}"),
                )
            })?;
        let digest = format!("sha256:{:064x}", state.next_id());
        let repo = state
            .repositories
            .values_mut()
            .find(|r| r.uri == repository)
            .ok_or_else(|| {
                RemoteError::not_found("push_image", format!("name unknown: {repository}"))
            })?;
        store_image(repo, "push_image", tag, &format!("manifest:{image}"), digest)
    }
}

// =============================================================================
// Functions
// =============================================================================

#[async_trait]
impl FunctionClient for MemoryCloud {
    async fn list_functions(&self) -> RemoteResult<Vec<Value>> {
        let mut guard = self.enter("list_functions")?;
        let state = &mut *guard;
        Ok(state
            .functions
            .iter()
            .filter(|(name, _)| reveal(&mut state.hidden, "list_functions", name))
            .map(|(name, f)| f.configuration(name, "Successful"))
            .collect())
    }

    async fn get_function(&self, name: &str) -> RemoteResult<Value> {
        let mut state = self.enter("get_function")?;
        let function = state.function_mut("get_function", name)?;
        if let Some(remaining) = function.deleting {
            if remaining == 0 {
                state.functions.remove(name);
                return Err(RemoteError::not_found(
                    "get_function",
                    format!("Function not found: {name}"),
                ));
            }
            function.deleting = Some(remaining - 1);
        }

        let status = if function.pending_polls > 0 {
            function.pending_polls -= 1;
            "InProgress"
        } else if function.failure.is_some() {
            "Failed"
        } else {
            "Successful"
        };
        let mut record = json!({ "Configuration": function.configuration(name, status) });
        if let (Some(fields), Some(uri)) = (record.as_object_mut(), &function.image_uri) {
            fields.insert("Code".to_owned(), json!({ "ImageUri": uri }));
        }
        Ok(record)
    }

    async fn create_function(&self, request: &CreateFunctionRequest) -> RemoteResult<Value> {
        let mut state = self.enter("create_function")?;
        let name = &request.configuration.function_name;
        if state.functions.contains_key(name) {
            return Err(RemoteError::already_exists(
                "create_function",
                format!("Function already exist: {name}"),
            ));
        }
        if request.configuration.role.as_deref().unwrap_or_default().is_empty() {
            return Err(RemoteError::invalid_parameter(
                "create_function",
                "The role defined for the function cannot be assumed by Lambda.",
            ));
        }
        let arn = state.function_arn(name);
        let polls = state.update_polls;
        let mut function = MemFunction::new(
            arn,
            request.package_type,
            Some(request.image_uri.clone()),
            polls,
        );
        function.apply(&request.configuration);
        let record = function.configuration(name, "InProgress");
        state.functions.insert(name.clone(), function);
        state.hide("list_functions", name);
        Ok(record)
    }

    async fn update_function_configuration(
        &self,
        request: &FunctionConfigurationUpdate,
    ) -> RemoteResult<Value> {
        let mut state = self.enter("update_function_configuration")?;
        let polls = state.update_polls;
        let name = &request.function_name;
        let function = state.function_mut("update_function_configuration", name)?;
        function.in_progress("update_function_configuration")?;
        function.apply(request);
        function.pending_polls = polls;
        Ok(function.configuration(name, "InProgress"))
    }

    async fn update_function_code(&self, name: &str, image_uri: &str) -> RemoteResult<Value> {
        let mut state = self.enter("update_function_code")?;
        let polls = state.update_polls;
        let function = state.function_mut("update_function_code", name)?;
        if function.package_type != PackageType::Image {
            return Err(RemoteError::invalid_parameter(
                "update_function_code",
                "Please provide ImageUri only for functions with Image package type.",
            ));
        }
        function.in_progress("update_function_code")?;
        function.image_uri = Some(image_uri.to_owned());
        function.pending_polls = polls;
        Ok(function.configuration(name, "InProgress"))
    }

    async fn delete_function(&self, name: &str) -> RemoteResult<()> {
        let mut state = self.enter("delete_function")?;
        let polls = state.delete_polls;
        let function = state.function_mut("delete_function", name)?;
        if polls == 0 {
            state.functions.remove(name);
        } else {
            function.deleting = Some(polls);
        }
        state.mappings.retain(|_, m| m.function != name);
        Ok(())
    }

    async fn add_permission(&self, request: &PermissionRequest) -> RemoteResult<()> {
        let mut state = self.enter("add_permission")?;
        let function = state.function_mut("add_permission", &request.function)?;
        if function.statements.contains_key(&request.statement_id) {
            return Err(RemoteError::already_exists(
                "add_permission",
                format!(
                    "The statement id ({}) provided already exists.",
                    request.statement_id
                ),
            ));
        }
        let principal = if request.principal == "*" {
            json!("*")
        } else {
            json!({ "Service": request.principal })
        };
        let mut statement = json!({
            "Sid": request.statement_id,
            "Effect": "Allow",
            "Principal": principal,
            "Action": request.action,
            "Resource": function.arn,
        });
        if let Some(fields) = statement.as_object_mut() {
            if let Some(source) = &request.source_arn {
                fields.insert(
                    "Condition".to_owned(),
                    json!({ "ArnLike": { "AWS:SourceArn": source } }),
                );
            } else if let Some(auth) = &request.function_url_auth_type {
                fields.insert(
                    "Condition".to_owned(),
                    json!({ "StringEquals": { "lambda:FunctionUrlAuthType": auth } }),
                );
            }
        }
        function
            .statements
            .insert(request.statement_id.clone(), statement);
        Ok(())
    }

    async fn get_policy(&self, function: &str) -> RemoteResult<Value> {
        let mut state = self.enter("get_policy")?;
        let function = state.function_mut("get_policy", function)?;
        if function.statements.is_empty() {
            return Err(RemoteError::not_found(
                "get_policy",
                "The resource you requested does not exist.",
            ));
        }
        let statements: Vec<&Value> = function.statements.values().collect();
        Ok(json!({ "Version": "2012-10-17", "Id": "default", "Statement": statements }))
    }

    async fn remove_permission(&self, function: &str, statement_id: &str) -> RemoteResult<()> {
        let mut state = self.enter("remove_permission")?;
        let function = state.function_mut("remove_permission", function)?;
        if function.statements.remove(statement_id).is_none() {
            return Err(RemoteError::not_found(
                "remove_permission",
                format!("Statement {statement_id} is not found in resource policy."),
            ));
        }
        Ok(())
    }

    async fn create_function_url_config(
        &self,
        function: &str,
        auth_type: &str,
    ) -> RemoteResult<Value> {
        let mut state = self.enter("create_function_url_config")?;
        let region = state.region.clone();
        let target = state.function_mut("create_function_url_config", function)?;
        if target.url.is_some() {
            return Err(RemoteError::already_exists(
                "create_function_url_config",
                format!("FunctionUrlConfig exists for this Lambda function: {function}"),
            ));
        }
        let url = format!("https://{function}.lambda-url.{region}.on.aws/");
        target.url = Some(url.clone());
        Ok(json!({ "FunctionUrl": url, "AuthType": auth_type }))
    }

    async fn get_function_url_config(&self, function: &str) -> RemoteResult<Value> {
        let mut state = self.enter("get_function_url_config")?;
        let target = state.function_mut("get_function_url_config", function)?;
        target
            .url
            .as_ref()
            .map(|url| json!({ "FunctionUrl": url, "AuthType": "NONE" }))
            .ok_or_else(|| {
                RemoteError::not_found(
                    "get_function_url_config",
                    "The resource you requested does not exist.",
                )
            })
    }

    async fn delete_function_url_config(&self, function: &str) -> RemoteResult<()> {
        let mut state = self.enter("delete_function_url_config")?;
        let target = state.function_mut("delete_function_url_config", function)?;
        if target.url.take().is_none() {
            return Err(RemoteError::not_found(
                "delete_function_url_config",
                "The resource you requested does not exist.",
            ));
        }
        Ok(())
    }

    async fn list_event_source_mappings(&self, function: &str) -> RemoteResult<Vec<Value>> {
        let mut guard = self.enter("list_event_source_mappings")?;
        let state = &mut *guard;
        Ok(state
            .mappings
            .iter()
            .filter(|(_, m)| m.function == function)
            .filter(|(_, m)| reveal(&mut state.hidden, "list_event_source_mappings", &m.source_arn))
            .map(|(uuid, m)| mapping_record(uuid, m))
            .collect())
    }

    async fn create_event_source_mapping(
        &self,
        request: &CreateMappingRequest,
    ) -> RemoteResult<Value> {
        let mut state = self.enter("create_event_source_mapping")?;
        let function_arn = state
            .function_mut("create_event_source_mapping", &request.function)?
            .arn
            .clone();
        if let Some((uuid, _)) = state
            .mappings
            .iter()
            .find(|(_, m)| m.function == request.function && m.source_arn == request.event_source_arn)
        {
            return Err(RemoteError::already_exists(
                "create_event_source_mapping",
                format!("The event source arn and function provided mapping already exists. Please update or delete the existing mapping with UUID {uuid}"),
            ));
        }
        let id = state.next_id();
        let uuid = format!("{id:08x}-0000-4000-8000-{id:012x}");
        let mapping = MemMapping {
            function: request.function.clone(),
            function_arn,
            source_arn: request.event_source_arn.clone(),
            batch_size: request.batch_size,
        };
        let record = mapping_record(&uuid, &mapping);
        state.mappings.insert(uuid, mapping);
        state.hide("list_event_source_mappings", &request.event_source_arn);
        Ok(record)
    }

    async fn update_event_source_mapping(
        &self,
        uuid: &str,
        batch_size: u32,
    ) -> RemoteResult<Value> {
        let mut state = self.enter("update_event_source_mapping")?;
        let mapping = state.mappings.get_mut(uuid).ok_or_else(|| {
            RemoteError::not_found(
                "update_event_source_mapping",
                format!("The resource you requested does not exist. (UUID {uuid})"),
            )
        })?;
        mapping.batch_size = batch_size;
        Ok(mapping_record(uuid, mapping))
    }

    async fn delete_event_source_mapping(&self, uuid: &str) -> RemoteResult<()> {
        let mut state = self.enter("delete_event_source_mapping")?;
        if state.mappings.remove(uuid).is_none() {
            return Err(RemoteError::not_found(
                "delete_event_source_mapping",
                format!("The resource you requested does not exist. (UUID {uuid})"),
            ));
        }
        Ok(())
    }

    async fn invoke(&self, function: &str, payload: &Value) -> RemoteResult<Value> {
        let mut state = self.enter("invoke")?;
        state.function_mut("invoke", function)?;
        state
            .invocations
            .push((function.to_owned(), payload.clone()));
        Ok(json!({ "statusCode": 200, "body": payload }))
    }
}

fn mapping_record(uuid: &str, mapping: &MemMapping) -> Value {
    json!({
        "UUID": uuid,
        "EventSourceArn": mapping.source_arn,
        "FunctionArn": mapping.function_arn,
        "BatchSize": mapping.batch_size,
        "State": "Enabled",
    })
}

// =============================================================================
// Events, queues, logs
// =============================================================================

#[async_trait]
impl EventsClient for MemoryCloud {
    async fn list_rules(&self, prefix: &str) -> RemoteResult<Vec<Value>> {
        let mut guard = self.enter("list_rules")?;
        let state = &mut *guard;
        Ok(state
            .rules
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .filter(|(name, _)| reveal(&mut state.hidden, "list_rules", name))
            .map(|(name, rule)| {
                json!({
                    "Name": name,
                    "Arn": rule.arn,
                    "ScheduleExpression": rule.schedule,
                    "State": rule.state,
                })
            })
            .collect())
    }

    async fn put_rule(&self, request: &PutRuleRequest) -> RemoteResult<String> {
        let mut state = self.enter("put_rule")?;
        let arn = format!(
            "arn:aws:events:{}:{}:rule/{}",
            state.region, state.account_id, request.name
        );
        let created = !state.rules.contains_key(&request.name);
        let rule = state.rules.entry(request.name.clone()).or_insert_with(|| MemRule {
            arn: arn.clone(),
            schedule: String::new(),
            state: String::new(),
            targets: Vec::new(),
        });
        rule.schedule.clone_from(&request.schedule_expression);
        rule.state.clone_from(&request.state);
        if created {
            state.hide("list_rules", &request.name);
        }
        Ok(arn)
    }

    async fn put_targets(&self, rule: &str, targets: &[RuleTarget]) -> RemoteResult<()> {
        let mut state = self.enter("put_targets")?;
        let existing = state.rules.get_mut(rule).ok_or_else(|| {
            RemoteError::not_found("put_targets", format!("Rule {rule} does not exist."))
        })?;
        for target in targets {
            existing.targets.retain(|t| t.id != target.id);
            existing.targets.push(target.clone());
        }
        Ok(())
    }

    async fn remove_targets(&self, rule: &str, ids: &[String]) -> RemoteResult<()> {
        let mut state = self.enter("remove_targets")?;
        let existing = state.rules.get_mut(rule).ok_or_else(|| {
            RemoteError::not_found("remove_targets", format!("Rule {rule} does not exist."))
        })?;
        existing.targets.retain(|t| !ids.contains(&t.id));
        Ok(())
    }

    async fn delete_rule(&self, name: &str) -> RemoteResult<()> {
        let mut state = self.enter("delete_rule")?;
        if let Some(rule) = state.rules.get(name) {
            if !rule.targets.is_empty() {
                return Err(RemoteError::new(
                    RemoteErrorKind::Other,
                    "delete_rule",
                    "Rule can't be deleted since it has targets.",
                ));
            }
            state.rules.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for MemoryCloud {
    async fn list_queues(&self, prefix: &str) -> RemoteResult<Vec<Value>> {
        let mut guard = self.enter("list_queues")?;
        let state = &mut *guard;
        Ok(state
            .queues
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .filter(|(name, _)| reveal(&mut state.hidden, "list_queues", name))
            .map(|(name, queue)| {
                json!({
                    "QueueName": name,
                    "QueueUrl": queue.url,
                    "QueueArn": queue.arn,
                    "Attributes": queue.attributes,
                })
            })
            .collect())
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &BTreeMap<String, String>,
    ) -> RemoteResult<Value> {
        let mut state = self.enter("create_queue")?;
        if let Some(existing) = state.queues.get(name) {
            if existing.attributes != *attributes {
                return Err(RemoteError::already_exists(
                    "create_queue",
                    format!("A queue already exists with the same name and a different value for attribute(s): {name}"),
                ));
            }
            return Ok(json!({ "QueueUrl": existing.url }));
        }
        let url = format!(
            "https://sqs.{}.amazonaws.com/{}/{name}",
            state.region, state.account_id
        );
        let arn = format!("arn:aws:sqs:{}:{}:{name}", state.region, state.account_id);
        state.queues.insert(
            name.to_owned(),
            MemQueue {
                url: url.clone(),
                arn,
                attributes: attributes.clone(),
            },
        );
        state.hide("list_queues", name);
        Ok(json!({ "QueueUrl": url }))
    }

    async fn set_queue_attributes(
        &self,
        url: &str,
        attributes: &BTreeMap<String, String>,
    ) -> RemoteResult<()> {
        let mut state = self.enter("set_queue_attributes")?;
        let queue = state
            .queues
            .values_mut()
            .find(|q| q.url == url)
            .ok_or_else(|| {
                RemoteError::not_found("set_queue_attributes", "The specified queue does not exist.")
            })?;
        queue
            .attributes
            .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn delete_queue(&self, url: &str) -> RemoteResult<()> {
        let mut state = self.enter("delete_queue")?;
        let before = state.queues.len();
        state.queues.retain(|_, q| q.url != url);
        if state.queues.len() == before {
            return Err(RemoteError::not_found(
                "delete_queue",
                "The specified queue does not exist.",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LogsClient for MemoryCloud {
    async fn describe_log_streams(
        &self,
        request: &DescribeStreamsRequest,
    ) -> RemoteResult<Vec<Value>> {
        let state = self.enter("describe_log_streams")?;
        let streams = state.log_groups.get(&request.group).ok_or_else(|| {
            RemoteError::not_found(
                "describe_log_streams",
                "The specified log group does not exist.",
            )
        })?;

        let mut listed: Vec<(i64, &str)> = streams
            .iter()
            .map(|s| {
                let last = s.events.iter().map(|(ts, _)| *ts).max().unwrap_or(0);
                (last, s.name.as_str())
            })
            .collect();
        listed.sort_by_key(|(last, _)| *last);
        if request.descending {
            listed.reverse();
        }
        Ok(listed
            .into_iter()
            .take(usize::try_from(request.limit).unwrap_or(usize::MAX))
            .map(|(last, name)| json!({ "LogStreamName": name, "LastEventTimestamp": last }))
            .collect())
    }

    async fn get_log_events(&self, request: &GetEventsRequest) -> RemoteResult<Vec<Value>> {
        let state = self.enter("get_log_events")?;
        let stream = state
            .log_groups
            .get(&request.group)
            .and_then(|streams| streams.iter().find(|s| s.name == request.stream))
            .ok_or_else(|| {
                RemoteError::not_found(
                    "get_log_events",
                    "The specified log stream does not exist.",
                )
            })?;

        let limit = usize::try_from(request.limit).unwrap_or(usize::MAX);
        let skip = if request.start_from_head {
            0
        } else {
            stream.events.len().saturating_sub(limit)
        };
        Ok(stream
            .events
            .iter()
            .skip(skip)
            .take(limit)
            .map(|(ts, message)| json!({ "Timestamp": ts, "Message": message }))
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calls_are_counted_and_faults_consumed() {
        let cloud = MemoryCloud::new();
        cloud.fail_next("list_roles", RemoteErrorKind::Transient, "throttled");

        let err = cloud.list_roles().await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Transient);
        assert!(cloud.list_roles().await.unwrap().is_empty());
        assert_eq!(cloud.calls("list_roles"), 2);
    }

    #[tokio::test]
    async fn listing_lag_hides_new_records() {
        let cloud = MemoryCloud::new();
        cloud.set_list_lag("list_roles", 2);
        cloud.create_role("app", &json!({})).await.unwrap();

        assert!(cloud.list_roles().await.unwrap().is_empty());
        assert!(cloud.list_roles().await.unwrap().is_empty());
        assert_eq!(cloud.list_roles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn function_updates_report_progress_then_success() {
        let cloud = MemoryCloud::new();
        cloud.set_update_polls(1);
        let request = CreateFunctionRequest {
            configuration: FunctionConfigurationUpdate {
                function_name: "f".to_owned(),
                role: Some("arn:aws:iam::123456789012:role/r".to_owned()),
                ..FunctionConfigurationUpdate::default()
            },
            package_type: PackageType::Image,
            image_uri: "repo:tag".to_owned(),
        };
        cloud.create_function(&request).await.unwrap();

        let err = cloud.update_function_code("f", "repo:other").await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Other);

        let first = cloud.get_function("f").await.unwrap();
        assert_eq!(first["Configuration"]["LastUpdateStatus"], "InProgress");
        let second = cloud.get_function("f").await.unwrap();
        assert_eq!(second["Configuration"]["LastUpdateStatus"], "Successful");
        assert_eq!(second["Code"]["ImageUri"], "repo:tag");
    }

    #[tokio::test]
    async fn zip_functions_reject_image_updates() {
        let cloud = MemoryCloud::new();
        cloud.seed_function("f", PackageType::Zip, None);

        let err = cloud.update_function_code("f", "repo:tag").await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn immutable_repositories_reject_retagging() {
        let cloud = MemoryCloud::new();
        cloud
            .create_repository(&CreateRepositoryRequest {
                name: "repo".to_owned(),
                immutable_tags: true,
                encryption: "AES256".to_owned(),
            })
            .await
            .unwrap();
        cloud.put_image("repo", "a", "m1").await.unwrap();

        let err = cloud.put_image("repo", "a", "m2").await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::AlreadyExists);
        cloud.put_image("repo", "b", "m1").await.unwrap();
        assert_eq!(cloud.repository_tags("repo"), vec!["a", "b"]);
    }
}
