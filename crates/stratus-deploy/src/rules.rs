//! Scheduled event rules that invoke the function with an action payload.
//!
//! Declared rules are created or updated on every sync. Rules under the
//! resource prefix that are no longer declared are reported but left in
//! place; removing them takes an explicit [`EventRules::delete`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{DeployError, DeployResult};
use crate::ledger::{Ensured, Ledger, RemoteRecord, ResourceKind};
use crate::retry::RetryPolicy;
use crate::transport::{
    EventsClient, FunctionClient, PermissionRequest, PutRuleRequest, RemoteErrorKind, RuleTarget,
};

/// Id of the single target every rule carries.
pub const TARGET_ID: &str = "lambda-func";

/// A declared schedule. Exactly one of `rate` and `cron` must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ScheduleSpec {
    /// Rate expression body, e.g. `5 minutes`.
    #[serde(default)]
    pub rate: Option<String>,
    /// Cron expression body, e.g. `0 3 * * ? *`.
    #[serde(default)]
    pub cron: Option<String>,
    /// Action the function is invoked with.
    pub action: String,
    /// `enabled` or `disabled`, case-insensitive.
    #[serde(default = "default_state")]
    pub state: String,
}

fn default_state() -> String {
    "enabled".to_owned()
}

impl ScheduleSpec {
    /// Rate schedule.
    #[must_use]
    pub fn rate(rate: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            rate: Some(rate.into()),
            action: action.into(),
            state: default_state(),
            ..Self::default()
        }
    }

    /// Cron schedule.
    #[must_use]
    pub fn cron(cron: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            cron: Some(cron.into()),
            action: action.into(),
            state: default_state(),
            ..Self::default()
        }
    }

    /// Provider schedule expression.
    pub fn expression(&self, rule_ident: &str) -> DeployResult<String> {
        match (&self.rate, &self.cron) {
            (Some(rate), None) => Ok(format!("rate({rate})")),
            (None, Some(cron)) => Ok(format!("cron({cron})")),
            (Some(_), Some(_)) => Err(DeployError::configuration(format!(
                "event rule {rule_ident} sets both rate and cron"
            ))),
            (None, None) => Err(DeployError::configuration(format!(
                "event rule {rule_ident} needs a rate or a cron"
            ))),
        }
    }

    /// Provider rule state.
    pub fn provider_state(&self, rule_ident: &str) -> DeployResult<String> {
        let state = self.state.to_uppercase();
        if state == "ENABLED" || state == "DISABLED" {
            return Ok(state);
        }
        Err(DeployError::configuration(format!(
            "event rule {rule_ident} has unknown state {}",
            self.state
        )))
    }
}

/// A rule as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuleRecord {
    /// Rule name.
    pub name: String,
    /// Rule ARN.
    pub arn: String,
    /// Schedule, absent for pattern rules.
    #[serde(default)]
    pub schedule_expression: Option<String>,
    /// `ENABLED` or `DISABLED`.
    #[serde(default)]
    pub state: Option<String>,
}

impl RemoteRecord for RuleRecord {
    const KIND: &'static str = "rule";

    fn ident(&self) -> String {
        self.name.clone()
    }
}

/// Ledger operations for rules under one name prefix.
pub struct RuleKind {
    events: Arc<dyn EventsClient>,
    prefix: String,
}

#[async_trait]
impl ResourceKind for RuleKind {
    type Record = RuleRecord;
    type CreateArgs = PutRuleRequest;
    type DeleteArgs = ();

    const LABEL: &'static str = "Rule";

    async fn list(&self) -> DeployResult<Vec<RuleRecord>> {
        self.events
            .list_rules(&self.prefix)
            .await?
            .iter()
            .map(RuleRecord::from_remote)
            .collect()
    }

    async fn create(&self, _ident: &str, request: &PutRuleRequest) -> DeployResult<()> {
        self.events.put_rule(request).await?;
        Ok(())
    }

    async fn delete(&self, record: &RuleRecord, _args: &()) -> DeployResult<()> {
        let name = &record.name;
        match self
            .events
            .remove_targets(name, &[TARGET_ID.to_owned()])
            .await
        {
            Ok(()) => info!(rule = %name, "Event target deleted: {name}"),
            Err(e) if e.kind == RemoteErrorKind::NotFound => {
                info!(rule = %name, "Event target not found: {name}");
            }
            Err(e) => return Err(e.into()),
        }
        self.events.delete_rule(name).await?;
        Ok(())
    }
}

struct PlannedRule<'a> {
    name: String,
    action: &'a str,
    request: PutRuleRequest,
}

/// Synchronises declared schedules with the provider.
pub struct EventRules {
    ledger: Ledger<RuleKind>,
    functions: Arc<dyn FunctionClient>,
    prefix: String,
}

impl std::fmt::Debug for EventRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRules")
            .field("prefix", &self.prefix)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl EventRules {
    /// Manage rules named `{prefix}-{rule_ident}`.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventsClient>,
        functions: Arc<dyn FunctionClient>,
        prefix: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        let prefix = prefix.into();
        Self {
            ledger: Ledger::new(
                RuleKind {
                    events,
                    prefix: format!("{prefix}-"),
                },
                retry,
            ),
            functions,
            prefix,
        }
    }

    /// Provider name of a declared rule.
    #[must_use]
    pub fn rule_name(&self, rule_ident: &str) -> String {
        format!("{}-{rule_ident}", self.prefix)
    }

    /// Bring every declared rule up to date and point it at the function.
    ///
    /// All schedules are validated before anything is changed. Returns the
    /// provider names of the declared rules.
    pub async fn sync(
        &mut self,
        action_key: &str,
        function_arn: &str,
        rules: &BTreeMap<String, ScheduleSpec>,
    ) -> DeployResult<Vec<String>> {
        let planned = rules
            .iter()
            .map(|(ident, schedule)| {
                let name = self.rule_name(ident);
                Ok(PlannedRule {
                    request: PutRuleRequest {
                        name: name.clone(),
                        schedule_expression: schedule.expression(ident)?,
                        state: schedule.provider_state(ident)?,
                    },
                    name,
                    action: &schedule.action,
                })
            })
            .collect::<DeployResult<Vec<_>>>()?;

        let events = self.ledger.kind().events.clone();
        for rule in &planned {
            let name = &rule.name;
            let existing = self.ledger.get(name).await?;
            let rule_arn = match existing {
                Some(record)
                    if record.schedule_expression.as_deref()
                        == Some(rule.request.schedule_expression.as_str())
                        && record.state.as_deref() == Some(rule.request.state.as_str()) =>
                {
                    info!(rule = %name, "Event rule existed: {name}");
                    record.arn
                }
                Some(_) => self.update(name, &rule.request).await?,
                None => match self.ledger.ensure(name, &rule.request).await? {
                    Ensured::Created(record) => {
                        info!(rule = %name, "Event rule created: {name}");
                        record.arn
                    }
                    // created concurrently; our schedule still has to win
                    Ensured::Existed(_) => self.update(name, &rule.request).await?,
                },
            };

            let target = RuleTarget {
                id: TARGET_ID.to_owned(),
                arn: function_arn.to_owned(),
                input: json!({ action_key: rule.action }).to_string(),
            };
            events.put_targets(name, &[target]).await?;
            self.grant_invoke(function_arn, name, &rule_arn).await?;
        }

        let declared: Vec<String> = planned.into_iter().map(|r| r.name).collect();
        for orphan in self
            .ledger
            .list()
            .await?
            .keys()
            .filter(|name| !declared.contains(name))
        {
            warn!(rule = %orphan, "Event rule not declared, leaving in place: {orphan}");
        }

        Ok(declared)
    }

    async fn update(&mut self, name: &str, request: &PutRuleRequest) -> DeployResult<String> {
        let arn = self.ledger.kind().events.put_rule(request).await?;
        self.ledger.invalidate();
        info!(rule = %name, "Event rule updated: {name}");
        Ok(arn)
    }

    async fn grant_invoke(&self, function_arn: &str, rule: &str, rule_arn: &str) -> DeployResult<()> {
        let grant = PermissionRequest {
            function: function_arn.to_owned(),
            statement_id: rule.to_owned(),
            action: "lambda:InvokeFunction".to_owned(),
            principal: "events.amazonaws.com".to_owned(),
            source_arn: Some(rule_arn.to_owned()),
            function_url_auth_type: None,
        };
        match self.functions.add_permission(&grant).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind == RemoteErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the targets of and delete the named rules.
    pub async fn delete(&mut self, rule_idents: &[String]) -> DeployResult<()> {
        for ident in rule_idents {
            let name = self.rule_name(ident);
            if !self.ledger.delete(&name, &()).await? {
                info!(rule = %name, "Event rule not found: {name}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::test_fixtures::{capture_logs, cloud, fast_retry};
    use crate::transport::{MemoryCloud, PackageType};

    const FUNCTION: &str = "app-lambda-func-qa";

    fn function_arn(cloud: &Arc<MemoryCloud>) -> String {
        cloud.seed_function(FUNCTION, PackageType::Image, Some("repo:tag"));
        format!("arn:aws:lambda:eu-west-1:123456789012:function:{FUNCTION}")
    }

    fn rules(cloud: &Arc<MemoryCloud>) -> EventRules {
        EventRules::new(cloud.clone(), cloud.clone(), FUNCTION, fast_retry())
    }

    #[rstest]
    #[tokio::test]
    async fn declared_rules_are_created_with_target_and_grant(cloud: Arc<MemoryCloud>) {
        let logs = capture_logs();
        let arn = function_arn(&cloud);
        let declared = BTreeMap::from([
            ("nightly".to_owned(), ScheduleSpec::cron("0 3 * * ? *", "cleanup")),
            ("poll".to_owned(), ScheduleSpec::rate("5 minutes", "poll")),
        ]);

        let names = rules(&cloud).sync("do-action", &arn, &declared).await.unwrap();

        assert_eq!(
            names,
            vec![format!("{FUNCTION}-nightly"), format!("{FUNCTION}-poll")]
        );
        assert_eq!(
            cloud.rule_schedule(&format!("{FUNCTION}-nightly")),
            Some(("cron(0 3 * * ? *)".to_owned(), "ENABLED".to_owned()))
        );
        let targets = cloud.rule_targets(&format!("{FUNCTION}-poll"));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, TARGET_ID);
        assert_eq!(targets[0].input, r#"{"do-action":"poll"}"#);
        assert!(cloud
            .function_permissions(FUNCTION)
            .contains(&format!("{FUNCTION}-poll")));
        assert!(logs.contains(&format!("Event rule created: {FUNCTION}-nightly")));
        assert!(logs.contains("Rule ensure: record created"));
        assert_eq!(cloud.calls("put_rule"), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn resync_updates_only_changed_rules(cloud: Arc<MemoryCloud>) {
        let logs = capture_logs();
        let arn = function_arn(&cloud);
        let mut rules = rules(&cloud);
        let mut declared =
            BTreeMap::from([("poll".to_owned(), ScheduleSpec::rate("5 minutes", "poll"))]);
        rules.sync("do-action", &arn, &declared).await.unwrap();

        rules.sync("do-action", &arn, &declared).await.unwrap();
        assert_eq!(cloud.calls("put_rule"), 1);
        assert!(logs.contains(&format!("Event rule existed: {FUNCTION}-poll")));

        declared.insert("poll".to_owned(), ScheduleSpec::rate("10 minutes", "poll"));
        rules.sync("do-action", &arn, &declared).await.unwrap();
        assert_eq!(cloud.calls("put_rule"), 2);
        assert!(logs.contains(&format!("Event rule updated: {FUNCTION}-poll")));
    }

    #[rstest]
    #[case::both(ScheduleSpec { rate: Some("1 hour".to_owned()), ..ScheduleSpec::cron("0 * * * ? *", "a") })]
    #[case::neither(ScheduleSpec { action: "a".to_owned(), ..ScheduleSpec::default() })]
    #[case::bad_state(ScheduleSpec { state: "paused".to_owned(), ..ScheduleSpec::rate("1 hour", "a") })]
    #[tokio::test]
    async fn invalid_schedule_fails_before_any_put(#[case] invalid: ScheduleSpec) {
        let cloud = Arc::new(MemoryCloud::new());
        let arn = function_arn(&cloud);
        let declared = BTreeMap::from([
            ("a-valid".to_owned(), ScheduleSpec::rate("1 hour", "ok")),
            ("b-invalid".to_owned(), invalid),
        ]);

        let err = rules(&cloud).sync("do-action", &arn, &declared).await.unwrap_err();

        assert!(matches!(err, DeployError::Configuration(_)));
        assert_eq!(cloud.calls("put_rule"), 0);
        assert_eq!(cloud.calls("put_targets"), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn undeclared_rules_are_reported_not_pruned(cloud: Arc<MemoryCloud>) {
        let logs = capture_logs();
        let arn = function_arn(&cloud);
        let mut rules = rules(&cloud);
        let both = BTreeMap::from([
            ("keep".to_owned(), ScheduleSpec::rate("1 hour", "keep")),
            ("old".to_owned(), ScheduleSpec::rate("1 day", "old")),
        ]);
        rules.sync("do-action", &arn, &both).await.unwrap();

        let only_keep =
            BTreeMap::from([("keep".to_owned(), ScheduleSpec::rate("1 hour", "keep"))]);
        rules.sync("do-action", &arn, &only_keep).await.unwrap();

        assert_eq!(
            cloud.rule_names(),
            vec![format!("{FUNCTION}-keep"), format!("{FUNCTION}-old")]
        );
        assert_eq!(cloud.calls("delete_rule"), 0);
        assert!(logs.contains(&format!(
            "Event rule not declared, leaving in place: {FUNCTION}-old"
        )));
    }

    #[rstest]
    #[tokio::test]
    async fn delete_removes_targets_then_rules(cloud: Arc<MemoryCloud>) {
        let logs = capture_logs();
        let arn = function_arn(&cloud);
        let mut rules = rules(&cloud);
        let declared = BTreeMap::from([("poll".to_owned(), ScheduleSpec::rate("1 hour", "p"))]);
        rules.sync("do-action", &arn, &declared).await.unwrap();

        rules
            .delete(&["poll".to_owned(), "gone".to_owned()])
            .await
            .unwrap();

        assert!(cloud.rule_names().is_empty());
        assert!(logs.contains(&format!("Event target deleted: {FUNCTION}-poll")));
        assert!(logs.contains(&format!("Event rule not found: {FUNCTION}-gone")));
    }
}
