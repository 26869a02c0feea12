//! Desired function configuration and the deployed record it is compared to.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::Value;

use crate::error::DeployResult;
use crate::ledger::{decode, RemoteRecord};
use crate::transport::{FunctionConfigurationUpdate, LoggingConfig, PackageType, VpcConfig};

/// Desired projection of a function's configuration.
///
/// Only fields that are `Some` are asserted; everything else is left as the
/// provider has it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionSpec {
    /// Function name.
    pub name: String,
    /// Execution role ARN.
    pub role: Option<String>,
    /// Memory in MB.
    pub memory_size: Option<u32>,
    /// Timeout in seconds.
    pub timeout: Option<u32>,
    /// Environment variables.
    pub environment: Option<BTreeMap<String, String>>,
    /// Network placement.
    pub vpc: Option<VpcConfig>,
    /// Log output settings.
    pub logging: Option<LoggingConfig>,
}

impl FunctionSpec {
    /// A spec asserting nothing but the name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Configuration fields sent on create and update.
    #[must_use]
    pub fn to_update(&self) -> FunctionConfigurationUpdate {
        FunctionConfigurationUpdate {
            function_name: self.name.clone(),
            role: self.role.clone(),
            memory_size: self.memory_size,
            timeout: self.timeout,
            environment: self.environment.clone(),
            vpc_config: self.vpc.clone(),
            logging_config: self.logging.clone(),
        }
    }

    /// Names of asserted fields whose deployed value differs.
    #[must_use]
    pub fn drift(&self, actual: &FunctionRecord) -> Vec<&'static str> {
        let mut drifted = Vec::new();

        if self.role.as_ref().is_some_and(|r| *r != actual.role) {
            drifted.push("Role");
        }
        if self.memory_size.is_some() && self.memory_size != actual.memory_size {
            drifted.push("MemorySize");
        }
        if self.timeout.is_some() && self.timeout != actual.timeout {
            drifted.push("Timeout");
        }
        if self
            .environment
            .as_ref()
            .is_some_and(|env| env != actual.variables())
        {
            drifted.push("Environment");
        }
        if let Some(vpc) = &self.vpc {
            let actual_vpc = actual.vpc_config.clone().unwrap_or_default();
            if !same_members(&vpc.subnet_ids, &actual_vpc.subnet_ids)
                || !same_members(&vpc.security_group_ids, &actual_vpc.security_group_ids)
            {
                drifted.push("VpcConfig");
            }
        }
        if self.logging.is_some() && self.logging != actual.logging_config {
            drifted.push("LoggingConfig");
        }

        drifted
    }
}

fn same_members(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnvironmentRecord {
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CodeRecord {
    #[serde(default)]
    image_uri: Option<String>,
}

/// A deployed function's configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionRecord {
    /// Function name.
    pub function_name: String,
    /// Function ARN.
    pub function_arn: String,
    /// Code packaging.
    pub package_type: PackageType,
    /// Execution role ARN.
    #[serde(default)]
    pub role: String,
    /// Memory in MB.
    #[serde(default)]
    pub memory_size: Option<u32>,
    /// Timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u32>,
    #[serde(default)]
    environment: Option<EnvironmentRecord>,
    /// Network placement.
    #[serde(default)]
    pub vpc_config: Option<VpcConfig>,
    /// Log output settings.
    #[serde(default)]
    pub logging_config: Option<LoggingConfig>,
    /// `Successful`, `Failed` or `InProgress`.
    #[serde(default)]
    pub last_update_status: Option<String>,
    /// Why the last update failed.
    #[serde(default)]
    pub last_update_status_reason: Option<String>,
    /// Image the function runs; only present on a single-function fetch.
    #[serde(skip)]
    pub image_uri: Option<String>,
}

impl RemoteRecord for FunctionRecord {
    const KIND: &'static str = "function";

    fn ident(&self) -> String {
        self.function_name.clone()
    }
}

impl FunctionRecord {
    /// Map a `{"Configuration": ..., "Code": ...}` response.
    pub fn from_get_function(value: &Value) -> DeployResult<Self> {
        let configuration = value.get("Configuration").unwrap_or(&Value::Null);
        let mut record: Self = decode(Self::KIND, configuration)?;
        if let Some(code) = value.get("Code") {
            let code: CodeRecord = decode(Self::KIND, code)?;
            record.image_uri = code.image_uri;
        }
        Ok(record)
    }

    /// Deployed environment variables.
    #[must_use]
    pub fn variables(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.environment.as_ref().map_or(&EMPTY, |e| &e.variables)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn deployed() -> FunctionRecord {
        FunctionRecord::from_get_function(&json!({
            "Configuration": {
                "FunctionName": "app-func-qa",
                "FunctionArn": "arn:fn",
                "PackageType": "Image",
                "Role": "arn:role",
                "MemorySize": 2048,
                "Timeout": 900,
                "Environment": { "Variables": { "A": "1" } },
                "VpcConfig": { "SubnetIds": ["s2", "s1"], "SecurityGroupIds": ["g1"] },
                "LastUpdateStatus": "Successful",
            },
            "Code": { "ImageUri": "repo:tag" },
        }))
        .unwrap()
    }

    #[test]
    fn maps_configuration_and_code() {
        let record = deployed();
        assert_eq!(record.package_type, PackageType::Image);
        assert_eq!(record.image_uri.as_deref(), Some("repo:tag"));
        assert_eq!(record.variables().get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn unset_fields_are_not_asserted() {
        let spec = FunctionSpec::new("app-func-qa");
        assert!(spec.drift(&deployed()).is_empty());
    }

    #[test]
    fn drift_lists_differing_fields() {
        let spec = FunctionSpec {
            role: Some("arn:role".to_owned()),
            memory_size: Some(1024),
            environment: Some(BTreeMap::from([("A".to_owned(), "2".to_owned())])),
            vpc: Some(VpcConfig {
                subnet_ids: vec!["s1".to_owned(), "s2".to_owned()],
                security_group_ids: vec!["g1".to_owned()],
            }),
            ..FunctionSpec::new("app-func-qa")
        };
        assert_eq!(spec.drift(&deployed()), vec!["MemorySize", "Environment"]);
    }

    #[test]
    fn missing_package_type_is_a_schema_error() {
        let err = FunctionRecord::from_get_function(&json!({
            "Configuration": { "FunctionName": "f", "FunctionArn": "arn" },
        }))
        .unwrap_err();
        assert!(err.to_string().contains("PackageType"));
    }
}
