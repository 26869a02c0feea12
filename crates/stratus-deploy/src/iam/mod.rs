//! Identity: the execution role and the policies attached to it.

pub mod document;
pub mod policy;
pub mod role;

pub use document::{assume_role_doc, documents_equal, policy_doc, PolicyScope};
pub use policy::{Policies, PolicyRecord};
pub use role::{RoleRecord, Roles};

use serde_json::{json, Value};

/// Managed policy granting network interface access to functions placed in a VPC.
pub const VPC_ACCESS_POLICY_ARN: &str =
    "arn:aws:iam::aws:policy/service-role/AWSLambdaVPCAccessExecutionRole";

/// Principal of the function service.
#[must_use]
pub fn function_principal() -> Value {
    json!({ "Service": "lambda.amazonaws.com" })
}
