//! Access policy documents and structural comparison.

use serde_json::{json, Value};

/// Policy language version stamped on every document.
pub const POLICY_VERSION: &str = "2012-10-17";

/// What a single-statement policy is scoped by.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyScope {
    /// Identity policy granting actions on resources.
    Resource(Value),
    /// Resource policy granting actions to principals.
    Principal(Value),
}

/// Build a single-statement `Allow` policy.
#[must_use]
pub fn policy_doc(actions: &[&str], scope: PolicyScope) -> Value {
    let (key, value) = match scope {
        PolicyScope::Resource(v) => ("Resource", v),
        PolicyScope::Principal(v) => ("Principal", v),
    };
    let mut statement = serde_json::Map::new();
    statement.insert("Action".to_owned(), json!(actions));
    statement.insert(key.to_owned(), value);
    statement.insert("Effect".to_owned(), json!("Allow"));
    json!({
        "Version": POLICY_VERSION,
        "Statement": [Value::Object(statement)],
    })
}

/// Trust policy letting `principal` assume a role.
#[must_use]
pub fn assume_role_doc(principal: &Value) -> Value {
    json!({
        "Version": POLICY_VERSION,
        "Statement": [{
            "Action": "sts:AssumeRole",
            "Principal": principal,
            "Effect": "Allow",
            "Sid": "",
        }],
    })
}

/// Parse a document that may arrive as a JSON string.
#[must_use]
pub fn parse(document: &Value) -> Value {
    match document {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| document.clone()),
        other => other.clone(),
    }
}

/// Normal form used for comparison.
///
/// Arrays become sorted, de-duplicated sets and a single-element array
/// collapses to its element. Object key order is already irrelevant to
/// `Value` equality.
#[must_use]
pub fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), canonical(v)))
                .collect(),
        ),
        Value::Array(items) => {
            let mut items: Vec<Value> = items.iter().map(canonical).collect();
            items.sort_by_cached_key(Value::to_string);
            items.dedup();
            if items.len() == 1 {
                items.pop().unwrap_or(Value::Null)
            } else {
                Value::Array(items)
            }
        }
        other => other.clone(),
    }
}

/// Whether two documents grant the same thing.
#[must_use]
pub fn documents_equal(desired: &Value, actual: &Value) -> bool {
    canonical(&parse(desired)) == canonical(&parse(actual))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrays_compare_as_sets() {
        let a = json!({ "Action": ["s3:Get", "s3:Put"], "Effect": "Allow" });
        let b = json!({ "Effect": "Allow", "Action": ["s3:Put", "s3:Get", "s3:Get"] });
        assert!(documents_equal(&a, &b));
    }

    #[test]
    fn single_element_array_equals_scalar() {
        let a = json!({ "Resource": ["arn:aws:logs:*"] });
        let b = json!({ "Resource": "arn:aws:logs:*" });
        assert!(documents_equal(&a, &b));
    }

    #[test]
    fn string_documents_are_parsed() {
        let doc = assume_role_doc(&json!({ "Service": "lambda.amazonaws.com" }));
        let remote = Value::String(doc.to_string());
        assert!(documents_equal(&doc, &remote));
    }

    #[test]
    fn nested_differences_are_detected() {
        let a = policy_doc(&["sqs:*"], PolicyScope::Resource(json!("arn:a")));
        let b = policy_doc(&["sqs:*"], PolicyScope::Resource(json!("arn:b")));
        assert!(!documents_equal(&a, &b));
    }

    #[test]
    fn policy_doc_uses_requested_scope() {
        let doc = policy_doc(
            &["ecr:BatchGetImage"],
            PolicyScope::Principal(json!({ "AWS": "arn:role" })),
        );
        let statement = &doc["Statement"][0];
        assert_eq!(statement["Principal"]["AWS"], "arn:role");
        assert!(statement.get("Resource").is_none());
        assert_eq!(statement["Effect"], "Allow");
        assert_eq!(doc["Version"], POLICY_VERSION);
    }
}
