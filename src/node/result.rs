//! Per-field execution results.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FAIL_VALUE_IS_NIL: &str = "field_value_is_nil";
pub const FAIL_NOT_FOUND_IN_RESPONSE: &str = "field_not_found_in_supply_response";
pub const FAIL_TYPE_CONVERT: &str = "type_convert_error";
pub const FAIL_PRUNE: &str = "prune";
pub const FAIL_TIMEOUT: &str = "timeout";

/// Outcome of supplying one field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldResult {
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
}

impl FieldResult {
    pub fn ok(value: Value) -> Self {
        FieldResult {
            value,
            fail_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>, value: Value) -> Self {
        FieldResult {
            value,
            fail_reason: Some(reason.into()),
        }
    }

    /// A field counts as supplied when it carries no fail reason, or when a
    /// fallback populated a non-null value despite the recorded failure.
    pub fn is_supplied(&self) -> bool {
        self.fail_reason.is_none() || !self.value.is_null()
    }

    pub fn fail_reason(&self) -> Option<&str> {
        self.fail_reason.as_deref()
    }
}

/// Everything one node produced in one run, keyed by field code.
pub type NodeResult = HashMap<String, FieldResult>;
