//! Field declarations.
//!
//! A field is one user-declared output: where to take it from in the supplier
//! response, what type to coerce it to, which stage it belongs to, and how a
//! failure is represented.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BuildError;
use crate::node::result::FieldResult;
use crate::node::Stage;
use crate::value::ValueType;

pub const DEFAULT_FIELD_TIMEOUT: Duration = Duration::from_secs(10);

/// What a field yields when its supply fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldOnError {
    /// Record the failure with a null value.
    #[default]
    Discard,
    /// Record the failure but fall back to the configured default value.
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    /// Unique, system-facing identity. Defaults to `code`.
    #[serde(default)]
    pub id: String,
    /// User-facing field code, unique within a run.
    pub code: String,
    pub field_type: ValueType,
    #[serde(default)]
    pub stage: Stage,
    /// Key into the raw supplier response this field is taken from.
    pub source_key: String,
    #[serde(default)]
    pub on_error: FieldOnError,
    #[serde(default)]
    pub default_value: Value,
    #[serde(default = "default_field_timeout")]
    pub timeout: Duration,
    /// Excluded from the final snapshot.
    #[serde(default)]
    pub not_export: bool,
    /// Delay before the owning node becomes eligible to run.
    #[serde(default)]
    pub delay: Duration,
    /// Coerce a null response value to the type's zero value.
    #[serde(default)]
    pub nil_to_zero: bool,
    /// Free-form user metadata.
    #[serde(default)]
    pub meta: Map<String, Value>,
}

fn default_field_timeout() -> Duration {
    DEFAULT_FIELD_TIMEOUT
}

impl Field {
    /// New field taking `code` from the same key of the supplier response.
    pub fn new(code: impl Into<String>, field_type: ValueType) -> Self {
        let code = code.into();
        Field {
            id: code.clone(),
            code: code.clone(),
            field_type,
            stage: Stage::default(),
            source_key: code,
            on_error: FieldOnError::default(),
            default_value: Value::Null,
            timeout: DEFAULT_FIELD_TIMEOUT,
            not_export: false,
            delay: Duration::ZERO,
            nil_to_zero: false,
            meta: Map::new(),
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_source_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = key.into();
        self
    }

    pub fn with_default(mut self, default_value: Value) -> Self {
        self.on_error = FieldOnError::Default;
        self.default_value = default_value;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn not_exported(mut self) -> Self {
        self.not_export = true;
        self
    }

    pub fn with_nil_to_zero(mut self) -> Self {
        self.nil_to_zero = true;
        self
    }

    pub(crate) fn load_default(&mut self) {
        if self.id.is_empty() {
            self.id = self.code.clone();
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_FIELD_TIMEOUT;
        }
    }

    pub(crate) fn validate(&self) -> Result<(), BuildError> {
        if self.code.is_empty() {
            return Err(BuildError::MissingFieldCode);
        }
        if self.source_key.is_empty() {
            return Err(BuildError::MissingSourceKey(self.code.clone()));
        }
        Ok(())
    }

    /// Synthesize this field's failure result under its error policy.
    pub fn value_on_error(&self, fail_reason: impl Into<String>) -> FieldResult {
        let value = match self.on_error {
            FieldOnError::Default => self.default_value.clone(),
            FieldOnError::Discard => Value::Null,
        };
        FieldResult::failed(fail_reason, value)
    }
}
