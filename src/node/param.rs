//! Node inputs.
//!
//! A param is either a constant baked into the node's identity or a variable
//! reference to a field produced elsewhere in the graph. Variable params are
//! the sole source of graph edges.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BuildError;
use crate::value::ValueType;

/// How a consumer reacts when the field backing a variable param failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParamOnError {
    /// Remove the consumer and its whole descendant set from the run.
    #[default]
    Prune,
    /// Run anyway without this value; the consumer falls back on its own.
    Skip,
}

type ValueCheckFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ValueChecks(Vec<ValueCheckFn>);

impl fmt::Debug for ValueChecks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueChecks({})", self.0.len())
    }
}

#[derive(Debug, Clone)]
pub enum Param {
    Constant {
        id: String,
        value: Value,
        value_type: ValueType,
    },
    Variable {
        id: String,
        /// Field code looked up in the graph to feed this param.
        field_name: String,
        value_type: ValueType,
        on_error: ParamOnError,
        checks: ValueChecks,
    },
}

/// Spec for a variable param: `name` identifies the argument within the
/// function, `field` names the producing field in the graph.
pub struct VarParamSpec {
    pub name: String,
    pub field: String,
    pub value_type: ValueType,
    pub on_error: ParamOnError,
}

impl VarParamSpec {
    pub fn new(name: impl Into<String>, field: impl Into<String>, value_type: ValueType) -> Self {
        VarParamSpec {
            name: name.into(),
            field: field.into(),
            value_type,
            on_error: ParamOnError::default(),
        }
    }

    pub fn with_on_error(mut self, on_error: ParamOnError) -> Self {
        self.on_error = on_error;
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.name.is_empty() {
            return Err(BuildError::MissingParamName);
        }
        if self.field.is_empty() {
            return Err(BuildError::MissingParamField(self.name.clone()));
        }
        Ok(())
    }
}

impl Param {
    pub fn constant(value: Value, value_type: ValueType) -> Param {
        Param::Constant {
            id: format!("const_{value_type}_{value}"),
            value,
            value_type,
        }
    }

    pub fn variable(spec: VarParamSpec) -> Result<Param, BuildError> {
        spec.validate()?;
        Ok(Param::Variable {
            id: format!("var_{}_{}", spec.name, spec.field),
            field_name: spec.field,
            value_type: spec.value_type,
            on_error: spec.on_error,
            checks: ValueChecks::default(),
        })
    }

    pub fn id(&self) -> &str {
        match self {
            Param::Constant { id, .. } | Param::Variable { id, .. } => id,
        }
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, Param::Variable { .. })
    }

    pub fn field_name(&self) -> Option<&str> {
        match self {
            Param::Variable { field_name, .. } => Some(field_name),
            Param::Constant { .. } => None,
        }
    }

    /// Constants never need checks; registering one on a constant is a no-op.
    pub fn add_check(
        &mut self,
        check: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) {
        if let Param::Variable { checks, .. } = self {
            checks.0.push(Arc::new(check));
        }
    }

    pub fn check_value(&self, value: &Value) -> Result<(), String> {
        if let Param::Variable { checks, .. } = self {
            for check in &checks.0 {
                check(value)?;
            }
        }
        Ok(())
    }

    /// Resolve the error policy: whether to prune the consumer, and the
    /// fallback value bound to the slot otherwise.
    pub fn handle_error(&self) -> (bool, Value) {
        match self {
            Param::Variable {
                on_error: ParamOnError::Prune,
                ..
            } => (true, Value::Null),
            _ => (false, Value::Null),
        }
    }

    /// Clone with the id scoped to a function name, so the same param can be
    /// tracked per function within one node.
    pub(crate) fn scoped(&self, func_name: &str) -> Param {
        let mut scoped = self.clone();
        match &mut scoped {
            Param::Constant { id, .. } | Param::Variable { id, .. } => {
                *id = format!("{func_name}_{id}");
            }
        }
        scoped
    }
}

/// Rejects null and type-level zero values.
pub fn check_not_zero(value: &Value) -> Result<(), String> {
    let zero = match value {
        Value::Null => return Err("is nil".into()),
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    };
    if zero {
        return Err("is zero".into());
    }
    Ok(())
}

/// Param lists of every function a node carries (the supplier call plus one
/// entry per registered middleware), with flattened views deduplicated by
/// param id.
#[derive(Debug, Clone, Default)]
pub struct NodeParams {
    by_func: HashMap<String, Vec<Param>>,
    flat: Vec<Param>,
    variables: Vec<Param>,
}

impl NodeParams {
    pub fn add_func_params(&mut self, func_name: &str, params: &[Param]) {
        let scoped: Vec<Param> = params.iter().map(|p| p.scoped(func_name)).collect();
        for param in &scoped {
            if self.flat.iter().any(|seen| seen.id() == param.id()) {
                continue;
            }
            self.flat.push(param.clone());
            if param.is_variable() {
                self.variables.push(param.clone());
            }
        }
        self.by_func.insert(func_name.to_string(), scoped);
    }

    pub fn params(&self) -> &[Param] {
        &self.flat
    }

    pub fn variable_params(&self) -> &[Param] {
        &self.variables
    }

    pub fn func_params(&self, func_name: &str) -> &[Param] {
        self.by_func
            .get(func_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
