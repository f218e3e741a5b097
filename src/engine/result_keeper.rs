//! Concurrent result aggregation.

use std::collections::HashMap;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::node::{FieldResult, NodeResult};

/// Concurrent map from node id to that node's results. A node writes once
/// per run under correct operation; a late write simply overwrites.
pub(crate) struct ResultKeeper {
    data: DashMap<String, NodeResult>,
}

impl ResultKeeper {
    pub fn new() -> Self {
        ResultKeeper {
            data: DashMap::new(),
        }
    }

    pub fn write(&self, node_id: &str, result: NodeResult) {
        self.data.insert(node_id.to_string(), result);
    }

    /// Flatten everything stored so far into an owned snapshot the caller can
    /// keep independently of the live run.
    pub fn read(&self) -> Snapshot {
        let mut fields = HashMap::new();
        for entry in self.data.iter() {
            for (code, field_result) in entry.value() {
                fields.insert(code.clone(), field_result.clone());
            }
        }
        Snapshot { fields }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("field not found: {0}")]
    NotFound(String),
    #[error("supply error: {0}")]
    Failed(String),
}

/// Flattened, field-code-keyed view of a run's results.
///
/// A run that hit its deadline yields a partial snapshot: fields of nodes
/// that never executed are simply absent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub fields: HashMap<String, FieldResult>,
}

impl Snapshot {
    pub fn get(&self, code: &str) -> Option<&FieldResult> {
        self.fields.get(code)
    }

    pub fn field_value(&self, code: &str) -> Result<&Value, SnapshotError> {
        let field = self
            .fields
            .get(code)
            .ok_or_else(|| SnapshotError::NotFound(code.to_string()))?;
        if !field.is_supplied() {
            return Err(SnapshotError::Failed(
                field.fail_reason().unwrap_or_default().to_string(),
            ));
        }
        Ok(&field.value)
    }

    pub fn fail_reason(&self, code: &str) -> Option<&str> {
        self.fields.get(code).and_then(FieldResult::fail_reason)
    }

    /// Values of every successfully supplied field.
    pub fn field_values(&self) -> HashMap<String, Value> {
        self.fields
            .iter()
            .filter(|(_, field)| field.is_supplied())
            .map(|(code, field)| (code.clone(), field.value.clone()))
            .collect()
    }
}
