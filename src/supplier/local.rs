//! Built-in local plugins.

use async_trait::async_trait;
use serde_json::Value;

use super::{Plugin, SupplyError, SupplyResponse};

pub const FORWARD_PLUGIN: &str = "Forward";
pub const EXTRACT_PLUGIN: &str = "Extract";

/// Maps a list of keys onto the remaining arguments.
///
/// First argument is an array of key names; each following argument is the
/// value for the key at the same position.
pub struct ForwardPlugin;

#[async_trait]
impl Plugin for ForwardPlugin {
    fn name(&self) -> &str {
        FORWARD_PLUGIN
    }

    async fn call(&self, args: Vec<Value>) -> Result<SupplyResponse, SupplyError> {
        if args.len() < 2 {
            return Err(SupplyError::Failed(
                "forward needs at least two args: keys([]string), values...".into(),
            ));
        }
        let keys: Vec<String> = match &args[0] {
            Value::Array(items) => items
                .iter()
                .map(|i| i.as_str().map(str::to_string))
                .collect::<Option<_>>()
                .ok_or_else(|| {
                    SupplyError::Failed("forward first arg must be keys([]string)".into())
                })?,
            _ => {
                return Err(SupplyError::Failed(
                    "forward first arg must be keys([]string)".into(),
                ))
            }
        };
        if keys.len() > args.len() - 1 {
            return Err(SupplyError::Failed("forward has not enough values".into()));
        }
        Ok(keys
            .into_iter()
            .zip(args.into_iter().skip(1))
            .collect())
    }
}

/// Extracts dotted paths from a JSON payload.
///
/// First argument is the payload (an object, or a string holding JSON); the
/// remaining arguments are dotted key paths. Missing paths yield null.
pub struct ExtractPlugin;

#[async_trait]
impl Plugin for ExtractPlugin {
    fn name(&self) -> &str {
        EXTRACT_PLUGIN
    }

    async fn call(&self, args: Vec<Value>) -> Result<SupplyResponse, SupplyError> {
        if args.len() < 2 {
            return Err(SupplyError::Failed(
                "extract needs at least two args: payload, paths...".into(),
            ));
        }
        let payload = match &args[0] {
            Value::String(raw) => serde_json::from_str::<Value>(raw)
                .map_err(|e| SupplyError::Failed(format!("extract payload parse error: {e}")))?,
            other @ Value::Object(_) => other.clone(),
            _ => {
                return Err(SupplyError::Failed(
                    "extract first arg must be a JSON payload".into(),
                ))
            }
        };
        let mut out = SupplyResponse::with_capacity(args.len() - 1);
        for path in &args[1..] {
            let Some(path) = path.as_str() else {
                return Err(SupplyError::Failed("extract paths must be strings".into()));
            };
            out.insert(path.to_string(), lookup(&payload, path));
        }
        Ok(out)
    }
}

fn lookup(payload: &Value, path: &str) -> Value {
    let mut current = payload;
    for part in path.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}
