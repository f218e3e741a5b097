//! Run-level middleware.
//!
//! Middlewares wrap the handler that launches a run. The effective chain is
//! rebuilt deterministically in registration order on every call: the first
//! registered middleware runs outermost.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::engine::runtime::RunHandle;

/// External params a run is seeded with, keyed by field name.
pub type RunParams = HashMap<String, Value>;

pub type RunHandler = Arc<dyn Fn(String, RunParams) -> RunHandle + Send + Sync>;

pub trait Middleware: Send + Sync {
    fn wrap(&self, next: RunHandler) -> RunHandler;
}

/// Logs the incoming event and, once the run finishes, its result.
pub struct LogMiddleware;

impl Middleware for LogMiddleware {
    fn wrap(&self, next: RunHandler) -> RunHandler {
        Arc::new(move |run_id, params| {
            tracing::info!(run = %run_id, params = ?params, "run received event");
            let handle = next(run_id, params);
            let finished = handle.clone();
            tokio::spawn(async move {
                finished.wait().await;
                tracing::info!(
                    run = %finished.id(),
                    result = ?finished.snapshot().fields,
                    "run supplied result"
                );
            });
            handle
        })
    }
}
