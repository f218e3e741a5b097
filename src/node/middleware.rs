//! Node-level middleware.
//!
//! Middlewares wrap the supplier invocation of a single node. They are applied
//! in registration order (first registered runs outermost) on every
//! execution, and may declare params of their own, which are merged into the
//! node's param map under the middleware's name.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::node::param::Param;
use crate::node::result::NodeResult;

/// Resolved params a node execution receives, keyed by field name.
pub type ParamMap = HashMap<String, Value>;

pub type NodeHandler = Arc<dyn Fn(ParamMap) -> BoxFuture<'static, NodeResult> + Send + Sync>;

pub trait NodeMiddleware: Send + Sync {
    fn name(&self) -> &str;

    /// Extra params this middleware needs the graph to resolve.
    fn params(&self) -> Vec<Param> {
        Vec::new()
    }

    fn wrap(&self, next: NodeHandler) -> NodeHandler;
}

/// Logs params and results around the supplier call.
pub struct NodeLogLayer {
    node_name: String,
}

impl NodeLogLayer {
    pub fn new(node_name: impl Into<String>) -> Self {
        NodeLogLayer {
            node_name: node_name.into(),
        }
    }
}

impl NodeMiddleware for NodeLogLayer {
    fn name(&self) -> &str {
        "logger"
    }

    fn wrap(&self, next: NodeHandler) -> NodeHandler {
        let name = self.node_name.clone();
        Arc::new(move |params| {
            let name = name.clone();
            let next = Arc::clone(&next);
            Box::pin(async move {
                tracing::info!(node = %name, params = ?params, "node start");
                let result = next(params).await;
                tracing::info!(node = %name, result = ?result, "node end");
                result
            })
        })
    }
}
