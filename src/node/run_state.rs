//! Ephemeral per-request node state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::node::result::NodeResult;
use crate::node::Node;

/// Accumulates resolved variable-param values for one node in one run.
///
/// A run is built exclusively by whoever creates it; once parked in the
/// scheduler's wait-set all further mutation happens under the map guard, so
/// the remaining-count needs no lock of its own. When the count reaches zero
/// the state is dispatched exactly once and never touched again.
pub struct NodeRun {
    node: Arc<Node>,
    params: HashMap<String, Value>,
    remaining: usize,
    pruned: bool,
}

impl NodeRun {
    pub fn new(node: Arc<Node>) -> Self {
        let declared: HashSet<&str> = node
            .variable_params()
            .iter()
            .filter_map(|p| p.field_name())
            .collect();
        NodeRun {
            remaining: declared.len(),
            node,
            params: HashMap::new(),
            pruned: false,
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn node_id(&self) -> &str {
        self.node.id()
    }

    /// Bind a value to a param slot. Only the first binding of a declared
    /// variable param counts toward readiness; later writes overwrite the
    /// value (last writer wins) without touching the count.
    pub fn add_param(&mut self, field_name: &str, value: Value) {
        let declared = self
            .node
            .variable_params()
            .iter()
            .any(|p| p.field_name() == Some(field_name));
        let first = self.params.insert(field_name.to_string(), value).is_none();
        if declared && first && self.remaining > 0 {
            self.remaining -= 1;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.remaining == 0
    }

    /// Fold another node's results into this state, binding every declared
    /// param the results can satisfy.
    pub fn merge(&mut self, results: &NodeResult) {
        let fields: Vec<String> = self
            .node
            .variable_params()
            .iter()
            .filter_map(|p| p.field_name())
            .map(str::to_string)
            .collect();
        for field in fields {
            if let Some(field_result) = results.get(&field) {
                self.add_param(&field, field_result.value.clone());
            }
        }
    }

    pub fn set_pruned(&mut self) {
        self.pruned = true;
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned
    }

    /// Execute the node with the accumulated params.
    pub async fn run(self) -> NodeResult {
        if !self.is_ready() {
            return self.node.value_on_error("params not ready");
        }
        self.node.run(self.params).await
    }

    /// Execute bounded by the run deadline as well as the node timeout.
    pub(crate) async fn run_until(self, deadline: tokio::time::Instant) -> NodeResult {
        if !self.is_ready() {
            return self.node.value_on_error("params not ready");
        }
        self.node.run_until(self.params, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::result::FieldResult;
    use crate::node::tests::test_node;
    use serde_json::json;

    #[test]
    fn test_ready_counts_unique_declared_params() {
        let node = Arc::new(test_node("f", &["a", "b"], &["out"]));
        let mut run = NodeRun::new(node);
        assert!(!run.is_ready());
        run.add_param("a", json!(1));
        // Duplicate and undeclared bindings do not move the count.
        run.add_param("a", json!(2));
        run.add_param("unrelated", json!(0));
        assert!(!run.is_ready());
        run.add_param("b", json!(3));
        assert!(run.is_ready());
        assert_eq!(run.params.get("a"), Some(&json!(2)));
    }

    #[test]
    fn test_merge_binds_matching_fields() {
        let node = Arc::new(test_node("f", &["a", "b"], &["out"]));
        let mut run = NodeRun::new(node);
        let mut results = NodeResult::new();
        results.insert("a".into(), FieldResult::ok(json!("x")));
        results.insert("other".into(), FieldResult::ok(json!("y")));
        run.merge(&results);
        assert!(!run.is_ready());
        assert_eq!(run.params.get("a"), Some(&json!("x")));
        assert!(!run.params.contains_key("other"));
    }

    #[tokio::test]
    async fn test_run_without_params_fails() {
        let node = Arc::new(test_node("f", &["a"], &["out"]));
        let result = NodeRun::new(node).run().await;
        assert_eq!(
            result.get("out").unwrap().fail_reason(),
            Some("params not ready")
        );
    }
}
