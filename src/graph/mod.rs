//! The executable graph: build-once topology, precomputed indices, the run
//! entry point, and the synchronous point-query path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{self, Middleware, RunHandle, RunHandler, RunParams, Snapshot};
use crate::error::BuildError;
use crate::node::{Field, FieldResult, Node, NodeResult, Stage};
use crate::value::{convert, ConvertError};

mod builder;

pub use builder::{Orphan, OrphanReason};

pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(150);

/// Graph-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub id: String,
    /// How many nodes may execute at once: 0 serializes, negative values
    /// remove the bound.
    #[serde(default = "default_node_concurrency")]
    pub node_concurrency: i32,
    /// Whole-run deadline. Generous enough to cover deferred-stage delays.
    #[serde(default = "default_run_timeout")]
    pub run_timeout: Duration,
}

fn default_node_concurrency() -> i32 {
    1
}

fn default_run_timeout() -> Duration {
    DEFAULT_RUN_TIMEOUT
}

impl Default for GraphConfig {
    fn default() -> Self {
        GraphConfig {
            id: String::new(),
            node_concurrency: default_node_concurrency(),
            run_timeout: default_run_timeout(),
        }
    }
}

impl GraphConfig {
    pub fn new(id: impl Into<String>) -> Self {
        GraphConfig {
            id: id.into(),
            ..GraphConfig::default()
        }
    }

    pub fn with_node_concurrency(mut self, node_concurrency: i32) -> Self {
        self.node_concurrency = node_concurrency;
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }
}

/// Collects a root description and node descriptions, then assembles the
/// executable graph.
#[derive(Default)]
pub struct GraphBuilder {
    root: Option<Node>,
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        GraphBuilder::default()
    }

    /// The root owns the externally supplied inputs; every run starts there.
    pub fn root(mut self, node: Node) -> Self {
        self.root = Some(node);
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn build(self, config: GraphConfig) -> Result<Arc<Graph>, BuildError> {
        if config.id.is_empty() {
            return Err(BuildError::MissingGraphId);
        }
        let root = self.root.ok_or(BuildError::MissingRoot)?;
        let built = builder::build(root, self.nodes);

        // Precompute what every run needs: executable node count, per-stage
        // counts, field lookup tables. Only nodes reachable from the root
        // ever execute.
        let mut reachable = builder::descendants(&built.graph, built.root);
        reachable.push(built.root);
        let node_count = reachable.len();
        let mut stage_counts: HashMap<Stage, usize> = HashMap::new();
        let mut field_nodes = HashMap::new();
        let mut field_map = HashMap::new();
        for &idx in &reachable {
            let node = &built.graph[idx];
            *stage_counts.entry(node.stage()).or_insert(0) += 1;
            for field in node.fields() {
                field_nodes.insert(field.code.clone(), idx);
                field_map.insert(field.code.clone(), field.clone());
            }
        }

        Ok(Arc::new(Graph {
            id: config.id,
            graph: built.graph,
            root: built.root,
            index_map: built.index_map,
            orphans: built.orphans,
            node_count,
            stage_counts,
            field_nodes,
            field_map,
            node_concurrency: config.node_concurrency,
            run_timeout: config.run_timeout,
            middlewares: RwLock::new(Vec::new()),
        }))
    }
}

/// A validated, executable graph. Topology is read-only after construction;
/// only run-scoped state is ever mutated.
pub struct Graph {
    id: String,
    graph: StableDiGraph<Arc<Node>, ()>,
    root: NodeIndex,
    index_map: HashMap<String, NodeIndex>,
    orphans: Vec<Orphan>,
    node_count: usize,
    stage_counts: HashMap<Stage, usize>,
    field_nodes: HashMap<String, NodeIndex>,
    field_map: HashMap<String, Field>,
    node_concurrency: i32,
    run_timeout: Duration,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("node_count", &self.node_count)
            .field("stage_counts", &self.stage_counts)
            .field("orphans", &self.orphans)
            .field("node_concurrency", &self.node_concurrency)
            .field("run_timeout", &self.run_timeout)
            .finish_non_exhaustive()
    }
}

impl Graph {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.graph[self.root]
    }

    /// Diagnostics for nodes excluded at build time.
    pub fn orphans(&self) -> &[Orphan] {
        &self.orphans
    }

    pub(crate) fn node_count(&self) -> usize {
        self.node_count
    }

    pub(crate) fn stage_counts(&self) -> &HashMap<Stage, usize> {
        &self.stage_counts
    }

    pub(crate) fn node_concurrency(&self) -> i32 {
        self.node_concurrency
    }

    pub(crate) fn run_timeout(&self) -> Duration {
        self.run_timeout
    }

    pub(crate) fn node(&self, idx: NodeIndex) -> &Arc<Node> {
        &self.graph[idx]
    }

    pub(crate) fn index_of(&self, node_id: &str) -> Option<NodeIndex> {
        self.index_map.get(node_id).copied()
    }

    pub(crate) fn children(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect()
    }

    pub(crate) fn descendants(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        builder::descendants(&self.graph, idx)
    }

    pub fn field(&self, code: &str) -> Option<&Field> {
        self.field_map.get(code)
    }

    pub fn node_by_field(&self, code: &str) -> Option<&Arc<Node>> {
        self.field_nodes.get(code).map(|&idx| &self.graph[idx])
    }

    /// Coerce a value into the declared type of the named field.
    pub fn convert_field(&self, code: &str, value: &Value) -> Result<Value, ConvertError> {
        let field = self
            .field_map
            .get(code)
            .ok_or_else(|| ConvertError::UnknownField(code.to_string()))?;
        convert(value, field.field_type)
    }

    /// Every field code the named field transitively depends on. The root is
    /// never entered: its params are external inputs.
    pub fn field_dependencies(&self, code: &str) -> Result<HashSet<String>, BuildError> {
        let &idx = self
            .field_nodes
            .get(code)
            .ok_or_else(|| BuildError::FieldNotFound(code.to_string()))?;
        let mut deps = HashSet::new();
        self.collect_dependencies(idx, &mut deps);
        Ok(deps)
    }

    fn collect_dependencies(&self, idx: NodeIndex, deps: &mut HashSet<String>) {
        if idx == self.root {
            return;
        }
        for param in self.graph[idx].variable_params() {
            if let Some(field) = param.field_name() {
                deps.insert(field.to_string());
            }
        }
        for parent in self.graph.neighbors_directed(idx, Direction::Incoming) {
            self.collect_dependencies(parent, deps);
        }
    }

    /// Register a run-level middleware; the chain is rebuilt in registration
    /// order on every run.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middlewares.write().push(middleware);
    }

    /// Start one run: seed the root with the external params and drive the
    /// graph in the background. Returns immediately.
    pub fn run(self: &Arc<Self>, run_id: impl Into<String>, params: RunParams) -> RunHandle {
        let base: RunHandler = {
            let graph = Arc::clone(self);
            Arc::new(move |run_id, params| engine::spawn_run(Arc::clone(&graph), run_id, params))
        };
        let middlewares = self.middlewares.read().clone();
        let chain = middlewares
            .iter()
            .rev()
            .fold(base, |next, middleware| middleware.wrap(next));
        chain(run_id.into(), params)
    }

    /// Run and block until every field settled, returning the snapshot.
    pub async fn supply(self: &Arc<Self>, run_id: impl Into<String>, params: RunParams) -> Snapshot {
        let handle = self.run(run_id, params);
        handle.wait().await;
        handle.snapshot()
    }

    /// Ad-hoc single-field computation: resolve only the ancestor chain the
    /// field needs, synchronously and without touching the scheduler.
    pub async fn resolve_field(&self, data: &HashMap<String, Value>, code: &str) -> FieldResult {
        let Some(&idx) = self.field_nodes.get(code) else {
            return FieldResult::failed(format!("no node produces field [{code}]"), Value::Null);
        };
        let result = self.run_node_chain(idx, data).await;
        result
            .get(code)
            .cloned()
            .unwrap_or_else(|| FieldResult::failed("field not produced", Value::Null))
    }

    /// Recursively execute the producing node for every param missing from
    /// `data`. Recursing into the root is refused: an external input name
    /// colliding with an internal field code must not loop forever.
    fn run_node_chain<'a>(
        &'a self,
        idx: NodeIndex,
        data: &'a HashMap<String, Value>,
    ) -> BoxFuture<'a, NodeResult> {
        Box::pin(async move {
            let node = Arc::clone(&self.graph[idx]);
            let mut run = node.create_run();
            for param in node.variable_params() {
                let Some(field) = param.field_name() else {
                    continue;
                };
                let value = match data.get(field) {
                    Some(value) => value.clone(),
                    None => {
                        let Some(&owner) = self.field_nodes.get(field) else {
                            return node.value_on_error(format!(
                                "get param [{field}] error [no node produces field]"
                            ));
                        };
                        if owner == self.root {
                            return node.value_on_error("can not run root node");
                        }
                        let upstream = self.run_node_chain(owner, data).await;
                        match upstream.get(field) {
                            Some(result) if result.is_supplied() => result.value.clone(),
                            Some(result) => {
                                return node.value_on_error(format!(
                                    "field [{field}] supply error [{}]",
                                    result.fail_reason().unwrap_or_default()
                                ))
                            }
                            None => {
                                return node.value_on_error(format!(
                                    "field [{field}] supply error [not produced]"
                                ))
                            }
                        }
                    }
                };
                run.add_param(field, value);
            }
            if !run.is_ready() {
                return node.value_on_error("params lost");
            }
            run.run().await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{register_identity, test_node};
    use crate::node::{NodeSpec, Param, VarParamSpec};
    use crate::supplier::{DefaultSupplier, FnPlugin, Supplier, SupplyError, SupplyResponse};
    use crate::value::ValueType;
    use serde_json::json;

    fn diamond() -> Arc<Graph> {
        GraphBuilder::new()
            .root(test_node("root", &["x"], &["a"]))
            .node(test_node("n1", &["a"], &["b"]))
            .node(test_node("n2", &["a"], &["c"]))
            .node(test_node("n3", &["b", "c"], &["d"]))
            .build(GraphConfig::new("test").with_node_concurrency(8))
            .unwrap()
    }

    #[test]
    fn test_build_requires_id_and_root() {
        let err = GraphBuilder::new()
            .root(test_node("root", &[], &["a"]))
            .build(GraphConfig::default())
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingGraphId));

        let err = GraphBuilder::new()
            .build(GraphConfig::new("g"))
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingRoot));
    }

    #[test]
    fn test_field_lookup_and_convert() {
        let graph = diamond();
        assert!(graph.field("b").is_some());
        assert!(graph.field("nope").is_none());
        assert_eq!(
            graph.node_by_field("a").unwrap().id(),
            graph.root().id()
        );
        assert_eq!(graph.convert_field("b", &json!(5)).unwrap(), json!("5"));
        assert!(matches!(
            graph.convert_field("nope", &json!(5)),
            Err(ConvertError::UnknownField(_))
        ));
    }

    #[test]
    fn test_field_dependencies() {
        let graph = diamond();
        let deps = graph.field_dependencies("d").unwrap();
        let expected: HashSet<String> =
            ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(deps, expected);
        // Root fields have no internal dependencies.
        assert!(graph.field_dependencies("a").unwrap().is_empty());
        assert!(graph.field_dependencies("zzz").is_err());
    }

    #[tokio::test]
    async fn test_resolve_field_recurses_ancestors() {
        let graph = diamond();
        let mut data = HashMap::new();
        data.insert("a".to_string(), json!("seed"));
        let result = graph.resolve_field(&data, "d").await;
        assert!(result.is_supplied(), "{:?}", result.fail_reason());
        assert_eq!(result.value, json!("seed"));
    }

    #[tokio::test]
    async fn test_resolve_field_refuses_root_recursion() {
        let graph = diamond();
        // `b` needs `a`, which only the root produces; without `a` in the
        // input the chain must refuse instead of looping.
        let result = graph.resolve_field(&HashMap::new(), "b").await;
        assert_eq!(result.fail_reason(), Some("can not run root node"));
    }

    #[tokio::test]
    async fn test_resolve_field_unknown_code() {
        let graph = diamond();
        let result = graph.resolve_field(&HashMap::new(), "zzz").await;
        assert!(!result.is_supplied());
    }

    #[tokio::test]
    async fn test_resolve_field_propagates_upstream_failure() {
        let supplier = Arc::new(DefaultSupplier::new("test", vec![]));
        register_identity(&supplier, "root", &["a"]);
        supplier.register_plugin(Arc::new(FnPlugin::new("broken", |_args| async {
            Err::<SupplyResponse, _>(SupplyError::Failed("boom".into()))
        })));
        register_identity(&supplier, "consumer", &["c"]);

        let build_node = |func: &str, params: &[&str], fields: &[&str]| {
            let params = params
                .iter()
                .map(|p| Param::variable(VarParamSpec::new(*p, *p, ValueType::String)).unwrap())
                .collect();
            let fields = fields
                .iter()
                .map(|f| crate::node::Field::new(*f, ValueType::String))
                .collect();
            Node::new(NodeSpec::new(
                Arc::clone(&supplier) as Arc<dyn crate::supplier::Supplier>,
                func,
                params,
                fields,
            ))
            .unwrap()
        };

        let graph = GraphBuilder::new()
            .root(build_node("root", &["x"], &["a"]))
            .node(build_node("broken", &["a"], &["b"]))
            .node(build_node("consumer", &["b"], &["c"]))
            .build(GraphConfig::new("g"))
            .unwrap();

        let mut data = HashMap::new();
        data.insert("a".to_string(), json!("seed"));
        let result = graph.resolve_field(&data, "c").await;
        let reason = result.fail_reason().unwrap();
        assert!(reason.contains("supply error"), "{reason}");
    }
}
