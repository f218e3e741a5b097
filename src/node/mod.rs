//! Node model and single-node execution.
//!
//! A node is one memoized function call, identified by its supplier, function
//! name, and ordered param identities. Two declarations with the same identity
//! are merged into one node whose field list is the union. Nodes are built and
//! wired once; after the graph is assembled they are shared read-only across
//! runs.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BuildError;
use crate::supplier::Supplier;
use crate::value::convert;

mod field;
mod middleware;
mod param;
mod result;
mod run_state;

pub use field::{Field, FieldOnError, DEFAULT_FIELD_TIMEOUT};
pub use middleware::{NodeHandler, NodeLogLayer, NodeMiddleware, ParamMap};
pub use param::{check_not_zero, NodeParams, Param, ParamOnError, VarParamSpec};
pub use result::{
    FieldResult, NodeResult, FAIL_NOT_FOUND_IN_RESPONSE, FAIL_PRUNE, FAIL_TIMEOUT,
    FAIL_TYPE_CONVERT, FAIL_VALUE_IS_NIL,
};
pub use run_state::NodeRun;

/// Function name the supplier call is registered under in a node's param map.
pub const SUPPLIER_FUNC: &str = "supplier";

pub const PRIORITY_MAX: i32 = 100;
pub const PRIORITY_HIGH: i32 = 75;
pub const PRIORITY_MID: i32 = 50;
pub const PRIORITY_LOW: i32 = 25;
pub const PRIORITY_MIN: i32 = 1;

/// Coarse execution phases, ordered: the lowest runs soonest. A parent is
/// never left in a later stage than any of its children.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Sync,
    Async,
    Store,
    Lazy,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Sync, Stage::Async, Stage::Store, Stage::Lazy];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Sync => "sync",
            Stage::Async => "async",
            Stage::Store => "store",
            Stage::Lazy => "lazy",
        };
        f.write_str(name)
    }
}

/// Raw description of one node: the function to call and the fields taken
/// from its response.
pub struct NodeSpec {
    pub supplier: Arc<dyn Supplier>,
    pub func_name: String,
    pub params: Vec<Param>,
    pub fields: Vec<Field>,
}

impl NodeSpec {
    pub fn new(
        supplier: Arc<dyn Supplier>,
        func_name: impl Into<String>,
        params: Vec<Param>,
        fields: Vec<Field>,
    ) -> Self {
        NodeSpec {
            supplier,
            func_name: func_name.into(),
            params,
            fields,
        }
    }
}

#[derive(Clone)]
pub struct Node {
    id: String,
    supplier: Arc<dyn Supplier>,
    func_name: String,
    params: NodeParams,
    fields: Vec<Field>,
    field_codes: Vec<String>,
    stage: Stage,
    priority: i32,
    timeout: Duration,
    delay: Duration,
    middlewares: Vec<Arc<dyn NodeMiddleware>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("func_name", &self.func_name)
            .field("params", &self.params)
            .field("fields", &self.fields)
            .field("field_codes", &self.field_codes)
            .field("stage", &self.stage)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl Node {
    pub fn new(spec: NodeSpec) -> Result<Node, BuildError> {
        let NodeSpec {
            supplier,
            func_name,
            params,
            mut fields,
        } = spec;

        for field in &mut fields {
            field.load_default();
            field.validate()?;
        }
        let mut codes = HashSet::new();
        for field in &fields {
            if !codes.insert(field.code.as_str()) {
                return Err(BuildError::DuplicateFieldCode(field.code.clone()));
            }
        }
        let mut param_ids = HashSet::new();
        for param in &params {
            if param.is_variable() && !param_ids.insert(param.id().to_string()) {
                return Err(BuildError::DuplicateParam(param.id().to_string()));
            }
        }

        let id = gen_node_id(supplier.name(), &func_name, &params);
        let mut node_params = NodeParams::default();
        node_params.add_func_params(SUPPLIER_FUNC, &params);

        let mut node = Node {
            id,
            supplier,
            func_name,
            params: node_params,
            fields: Vec::new(),
            field_codes: Vec::new(),
            stage: Stage::Lazy,
            priority: 0,
            timeout: DEFAULT_FIELD_TIMEOUT,
            delay: Duration::ZERO,
            middlewares: Vec::new(),
        };
        node.set_fields(fields);
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn func_name(&self) -> &str {
        &self.func_name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_codes(&self) -> &[String] {
        &self.field_codes
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub(crate) fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }

    /// 0 means unassigned; the builder derives a default from the stage.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority.clamp(PRIORITY_MIN, PRIORITY_MAX);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn params(&self) -> &[Param] {
        self.params.params()
    }

    pub fn variable_params(&self) -> &[Param] {
        self.params.variable_params()
    }

    pub fn func_params(&self, func_name: &str) -> &[Param] {
        self.params.func_params(func_name)
    }

    /// Register a middleware. Its declared params join the node's param map
    /// under the middleware's name; the first registered middleware runs
    /// outermost.
    pub fn use_middleware(&mut self, middleware: Arc<dyn NodeMiddleware>) {
        self.params
            .add_func_params(middleware.name(), &middleware.params());
        self.middlewares.push(middleware);
    }

    pub fn create_run(self: &Arc<Self>) -> NodeRun {
        NodeRun::new(Arc::clone(self))
    }

    /// Union incoming fields into this node, deduplicated by field id with
    /// incoming fields taking precedence. Derived stage/timeout/delay are
    /// recomputed.
    pub(crate) fn add_fields(&mut self, incoming: Vec<Field>) {
        let mut merged = incoming;
        merged.append(&mut self.fields);
        let mut seen = HashSet::new();
        merged.retain(|field| seen.insert(field.id.clone()));
        self.set_fields(merged);
    }

    fn set_fields(&mut self, fields: Vec<Field>) {
        self.field_codes = fields.iter().map(|f| f.code.clone()).collect();
        self.stage = fields.iter().map(|f| f.stage).min().unwrap_or(Stage::Lazy);
        self.timeout = fields
            .iter()
            .map(|f| f.timeout)
            .max()
            .unwrap_or(DEFAULT_FIELD_TIMEOUT);
        self.delay = fields
            .iter()
            .map(|f| f.delay)
            .max()
            .unwrap_or(Duration::ZERO);
        self.fields = fields;
    }

    /// Execute the node with resolved params, bounded by the node timeout.
    ///
    /// The call chain runs on its own task: on timeout the node yields a
    /// timeout failure while the task keeps running in the background, its
    /// eventual output dropped with the abandoned handle. A panic inside a
    /// plugin surfaces as a join error and becomes a per-field failure.
    pub async fn run(self: &Arc<Self>, params: ParamMap) -> NodeResult {
        self.run_bounded(params, self.timeout).await
    }

    /// Like [`run`](Self::run), additionally bounded by a run-scoped
    /// deadline: whichever of the node timeout and the deadline is nearer
    /// wins.
    pub(crate) async fn run_until(
        self: &Arc<Self>,
        params: ParamMap,
        deadline: tokio::time::Instant,
    ) -> NodeResult {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        self.run_bounded(params, self.timeout.min(remaining)).await
    }

    async fn run_bounded(self: &Arc<Self>, params: ParamMap, timeout: Duration) -> NodeResult {
        let node = Arc::clone(self);
        let task = tokio::spawn(async move { node.invoke_chain(params).await });
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                tracing::error!(node = %self.id, error = %join_error, "node execution panicked");
                self.value_on_error(format!("node_run_err: {join_error}"))
            }
            Err(_) => self.value_on_error(FAIL_TIMEOUT),
        }
    }

    async fn invoke_chain(self: Arc<Self>, params: ParamMap) -> NodeResult {
        let base: NodeHandler = {
            let node = Arc::clone(&self);
            Arc::new(move |params| {
                let node = Arc::clone(&node);
                Box::pin(async move { node.call_supplier(&params).await })
            })
        };
        let chain = self
            .middlewares
            .iter()
            .rev()
            .fold(base, |next, mw| mw.wrap(next));
        chain(params).await
    }

    async fn call_supplier(&self, params: &ParamMap) -> NodeResult {
        let param_cfg = self.params.func_params(SUPPLIER_FUNC);
        let mut args = Vec::with_capacity(param_cfg.len());
        for param in param_cfg {
            match param {
                Param::Constant { value, .. } => args.push(value.clone()),
                Param::Variable { field_name, .. } => {
                    let value = params.get(field_name).cloned().unwrap_or(Value::Null);
                    if let Err(reason) = param.check_value(&value) {
                        return self
                            .value_on_error(format!("param_value_check_error: {reason}"));
                    }
                    args.push(value);
                }
            }
        }

        let response = match self.supplier.supply(&self.func_name, args).await {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(node = %self.id, func = %self.func_name, %error, "supplier error");
                return self.value_on_error(format!("supplier_error: {error}"));
            }
        };

        let mut result = NodeResult::with_capacity(self.fields.len());
        for field in &self.fields {
            let Some(raw) = response.get(&field.source_key) else {
                tracing::warn!(field = %field.code, func = %self.func_name, "field not found in supplier response");
                result.insert(
                    field.code.clone(),
                    field.value_on_error(FAIL_NOT_FOUND_IN_RESPONSE),
                );
                continue;
            };
            if raw.is_null() && !field.nil_to_zero {
                tracing::warn!(field = %field.code, "field value is nil");
                result.insert(field.code.clone(), field.value_on_error(FAIL_VALUE_IS_NIL));
                continue;
            }
            match convert(raw, field.field_type) {
                Ok(value) => {
                    result.insert(field.code.clone(), FieldResult::ok(value));
                }
                Err(error) => {
                    tracing::warn!(field = %field.code, %error, "field type convert error");
                    result.insert(field.code.clone(), field.value_on_error(FAIL_TYPE_CONVERT));
                }
            }
        }
        result
    }

    /// Synthesize a failure result for every field under its own policy.
    pub fn value_on_error(&self, fail_reason: impl Into<String>) -> NodeResult {
        let fail_reason = fail_reason.into();
        self.fields
            .iter()
            .map(|field| (field.code.clone(), field.value_on_error(fail_reason.clone())))
            .collect()
    }

    pub fn value_on_prune(&self) -> NodeResult {
        self.value_on_error(FAIL_PRUNE)
    }
}

fn gen_node_id(supplier_name: &str, func_name: &str, params: &[Param]) -> String {
    let mut parts = Vec::with_capacity(params.len() + 2);
    parts.push(supplier_name);
    parts.push(func_name);
    parts.extend(params.iter().map(Param::id));
    parts.join("_")
}
