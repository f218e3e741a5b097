//! # supplygraph: a concurrent field-supply DAG engine
//!
//! `supplygraph` computes a set of named output *fields* by invoking a graph
//! of memoized function calls (*nodes*). Node inputs are either externally
//! supplied or produced by other nodes; the dependency graph is resolved once
//! and then executed per request, running only the nodes actually needed.
//!
//! - **Graph building**: duplicate function+argument nodes are merged, edges
//!   are inferred from param-to-field matching, orphaned subgraphs are
//!   detected and excised, stages are normalized bottom-up, and default
//!   priorities are derived.
//! - **Concurrent runtime**: priority-tiered ready queues, stage barriers,
//!   concurrency-bounded workers, per-node and whole-run deadlines, and
//!   downstream-readiness detection that dispatches every node exactly once
//!   even when several parents finish in parallel.
//! - **Failure isolation**: one bad upstream value never aborts unrelated
//!   outputs. Failures are recorded as per-field fail reasons; `prune`-policy
//!   params cascade-exclude a consumer and its descendants for the run.
//! - **Suppliers**: the actual function call is a pluggable capability,
//!   dispatched by name through an explicit registry.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use supplygraph::{
//!     Field, FnPlugin, GraphBuilder, GraphConfig, DefaultSupplier, Node, NodeSpec, Param,
//!     Supplier, SupplyResponse, ValueType, VarParamSpec,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let supplier = Arc::new(DefaultSupplier::new("local", vec![]));
//!     supplier.register_plugin(Arc::new(FnPlugin::new("double", |args| async move {
//!         let n = args[0].as_i64().unwrap_or(0);
//!         Ok(SupplyResponse::from([("doubled".to_string(), (n * 2).into())]))
//!     })));
//!
//!     let root = Node::new(NodeSpec::new(
//!         Arc::clone(&supplier) as _,
//!         "double",
//!         vec![Param::variable(VarParamSpec::new("n", "n", ValueType::Int)).unwrap()],
//!         vec![Field::new("doubled", ValueType::Int)],
//!     ))
//!     .unwrap();
//!
//!     let graph = GraphBuilder::new()
//!         .root(root)
//!         .build(GraphConfig::new("example"))
//!         .unwrap();
//!
//!     let snapshot = graph
//!         .supply("req-1", HashMap::from([("n".to_string(), 21.into())]))
//!         .await;
//!     assert_eq!(snapshot.field_value("doubled").unwrap(), &serde_json::Value::from(42));
//! }
//! ```

pub mod engine;
pub mod error;
pub mod graph;
pub mod node;
pub mod supplier;
pub mod value;

pub use crate::engine::{
    LogMiddleware, Middleware, ResultObserver, RunHandle, RunHandler, RunParams, Snapshot,
    SnapshotError, StageWait,
};
pub use crate::error::BuildError;
pub use crate::graph::{Graph, GraphBuilder, GraphConfig, Orphan, OrphanReason};
pub use crate::node::{
    check_not_zero, Field, FieldOnError, FieldResult, Node, NodeHandler, NodeLogLayer,
    NodeMiddleware, NodeResult, NodeRun, NodeSpec, Param, ParamMap, ParamOnError, Stage,
    VarParamSpec, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_MAX, PRIORITY_MID, PRIORITY_MIN,
};
pub use crate::supplier::{
    DefaultSupplier, FnPlugin, Plugin, Supplier, SupplyError, SupplyResponse,
};
pub use crate::value::{convert, zero_value, ConvertError, ValueType};
