//! Per-request execution: the run driver and its handle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::result_keeper::{ResultKeeper, Snapshot};
use crate::engine::stage_keeper::{StageKeeper, StageWait};
use crate::engine::state_keeper::NodeStateKeeper;
use crate::graph::Graph;
use crate::node::{Node, NodeResult, NodeRun, Stage};

pub type ResultObserver = Box<dyn Fn(&Arc<Node>, &NodeResult) + Send + Sync>;

type Observers = Arc<RwLock<Vec<ResultObserver>>>;

/// Handle to one in-flight (or finished) run.
///
/// The run itself never returns an error: callers read the snapshot and
/// inspect per-field fail reasons. A snapshot taken after the run deadline
/// may be partial.
#[derive(Clone)]
pub struct RunHandle {
    id: String,
    keeper: Arc<NodeStateKeeper>,
    stages: Arc<StageKeeper>,
    results: Arc<ResultKeeper>,
    done: CancellationToken,
    observers: Observers,
}

impl RunHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Block until the run finishes (all nodes consumed or deadline hit).
    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    pub async fn wait_for_stage(&self, stage: Stage) -> StageWait {
        self.stages.wait_for(stage).await
    }

    /// Flattened copy of everything supplied so far.
    pub fn snapshot(&self) -> Snapshot {
        self.results.read()
    }

    /// Register a callback invoked once per finished node with the node and
    /// its (export-stripped) result.
    pub fn add_result_observer(
        &self,
        observer: impl Fn(&Arc<Node>, &NodeResult) + Send + Sync + 'static,
    ) {
        self.observers.write().push(Box::new(observer));
    }

    /// Release every blocked waiter and abort pending delayed pushes.
    pub fn close(&self) {
        self.keeper.close();
        self.stages.set_all_done();
    }
}

/// Seed the root, start the execution loop in the background, and hand back
/// the run handle immediately.
pub(crate) fn spawn_run(
    graph: Arc<Graph>,
    run_id: String,
    params: HashMap<String, Value>,
) -> RunHandle {
    let keeper = Arc::new(NodeStateKeeper::new(graph.node_count()));
    let stages = Arc::new(StageKeeper::new(graph.stage_counts(), graph.run_timeout()));
    let results = Arc::new(ResultKeeper::new());
    let observers: Observers = Arc::new(RwLock::new(Vec::new()));
    let handle = RunHandle {
        id: run_id.clone(),
        keeper: Arc::clone(&keeper),
        stages: Arc::clone(&stages),
        results: Arc::clone(&results),
        done: stages.all_done_token(),
        observers: Arc::clone(&observers),
    };

    let mut root_run = graph.root().create_run();
    for (field, value) in params {
        root_run.add_param(&field, value);
    }
    keeper.push(root_run, graph.root().priority());

    tokio::spawn(drive(graph, run_id, keeper, stages, results, observers));
    handle
}

/// Signals run completion and closes the keeper on every exit path, so no
/// waiter leaks even if the driver unwinds.
struct FinishGuard {
    stages: Arc<StageKeeper>,
    keeper: Arc<NodeStateKeeper>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.stages.set_all_done();
        self.keeper.close();
    }
}

async fn drive(
    graph: Arc<Graph>,
    run_id: String,
    keeper: Arc<NodeStateKeeper>,
    stages: Arc<StageKeeper>,
    results: Arc<ResultKeeper>,
    observers: Observers,
) {
    let _finish = FinishGuard {
        stages: Arc::clone(&stages),
        keeper: Arc::clone(&keeper),
    };
    let deadline = Instant::now() + graph.run_timeout();
    let limiter = match graph.node_concurrency() {
        n if n < 0 => None,
        0 => Some(Arc::new(Semaphore::new(1))),
        n => Some(Arc::new(Semaphore::new(n as usize))),
    };

    let mut remaining = graph.node_count();
    let mut workers = JoinSet::new();
    while remaining > 0 {
        let Some(run) = keeper.pop(deadline).await else {
            // Deadline backstop: stop pulling work, keep whatever already
            // ran, let in-flight nodes finish.
            tracing::warn!(run = %run_id, unrun = remaining, "run deadline reached before all nodes executed");
            break;
        };
        let permit = match &limiter {
            Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            None => None,
        };
        remaining -= 1;
        workers.spawn(execute_node(
            Arc::clone(&graph),
            Arc::clone(&keeper),
            Arc::clone(&stages),
            Arc::clone(&results),
            Arc::clone(&observers),
            run,
            permit,
            deadline,
        ));
    }

    while workers.join_next().await.is_some() {}
}

#[allow(clippy::too_many_arguments)]
async fn execute_node(
    graph: Arc<Graph>,
    keeper: Arc<NodeStateKeeper>,
    stages: Arc<StageKeeper>,
    results: Arc<ResultKeeper>,
    observers: Observers,
    run: NodeRun,
    permit: Option<OwnedSemaphorePermit>,
    deadline: Instant,
) {
    let _permit = permit;
    let node = Arc::clone(run.node());
    let mut result = if run.is_pruned() {
        // The external function is never invoked for a pruned node, and its
        // descendants were already force-pruned by the cascade.
        node.value_on_prune()
    } else {
        let result = run.run_until(deadline).await;
        if let Some(index) = graph.index_of(node.id()) {
            keeper.detect(&graph, index, &result);
        }
        result
    };

    for field in node.fields() {
        if field.not_export {
            result.remove(&field.code);
        }
    }
    results.write(node.id(), result.clone());
    for observer in observers.read().iter() {
        observer(&node, &result);
    }
    stages.record_finish(node.stage());
}
