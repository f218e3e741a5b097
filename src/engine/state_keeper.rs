//! Per-run node state: ready queues, wait-set, prune-set.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use petgraph::stable_graph::NodeIndex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::graph::Graph;
use crate::node::{NodeResult, NodeRun, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_MID};

const DEFAULT_QUEUE_CAPACITY: usize = 500;
const TIER_COUNT: usize = 4;

/// Tracks node-run state for one run and decides dispatch order.
///
/// Ready runs sit in four priority-tier queues, FIFO within a tier. Partially
/// satisfied runs wait in a concurrent map keyed by node id; the
/// insert-or-merge protocol there guarantees a child is dispatched exactly
/// once even when several of its parents finish at the same instant.
pub(crate) struct NodeStateKeeper {
    ready_tx: [mpsc::Sender<NodeRun>; TIER_COUNT],
    ready_rx: tokio::sync::Mutex<[mpsc::Receiver<NodeRun>; TIER_COUNT]>,
    wait: DashMap<String, NodeRun>,
    pruned: DashMap<String, ()>,
    closed: CancellationToken,
}

fn tier_for(priority: i32) -> usize {
    if priority >= PRIORITY_HIGH {
        0
    } else if priority >= PRIORITY_MID {
        1
    } else if priority >= PRIORITY_LOW {
        2
    } else {
        3
    }
}

impl NodeStateKeeper {
    pub fn new(size: usize) -> Self {
        let capacity = if size == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            size
        };
        let (high_tx, high_rx) = mpsc::channel(capacity);
        let (mid_tx, mid_rx) = mpsc::channel(capacity);
        let (low_tx, low_rx) = mpsc::channel(capacity);
        let (min_tx, min_rx) = mpsc::channel(capacity);
        NodeStateKeeper {
            ready_tx: [high_tx, mid_tx, low_tx, min_tx],
            ready_rx: tokio::sync::Mutex::new([high_rx, mid_rx, low_rx, min_rx]),
            wait: DashMap::new(),
            pruned: DashMap::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Enqueue a ready run into its priority tier. A node that declares a
    /// delay is parked on a timer first; closing the keeper aborts pending
    /// delayed pushes instead of leaking them.
    pub fn push(self: &Arc<Self>, run: NodeRun, priority: i32) {
        let delay = run.node().delay();
        if delay.is_zero() {
            self.push_now(run, priority);
            return;
        }
        let keeper = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => keeper.push_now(run, priority),
                _ = keeper.closed.cancelled() => {
                    tracing::warn!(node = %run.node_id(), "delayed push dropped: run already finished");
                }
            }
        });
    }

    fn push_now(&self, run: NodeRun, priority: i32) {
        if self.closed.is_cancelled() {
            return;
        }
        // Queue capacity equals the graph's node count, and each node is
        // enqueued at most once per run.
        if let Err(err) = self.ready_tx[tier_for(priority)].try_send(run) {
            tracing::error!(error = %err, "ready queue rejected a node run");
        }
    }

    /// Block until any tier has a run, preferring high > mid > low > min
    /// when several tiers are ready at once. Returns None once the deadline
    /// passes or the keeper is closed. Cross-tier ordering under concurrent
    /// arrival in the same poll is approximate, not a strict priority queue.
    pub async fn pop(&self, deadline: Instant) -> Option<NodeRun> {
        let mut receivers = self.ready_rx.lock().await;
        let [high, mid, low, min] = &mut *receivers;
        tokio::select! {
            biased;
            Some(run) = high.recv() => Some(run),
            Some(run) = mid.recv() => Some(run),
            Some(run) = low.recv() => Some(run),
            Some(run) = min.recv() => Some(run),
            _ = self.closed.cancelled() => None,
            _ = tokio::time::sleep_until(deadline) => None,
        }
    }

    /// Downstream-readiness detection, run once after a node finishes.
    pub fn detect(self: &Arc<Self>, graph: &Graph, finished: NodeIndex, result: &NodeResult) {
        for child_idx in graph.children(finished) {
            let child = graph.node(child_idx);
            if self.pruned.contains_key(child.id()) {
                continue;
            }

            let mut candidate = child.create_run();
            let mut cascaded = false;
            for param in child.variable_params() {
                let Some(field) = param.field_name() else {
                    continue;
                };
                let Some(field_result) = result.get(field) else {
                    continue;
                };
                if !field_result.is_supplied() {
                    let (prune, fallback) = param.handle_error();
                    if prune {
                        self.prune_subtree(graph, child_idx);
                        cascaded = true;
                        break;
                    }
                    candidate.add_param(field, fallback);
                    continue;
                }
                candidate.add_param(field, field_result.value.clone());
            }
            if cascaded {
                continue;
            }

            if candidate.is_ready() {
                self.push(candidate, child.priority());
                continue;
            }
            // A child with several parents needs the insert-or-merge dance:
            // whoever stores first leaves the rest of the merge to the next
            // finishing parent; whoever finds an entry merges into it and
            // dispatches if that made it ready.
            match self.wait.entry(child.id().to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(candidate);
                }
                Entry::Occupied(mut slot) => {
                    slot.get_mut().merge(result);
                    if slot.get().is_ready() {
                        let (_, run) = slot.remove_entry();
                        self.push(run, child.priority());
                    }
                }
            }
        }
    }

    /// Mark a node and its whole descendant set pruned. Idempotent: only the
    /// first marker enqueues the terminal pruned execution.
    fn prune_subtree(self: &Arc<Self>, graph: &Graph, start: NodeIndex) {
        let mut indices = graph.descendants(start);
        indices.push(start);
        for idx in indices {
            let node = graph.node(idx);
            if self.pruned.insert(node.id().to_string(), ()).is_some() {
                continue;
            }
            let mut run = node.create_run();
            run.set_pruned();
            self.push(run, node.priority());
            self.wait.remove(node.id());
        }
    }

    /// Close every queue and the internal signal so blocked poppers and
    /// pending delayed pushes release instead of leaking.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::test_node;
    use crate::node::{Field, Node, NodeSpec, PRIORITY_MIN};
    use crate::supplier::DefaultSupplier;
    use crate::value::ValueType;
    use std::time::Duration;

    fn ready_run(node: Node) -> NodeRun {
        Arc::new(node).create_run()
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn test_pop_prefers_higher_tier() {
        let keeper = Arc::new(NodeStateKeeper::new(4));
        keeper.push(ready_run(test_node("low", &[], &["a"])), PRIORITY_MIN);
        keeper.push(ready_run(test_node("high", &[], &["b"])), PRIORITY_HIGH);
        // Both queued; the high tier must come out first.
        tokio::task::yield_now().await;
        let first = keeper.pop(deadline()).await.unwrap();
        assert_eq!(first.node().func_name(), "high");
        let second = keeper.pop(deadline()).await.unwrap();
        assert_eq!(second.node().func_name(), "low");
    }

    #[tokio::test]
    async fn test_pop_returns_none_on_deadline() {
        let keeper = Arc::new(NodeStateKeeper::new(1));
        let run = keeper.pop(Instant::now() + Duration::from_millis(20)).await;
        assert!(run.is_none());
    }

    #[tokio::test]
    async fn test_pop_returns_none_when_closed() {
        let keeper = Arc::new(NodeStateKeeper::new(1));
        let popper = Arc::clone(&keeper);
        let task =
            tokio::spawn(async move { popper.pop(Instant::now() + Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        keeper.close();
        assert!(task.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_push_aborts_on_close() {
        let supplier = Arc::new(DefaultSupplier::new("test", vec![]));
        let node = Node::new(NodeSpec::new(
            supplier,
            "f",
            vec![],
            vec![Field::new("a", ValueType::String).with_delay(Duration::from_millis(50))],
        ))
        .unwrap();
        let keeper = Arc::new(NodeStateKeeper::new(1));
        keeper.push(ready_run(node), PRIORITY_HIGH);
        keeper.close();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let run = keeper.pop(Instant::now() + Duration::from_millis(20)).await;
        assert!(run.is_none());
    }

    #[tokio::test]
    async fn test_delayed_push_arrives_after_delay() {
        let supplier = Arc::new(DefaultSupplier::new("test", vec![]));
        let node = Node::new(NodeSpec::new(
            supplier,
            "f",
            vec![],
            vec![Field::new("a", ValueType::String).with_delay(Duration::from_millis(30))],
        ))
        .unwrap();
        let keeper = Arc::new(NodeStateKeeper::new(1));
        keeper.push(ready_run(node), PRIORITY_HIGH);
        let run = keeper.pop(deadline()).await;
        assert!(run.is_some());
    }

    #[test]
    fn test_tier_thresholds() {
        assert_eq!(tier_for(100), 0);
        assert_eq!(tier_for(75), 0);
        assert_eq!(tier_for(74), 1);
        assert_eq!(tier_for(50), 1);
        assert_eq!(tier_for(25), 2);
        assert_eq!(tier_for(24), 3);
        assert_eq!(tier_for(1), 3);
    }
}
