//! Static graph construction.
//!
//! Runs once when a graph is assembled: merge duplicate nodes, infer edges
//! from param-to-field matching, excise orphaned subgraphs, normalize stages
//! bottom-up, and derive default priorities. The result is treated as
//! read-only for the life of the process.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::Serialize;

use crate::node::{
    Node, Stage, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_MID, PRIORITY_MIN,
};

/// Why a node was excluded from the executable graph at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    NotEnoughParams,
    AncestorPruned,
}

/// Build-time diagnostic for an excluded node.
#[derive(Debug, Clone, Serialize)]
pub struct Orphan {
    pub node_id: String,
    pub reason: OrphanReason,
    pub missing_params: Vec<String>,
}

pub(crate) struct BuiltGraph {
    pub graph: StableDiGraph<Arc<Node>, ()>,
    pub root: NodeIndex,
    pub index_map: HashMap<String, NodeIndex>,
    pub orphans: Vec<Orphan>,
}

pub(crate) fn build(root: Node, nodes: Vec<Node>) -> BuiltGraph {
    let nodes = merge_nodes(nodes);

    let mut graph: StableDiGraph<Node, ()> = StableDiGraph::new();
    let mut index_map = HashMap::with_capacity(nodes.len() + 1);
    let root_idx = graph.add_node(root);
    index_map.insert(graph[root_idx].id().to_string(), root_idx);
    for node in nodes {
        let id = node.id().to_string();
        let idx = graph.add_node(node);
        index_map.insert(id, idx);
    }

    infer_edges(&mut graph, root_idx);

    let orphans = analyse_orphans(&graph, root_idx);
    for orphan in &orphans {
        if let Some(idx) = index_map.remove(&orphan.node_id) {
            graph.remove_node(idx);
        }
    }

    normalize_stages(&mut graph);
    assign_priorities(&mut graph);

    BuiltGraph {
        graph: graph.map(|_, node| Arc::new(node.clone()), |_, edge| *edge),
        root: root_idx,
        index_map,
        orphans,
    }
}

/// Group raw node descriptions by identity, unioning their field lists.
fn merge_nodes(nodes: Vec<Node>) -> Vec<Node> {
    let mut merged: Vec<Node> = Vec::with_capacity(nodes.len());
    let mut seen: HashMap<String, usize> = HashMap::with_capacity(nodes.len());
    for node in nodes {
        match seen.get(node.id()) {
            Some(&slot) => merged[slot].add_fields(node.fields().to_vec()),
            None => {
                seen.insert(node.id().to_string(), merged.len());
                merged.push(node);
            }
        }
    }
    merged
}

/// Variable params are the sole source of edges: each one is matched against
/// the field codes any node in the graph produces. A node with no variable
/// params is wired directly under the root.
fn infer_edges(graph: &mut StableDiGraph<Node, ()>, root: NodeIndex) {
    let mut field_owner: HashMap<String, NodeIndex> = HashMap::new();
    for idx in graph.node_indices() {
        for code in graph[idx].field_codes() {
            field_owner.insert(code.clone(), idx);
        }
    }

    let mut edges: Vec<(NodeIndex, NodeIndex)> = Vec::new();
    for idx in graph.node_indices() {
        if idx == root {
            continue;
        }
        let node = &graph[idx];
        if node.variable_params().is_empty() {
            tracing::info!(node = %node.id(), "node has zero variable params, wiring under the root");
            edges.push((root, idx));
            continue;
        }
        for param in node.variable_params() {
            let Some(field) = param.field_name() else {
                continue;
            };
            match field_owner.get(field) {
                Some(&owner) => edges.push((owner, idx)),
                // Never resolvable; orphan analysis picks this up.
                None => tracing::warn!(node = %node.id(), param = field, "param not found in graph"),
            }
        }
    }
    for (parent, child) in edges {
        if !graph.contains_edge(parent, child) {
            graph.add_edge(parent, child, ());
        }
    }
}

/// A node is orphaned when a variable param cannot be satisfied by the field
/// outputs of its actual graph parents, or when any ancestor is orphaned.
fn analyse_orphans(graph: &StableDiGraph<Node, ()>, root: NodeIndex) -> Vec<Orphan> {
    let mut orphans: HashMap<NodeIndex, Orphan> = HashMap::new();
    let mut seeds = Vec::new();
    for idx in graph.node_indices() {
        if idx == root {
            continue;
        }
        let node = &graph[idx];
        let satisfied: HashSet<&str> = graph
            .neighbors_directed(idx, Direction::Incoming)
            .flat_map(|parent| graph[parent].field_codes().iter().map(String::as_str))
            .collect();
        let missing: BTreeSet<String> = node
            .variable_params()
            .iter()
            .filter_map(|param| param.field_name())
            .filter(|field| !satisfied.contains(*field))
            .map(str::to_string)
            .collect();
        if missing.is_empty() {
            continue;
        }
        for param in &missing {
            tracing::warn!(node = %node.id(), param = %param, "found orphan node: param not satisfiable");
        }
        orphans.insert(
            idx,
            Orphan {
                node_id: node.id().to_string(),
                reason: OrphanReason::NotEnoughParams,
                missing_params: missing.into_iter().collect(),
            },
        );
        seeds.push(idx);
    }

    for seed in seeds {
        for idx in descendants(graph, seed) {
            orphans.entry(idx).or_insert_with(|| Orphan {
                node_id: graph[idx].id().to_string(),
                reason: OrphanReason::AncestorPruned,
                missing_params: Vec::new(),
            });
        }
    }

    let mut orphans: Vec<Orphan> = orphans.into_values().collect();
    orphans.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    orphans
}

/// Walk upward from the leaves: a parent scheduled to run later than one of
/// its children is forced down to that child's stage, so nothing ever runs
/// after something that depends on it. Idempotent.
fn normalize_stages(graph: &mut StableDiGraph<Node, ()>) {
    let mut queue: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|&idx| {
            graph
                .neighbors_directed(idx, Direction::Outgoing)
                .next()
                .is_none()
        })
        .collect();

    let mut cursor = 0;
    while cursor < queue.len() {
        let idx = queue[cursor];
        cursor += 1;
        let child_stage = graph[idx].stage();
        let parents: Vec<NodeIndex> = graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        for parent in parents {
            if graph[parent].stage() > child_stage {
                tracing::warn!(
                    node = %graph[parent].id(),
                    stage = %child_stage,
                    child = %graph[idx].id(),
                    "stage reset to match child"
                );
                graph[parent].set_stage(child_stage);
            }
            queue.push(parent);
        }
    }
}

/// Nodes without an explicit priority get a default derived from their
/// (possibly normalized) stage.
fn assign_priorities(graph: &mut StableDiGraph<Node, ()>) {
    let indices: Vec<NodeIndex> = graph.node_indices().collect();
    for idx in indices {
        if graph[idx].priority() != 0 {
            continue;
        }
        let priority = match graph[idx].stage() {
            Stage::Sync => PRIORITY_HIGH,
            Stage::Async => PRIORITY_MID,
            Stage::Store => PRIORITY_LOW,
            Stage::Lazy => PRIORITY_MIN,
        };
        graph[idx].set_priority(priority);
    }
}

/// Every node reachable downstream of `start`, excluding `start` itself.
pub(crate) fn descendants<N>(graph: &StableDiGraph<N, ()>, start: NodeIndex) -> Vec<NodeIndex> {
    let mut dfs = Dfs::new(graph, start);
    let mut out = Vec::new();
    while let Some(idx) = dfs.next(graph) {
        if idx != start {
            out.push(idx);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::test_node;
    use crate::node::{Field, NodeSpec, PRIORITY_MAX};
    use crate::supplier::DefaultSupplier;
    use crate::value::ValueType;

    fn staged_node(func: &str, params: &[&str], fields: &[(&str, Stage)]) -> Node {
        let supplier = Arc::new(DefaultSupplier::new("test", vec![]));
        let params = params
            .iter()
            .map(|p| {
                crate::node::Param::variable(crate::node::VarParamSpec::new(
                    *p,
                    *p,
                    ValueType::String,
                ))
                .unwrap()
            })
            .collect();
        let fields = fields
            .iter()
            .map(|(code, stage)| Field::new(*code, ValueType::String).with_stage(*stage))
            .collect();
        Node::new(NodeSpec::new(supplier, func, params, fields)).unwrap()
    }

    #[test]
    fn test_merge_unions_fields() {
        let built = build(
            test_node("root", &["in"], &["out"]),
            vec![
                test_node("f", &["out"], &["a"]),
                test_node("f", &["out"], &["b"]),
            ],
        );
        assert_eq!(built.graph.node_count(), 2);
        let merged = built
            .graph
            .node_indices()
            .map(|idx| &built.graph[idx])
            .find(|n| n.func_name() == "f")
            .unwrap();
        let mut codes: Vec<&str> = merged.field_codes().iter().map(String::as_str).collect();
        codes.sort_unstable();
        assert_eq!(codes, vec!["a", "b"]);
    }

    #[test]
    fn test_edges_from_params_and_zero_param_nodes() {
        let built = build(
            test_node("root", &["in"], &["out"]),
            vec![
                test_node("child", &["out"], &["a"]),
                test_node("free", &[], &["b"]),
            ],
        );
        let child_idx = *built
            .index_map
            .iter()
            .find(|(id, _)| id.contains("child"))
            .map(|(_, idx)| idx)
            .unwrap();
        let parents: Vec<NodeIndex> = built
            .graph
            .neighbors_directed(child_idx, Direction::Incoming)
            .collect();
        assert_eq!(parents, vec![built.root]);
        // Zero-param node also hangs off the root.
        let free_idx = *built
            .index_map
            .iter()
            .find(|(id, _)| id.contains("free"))
            .map(|(_, idx)| idx)
            .unwrap();
        assert!(built.graph.contains_edge(built.root, free_idx));
    }

    #[test]
    fn test_orphan_cascade() {
        let built = build(
            test_node("root", &["in"], &["out"]),
            vec![
                test_node("lost", &["nowhere"], &["a"]),
                test_node("downstream", &["a"], &["b"]),
                test_node("fine", &["out"], &["c"]),
            ],
        );
        assert_eq!(built.orphans.len(), 2);
        let lost = built
            .orphans
            .iter()
            .find(|o| o.node_id.contains("lost"))
            .unwrap();
        assert_eq!(lost.reason, OrphanReason::NotEnoughParams);
        assert_eq!(lost.missing_params, vec!["nowhere".to_string()]);
        let downstream = built
            .orphans
            .iter()
            .find(|o| o.node_id.contains("downstream"))
            .unwrap();
        assert_eq!(downstream.reason, OrphanReason::AncestorPruned);
        // Both excised from the executable graph.
        assert_eq!(built.graph.node_count(), 2);
        assert!(!built.index_map.keys().any(|id| id.contains("lost")));
    }

    #[test]
    fn test_stage_normalization_pulls_parents_down() {
        let built = build(
            staged_node("root", &["in"], &[("out", Stage::Sync)]),
            vec![
                staged_node("parent", &["out"], &[("mid", Stage::Lazy)]),
                staged_node("child", &["mid"], &[("leaf", Stage::Async)]),
            ],
        );
        let parent = built
            .graph
            .node_indices()
            .map(|idx| &built.graph[idx])
            .find(|n| n.func_name() == "parent")
            .unwrap();
        assert_eq!(parent.stage(), Stage::Async);

        // Idempotent: rebuilding from already-normalized nodes changes nothing.
        let again = build(
            staged_node("root", &["in"], &[("out", Stage::Sync)]),
            vec![
                staged_node("parent", &["out"], &[("mid", Stage::Async)]),
                staged_node("child", &["mid"], &[("leaf", Stage::Async)]),
            ],
        );
        let parent = again
            .graph
            .node_indices()
            .map(|idx| &again.graph[idx])
            .find(|n| n.func_name() == "parent")
            .unwrap();
        assert_eq!(parent.stage(), Stage::Async);
    }

    #[test]
    fn test_default_priorities_follow_stage() {
        let mut explicit = staged_node("fixed", &["out"], &[("a", Stage::Lazy)]);
        explicit.set_priority(PRIORITY_MAX);
        let built = build(
            staged_node("root", &["in"], &[("out", Stage::Sync)]),
            vec![
                staged_node("s", &["out"], &[("b", Stage::Sync)]),
                staged_node("st", &["out"], &[("c", Stage::Store)]),
                explicit,
            ],
        );
        for idx in built.graph.node_indices() {
            let node = &built.graph[idx];
            match node.func_name() {
                "root" | "s" => assert_eq!(node.priority(), PRIORITY_HIGH),
                "st" => assert_eq!(node.priority(), PRIORITY_LOW),
                "fixed" => assert_eq!(node.priority(), PRIORITY_MAX),
                other => panic!("unexpected node {other}"),
            }
        }
    }
}
