//! Property tests for the incremental order.
//!
//! Random edge churn is applied to a small graph, the graph is drained, and
//! its order and cycle records are compared against a from-scratch
//! strongly-connected-component computation.

use std::collections::{BTreeSet, HashSet};

use proptest::prelude::*;
use ripple_core::graph::{EdgeKind, Graph};

const VERTICES: u32 = 8;

#[derive(Debug, Clone)]
enum Op {
    AddEdge(u32, u32),
    AddSoftEdge(u32, u32),
    RemoveEdge(u32, u32),
    MarkDirty(u32),
    /// Remove every edge of the vertex, drop it and add it back.
    Recycle(u32),
}

fn arb_op() -> impl Strategy<Value = Op> {
    let vertex = 0..VERTICES;
    prop_oneof![
        4 => (vertex.clone(), vertex.clone()).prop_map(|(a, b)| Op::AddEdge(a, b)),
        1 => (vertex.clone(), vertex.clone()).prop_map(|(a, b)| Op::AddSoftEdge(a, b)),
        3 => (vertex.clone(), vertex.clone()).prop_map(|(a, b)| Op::RemoveEdge(a, b)),
        1 => vertex.clone().prop_map(Op::MarkDirty),
        1 => vertex.prop_map(Op::Recycle),
    ]
}

fn apply(graph: &mut Graph<u32>, op: &Op) {
    match *op {
        Op::AddEdge(from, to) => graph.add_edge(&from, &to),
        Op::AddSoftEdge(from, to) => graph.add_soft_edge(&from, &to),
        Op::RemoveEdge(from, to) => {
            if let Some(kind) = graph.edge_kind(&from, &to) {
                graph.remove_edge_kind(&from, &to, kind);
            }
        }
        Op::MarkDirty(vertex) => graph.mark_dirty(&vertex),
        Op::Recycle(vertex) => {
            let touching: Vec<(u32, u32, EdgeKind)> = graph
                .edges()
                .filter(|(from, to, _)| **from == vertex || **to == vertex)
                .map(|(from, to, kind)| (*from, *to, kind))
                .collect();
            for (from, to, kind) in touching {
                graph.remove_edge_kind(&from, &to, kind);
            }
            graph.remove_vertex(&vertex);
            graph.add_vertex(vertex);
        }
    }
}

/// Vertices reachable from `start`, including itself.
fn reachable(edges: &HashSet<(u32, u32)>, start: u32) -> BTreeSet<u32> {
    let mut seen = BTreeSet::from([start]);
    let mut stack = vec![start];
    while let Some(vertex) = stack.pop() {
        for &(from, to) in edges {
            if from == vertex && seen.insert(to) {
                stack.push(to);
            }
        }
    }
    seen
}

fn components(edges: &HashSet<(u32, u32)>) -> Vec<BTreeSet<u32>> {
    let reach: Vec<BTreeSet<u32>> = (0..VERTICES).map(|v| reachable(edges, v)).collect();
    (0..VERTICES)
        .map(|v| {
            (0..VERTICES)
                .filter(|&u| reach[v as usize].contains(&u) && reach[u as usize].contains(&v))
                .collect()
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn order_and_cycles_match_recomputation(ops in prop::collection::vec(arb_op(), 0..40)) {
        let mut graph = Graph::new();
        for vertex in 0..VERTICES {
            graph.add_vertex(vertex);
        }

        for op in &ops {
            apply(&mut graph, op);
        }
        while graph.next_action().is_some() {}

        let edges: HashSet<(u32, u32)> = graph.edges().map(|(from, to, _)| (*from, *to)).collect();
        let components = components(&edges);

        // Indices are distinct.
        let indices: HashSet<usize> = (0..VERTICES).map(|v| graph.topological_index(&v)).collect();
        prop_assert_eq!(indices.len(), VERTICES as usize);

        // Edges outside a component point forward.
        for &(from, to) in &edges {
            if from == to || components[from as usize].contains(&to) {
                continue;
            }
            prop_assert!(
                graph.topological_index(&from) < graph.topological_index(&to),
                "edge {} -> {} out of order", from, to
            );
        }

        for vertex in 0..VERTICES {
            let component = &components[vertex as usize];
            let bits = graph.bits(&vertex);
            prop_assert!(!bits.is_dirty());
            prop_assert_eq!(bits.is_self_cycle(), edges.contains(&(vertex, vertex)));
            prop_assert_eq!(bits.is_cycle(), component.len() > 1);

            if component.len() > 1 {
                let members: BTreeSet<u32> = graph
                    .cycle_members(&vertex)
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                prop_assert_eq!(&members, component);
            } else {
                prop_assert!(graph.cycle_members(&vertex).is_none());
            }
        }
    }

    #[test]
    fn acyclic_graphs_process_in_dependency_order(
        edges in prop::collection::vec((0..VERTICES, 0..VERTICES), 0..30)
    ) {
        let mut graph = Graph::new();
        for vertex in 0..VERTICES {
            graph.add_vertex(vertex);
        }
        // Edges only run from a larger vertex to a smaller one.
        let edges: HashSet<(u32, u32)> = edges
            .into_iter()
            .filter(|(a, b)| a != b)
            .map(|(a, b)| (a.max(b), a.min(b)))
            .collect();
        for (from, to) in &edges {
            graph.add_edge(from, to);
        }
        for vertex in 0..VERTICES {
            graph.mark_dirty(&vertex);
        }

        let mut done: Vec<u32> = Vec::new();
        while let Some(action) = graph.next_action() {
            if action.kind == ripple_core::graph::ProcessAction::Recalculate {
                done.extend(action.group.iter().copied());
            }
        }

        prop_assert_eq!(done.len(), VERTICES as usize);
        let position = |v: u32| done.iter().position(|&d| d == v);
        for (from, to) in &edges {
            prop_assert!(position(*from) < position(*to));
        }
    }
}
