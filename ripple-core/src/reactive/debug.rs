//! Graph Export
//!
//! A snapshot of the engine's graph for diagnostics: vertex labels, order,
//! state bits and edges. Snapshots serialize with serde (JSON or
//! MessagePack) and render to Graphviz DOT.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// One vertex of a [`DebugGraph`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugVertex {
    /// The vertex key.
    pub id: u64,
    /// Topological index at snapshot time.
    pub index: usize,
    pub label: String,
    pub dirty: bool,
    pub cycle: bool,
}

/// One edge of a [`DebugGraph`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugEdge {
    pub from: u64,
    pub to: u64,
    pub hard: bool,
    pub soft: bool,
}

/// Snapshot of an engine's graph. Vertices are listed in topological order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugGraph {
    pub label: String,
    pub vertices: Vec<DebugVertex>,
    pub edges: Vec<DebugEdge>,
}

impl DebugGraph {
    pub fn vertex(&self, id: u64) -> Option<&DebugVertex> {
        self.vertices.iter().find(|vertex| vertex.id == id)
    }

    /// Render as a Graphviz digraph. Soft edges are dashed, cyclic vertices
    /// red, dirty vertices filled.
    pub fn to_dot(&self) -> String {
        let mut dot = String::new();
        let _ = writeln!(dot, "digraph {:?} {{", self.label);
        for vertex in &self.vertices {
            let mut attrs = vec![format!("label={:?}", vertex.label)];
            if vertex.cycle {
                attrs.push("color=red".to_string());
            }
            if vertex.dirty {
                attrs.push("style=filled".to_string());
            }
            let _ = writeln!(dot, "  v{} [{}];", vertex.id, attrs.join(", "));
        }
        for edge in &self.edges {
            let style = if edge.hard { "solid" } else { "dashed" };
            let _ = writeln!(dot, "  v{} -> v{} [style={}];", edge.from, edge.to, style);
        }
        dot.push_str("}\n");
        dot
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DebugGraph {
        DebugGraph {
            label: "engine".to_string(),
            vertices: vec![
                DebugVertex {
                    id: 1,
                    index: 0,
                    label: "a".to_string(),
                    dirty: true,
                    cycle: false,
                },
                DebugVertex {
                    id: 2,
                    index: 1,
                    label: "b".to_string(),
                    dirty: false,
                    cycle: false,
                },
            ],
            edges: vec![DebugEdge {
                from: 1,
                to: 2,
                hard: false,
                soft: true,
            }],
        }
    }

    #[test]
    fn dot_lists_vertices_and_edges() {
        let dot = sample().to_dot();
        assert!(dot.starts_with("digraph \"engine\" {"));
        assert!(dot.contains("v1 [label=\"a\", style=filled];"));
        assert!(dot.contains("v2 [label=\"b\"];"));
        assert!(dot.contains("v1 -> v2 [style=dashed];"));
    }

    #[test]
    fn msgpack_keeps_the_snapshot() {
        let graph = sample();
        let bytes = graph.to_msgpack().unwrap();
        assert_eq!(DebugGraph::from_msgpack(&bytes).unwrap(), graph);
    }

    #[test]
    fn json_uses_field_names() {
        let json = sample().to_json().unwrap();
        assert!(json.contains("\"label\":\"engine\""));
        assert!(json.contains("\"soft\":true"));
    }
}
