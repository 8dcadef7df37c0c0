//! Dependency Graph
//!
//! This module implements the directed graph that tracks which vertices
//! depend on which. It knows nothing about what a vertex means: the reactive
//! layer on top gives vertices their behavior.
//!
//! # Overview
//!
//! An edge `from -> to` means "`to` depends on `from`": data flows from
//! `from` to `to`, and `from` is processed first. The graph maintains a
//! topological order of all vertices incrementally, so a write to a source
//! only revisits the dirty slice of the order.
//!
//! Cycles are allowed. Strongly connected components are detected while the
//! order is maintained and are processed as one unit.
//!
//! # Design Decisions
//!
//! 1. Vertices live in an arena: parallel vectors indexed by a recycled id,
//!    plus an order vector indexed by a recycled topological index.
//!
//! 2. Out-of-order edges are not fixed eagerly. Both endpoints are queued and
//!    the affected window is re-sorted right before processing needs it, so a
//!    batch of edge changes costs one re-sort.
//!
//! 3. The graph never calls back into its owner. Actions are queued and
//!    pulled with [`Graph::next_action`], which lets the owner run callbacks
//!    that mutate the graph again.
//!
//! 4. Malformed operations (double add, edges to absent vertices, removing a
//!    vertex that still has edges) are bugs and panic.

mod node;
mod process;
mod reorder;

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;

use node::{CycleId, CycleInfo, VertexId};

pub use node::{Action, EdgeKind, ProcessAction, VertexBits};

/// Incrementally ordered dependency graph over vertex handles `V`.
pub struct Graph<V> {
    vertex_by_id: Vec<Option<V>>,
    id_by_vertex: HashMap<V, VertexId>,
    free_ids: Vec<VertexId>,
    bits_by_id: Vec<VertexBits>,

    /// Topological index of each live id.
    index_by_id: Vec<usize>,
    /// The order itself: id at each topological index.
    id_by_index: Vec<Option<VertexId>>,
    free_indices: Vec<usize>,

    forward: Vec<IndexMap<VertexId, EdgeKind>>,
    reverse: Vec<IndexMap<VertexId, EdgeKind>>,

    cycle_by_id: HashMap<VertexId, CycleId>,
    cycles: HashMap<CycleId, CycleInfo>,
    next_cycle_id: CycleId,

    /// Endpoints of edge changes that may have broken the order.
    to_reorder: IndexSet<VertexId>,

    /// Lowest topological index that may still hold a dirty vertex.
    cursor: usize,
    pending: VecDeque<Action<V>>,
    /// Group handed out by the last RECALCULATE, checked on the next step.
    last_group: Option<SmallVec<[VertexId; 2]>>,
}

impl<V> Graph<V>
where
    V: Clone + Eq + Hash + Debug,
{
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            vertex_by_id: Vec::new(),
            id_by_vertex: HashMap::new(),
            free_ids: Vec::new(),
            bits_by_id: Vec::new(),
            index_by_id: Vec::new(),
            id_by_index: Vec::new(),
            free_indices: Vec::new(),
            forward: Vec::new(),
            reverse: Vec::new(),
            cycle_by_id: HashMap::new(),
            cycles: HashMap::new(),
            next_cycle_id: 0,
            to_reorder: IndexSet::new(),
            cursor: 0,
            pending: VecDeque::new(),
            last_group: None,
        }
    }

    /// Number of vertices in the graph.
    pub fn len(&self) -> usize {
        self.id_by_vertex.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_by_vertex.is_empty()
    }

    pub fn contains(&self, vertex: &V) -> bool {
        self.id_by_vertex.contains_key(vertex)
    }

    /// Add a vertex. Panics if it is already present.
    pub fn add_vertex(&mut self, vertex: V) {
        assert!(
            !self.id_by_vertex.contains_key(&vertex),
            "vertex {vertex:?} added to the graph twice"
        );

        let id = match self.free_ids.pop() {
            Some(id) => {
                self.vertex_by_id[id] = Some(vertex.clone());
                self.bits_by_id[id] = VertexBits::default();
                id
            }
            None => {
                self.vertex_by_id.push(Some(vertex.clone()));
                self.bits_by_id.push(VertexBits::default());
                self.index_by_id.push(0);
                self.forward.push(IndexMap::new());
                self.reverse.push(IndexMap::new());
                self.vertex_by_id.len() - 1
            }
        };

        // A vertex without edges is in order at any index.
        let index = match self.free_indices.pop() {
            Some(index) => index,
            None => {
                self.id_by_index.push(None);
                self.id_by_index.len() - 1
            }
        };
        self.id_by_index[index] = Some(id);
        self.index_by_id[id] = index;
        self.id_by_vertex.insert(vertex.clone(), id);

        tracing::trace!(?vertex, id, index, "vertex added");
    }

    /// Remove a vertex. Panics if it is absent or still has edges.
    pub fn remove_vertex(&mut self, vertex: &V) {
        let id = self.id_of(vertex);
        assert!(
            self.forward[id].is_empty() && self.reverse[id].is_empty(),
            "vertex {vertex:?} removed while it still has edges"
        );
        // Whatever is left of its component needs its membership rechecked.
        if let Some(cycle) = self.cycle_by_id.remove(&id) {
            let emptied = match self.cycles.get_mut(&cycle) {
                Some(info) => {
                    info.members.retain(|member| *member != id);
                    for &member in &info.members {
                        self.to_reorder.insert(member);
                    }
                    info.members.is_empty()
                }
                None => false,
            };
            if emptied {
                self.cycles.remove(&cycle);
            }
        }

        self.to_reorder.shift_remove(&id);
        self.id_by_vertex.remove(vertex);
        self.vertex_by_id[id] = None;
        self.bits_by_id[id] = VertexBits::default();

        let index = self.index_by_id[id];
        self.id_by_index[index] = None;
        self.free_indices.push(index);
        self.free_ids.push(id);

        tracing::trace!(?vertex, id, index, "vertex removed");
    }

    /// Add a hard edge: `to` depends on `from`.
    pub fn add_edge(&mut self, from: &V, to: &V) {
        self.add_edge_kind(from, to, EdgeKind::HARD);
    }

    /// Add a soft (ordering-only) edge.
    pub fn add_soft_edge(&mut self, from: &V, to: &V) {
        self.add_edge_kind(from, to, EdgeKind::SOFT);
    }

    pub fn remove_edge(&mut self, from: &V, to: &V) {
        self.remove_edge_kind(from, to, EdgeKind::HARD);
    }

    pub fn remove_soft_edge(&mut self, from: &V, to: &V) {
        self.remove_edge_kind(from, to, EdgeKind::SOFT);
    }

    /// Add an edge of the given kind, merging with an existing edge.
    ///
    /// A self-edge fires CYCLE right away unless the vertex was already
    /// informed. An edge that may break the order queues both endpoints for
    /// the next re-sort.
    pub fn add_edge_kind(&mut self, from: &V, to: &V, kind: EdgeKind) {
        let from_id = self.id_of(from);
        let to_id = self.id_of(to);

        let merged = self.forward[from_id]
            .get(&to_id)
            .copied()
            .unwrap_or_default()
            .union(kind);
        self.forward[from_id].insert(to_id, merged);
        self.reverse[to_id].insert(from_id, merged);
        tracing::trace!(?from, ?to, kind = ?merged, "edge added");

        if from_id == to_id {
            let bits = &mut self.bits_by_id[from_id];
            bits.set_self_cycle(true);
            if !bits.is_cycle_informed() {
                bits.set_cycle_informed(true);
                self.pending
                    .push_back(Action::single(ProcessAction::Cycle, from.clone()));
            }
            return;
        }

        let from_index = self.index_by_id[from_id];
        let to_index = self.index_by_id[to_id];
        if from_index > to_index {
            self.to_reorder.insert(from_id);
            self.to_reorder.insert(to_id);
            return;
        }

        // An in-order edge can still close a cycle when a path from `to`
        // back down to `from` descends through an existing component.
        if !self.cycles.is_empty() && self.cycles.values().any(|info| info.spans(to_index)) {
            self.to_reorder.insert(from_id);
            self.to_reorder.insert(to_id);
        }
    }

    /// Remove the given kind bits from an edge. Panics if the edge does not
    /// carry them.
    pub fn remove_edge_kind(&mut self, from: &V, to: &V, kind: EdgeKind) {
        let from_id = self.id_of(from);
        let to_id = self.id_of(to);

        let current = self.forward[from_id].get(&to_id).copied();
        let current = match current {
            Some(current) if current.contains(kind) => current,
            _ => panic!("removed missing {kind:?} edge {from:?} -> {to:?}"),
        };

        let remaining = current.difference(kind);
        tracing::trace!(?from, ?to, kind = ?kind, "edge removed");
        if !remaining.is_empty() {
            self.forward[from_id].insert(to_id, remaining);
            self.reverse[to_id].insert(from_id, remaining);
            return;
        }

        self.forward[from_id].shift_remove(&to_id);
        self.reverse[to_id].shift_remove(&from_id);

        if from_id == to_id {
            let bits = &mut self.bits_by_id[from_id];
            bits.set_self_cycle(false);
            if !bits.is_cycle() {
                bits.set_cycle_informed(false);
                self.mark_dirty_id(from_id);
            }
            return;
        }

        // The component may have split.
        let same_cycle = match (self.cycle_by_id.get(&from_id), self.cycle_by_id.get(&to_id)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if same_cycle {
            self.to_reorder.insert(from_id);
            self.to_reorder.insert(to_id);
        }
    }

    pub fn has_edge(&self, from: &V, to: &V) -> bool {
        self.edge_kind(from, to).is_some()
    }

    pub fn edge_kind(&self, from: &V, to: &V) -> Option<EdgeKind> {
        let from_id = *self.id_by_vertex.get(from)?;
        let to_id = *self.id_by_vertex.get(to)?;
        self.forward[from_id].get(&to_id).copied()
    }

    /// Mark a vertex dirty.
    ///
    /// Clears CYCLE_INFORMED, queues an immediate INVALIDATE and rewinds the
    /// processing cursor if the vertex sits behind it.
    pub fn mark_dirty(&mut self, vertex: &V) {
        let id = self.id_of(vertex);
        self.mark_dirty_id(id);
    }

    /// Clear the dirty bit without processing the vertex.
    pub fn unmark_dirty(&mut self, vertex: &V) {
        let id = self.id_of(vertex);
        self.bits_by_id[id].set_dirty(false);
    }

    pub fn mark_cycle_informed(&mut self, vertex: &V) {
        let id = self.id_of(vertex);
        self.bits_by_id[id].set_cycle_informed(true);
    }

    pub fn bits(&self, vertex: &V) -> VertexBits {
        self.bits_by_id[self.id_of(vertex)]
    }

    pub fn is_dirty(&self, vertex: &V) -> bool {
        self.bits(vertex).is_dirty()
    }

    /// Whether the vertex is in a multi-vertex cycle or has a self-edge.
    pub fn is_in_cycle(&self, vertex: &V) -> bool {
        self.bits(vertex).in_any_cycle()
    }

    pub fn topological_index(&self, vertex: &V) -> usize {
        self.index_by_id[self.id_of(vertex)]
    }

    /// Members of the cached component containing `vertex`, if any.
    pub fn cycle_members(&self, vertex: &V) -> Option<Vec<V>> {
        let id = self.id_of(vertex);
        let cycle = self.cycle_by_id.get(&id)?;
        Some(
            self.cycles[cycle]
                .members
                .iter()
                .map(|&member| self.vertex(member).clone())
                .collect(),
        )
    }

    /// Hard out-edges of `vertex`, skipping itself and members of its own
    /// cycle. These are the vertices a change should dirty next.
    pub fn forward_dependencies(&self, vertex: &V) -> Vec<V> {
        let id = self.id_of(vertex);
        let cycle = self.cycle_by_id.get(&id);
        self.forward[id]
            .iter()
            .filter(|&(&to_id, &kind)| {
                kind.contains(EdgeKind::HARD)
                    && to_id != id
                    && (cycle.is_none() || self.cycle_by_id.get(&to_id) != cycle)
            })
            .map(|(&to_id, _)| self.vertex(to_id).clone())
            .collect()
    }

    /// Whether edge changes are waiting for a re-sort.
    pub fn has_pending_reorder(&self) -> bool {
        !self.to_reorder.is_empty()
    }

    /// Vertices in topological order.
    pub fn vertices(&self) -> impl Iterator<Item = &V> + '_ {
        self.id_by_index
            .iter()
            .flatten()
            .map(move |&id| self.vertex(id))
    }

    /// All edges with their kinds, grouped by source in topological order.
    pub fn edges(&self) -> impl Iterator<Item = (&V, &V, EdgeKind)> + '_ {
        self.id_by_index.iter().flatten().flat_map(move |&from_id| {
            self.forward[from_id]
                .iter()
                .map(move |(&to_id, &kind)| (self.vertex(from_id), self.vertex(to_id), kind))
        })
    }

    /// Arena id of a vertex, recycled once the vertex is removed.
    pub fn vertex_id(&self, vertex: &V) -> usize {
        self.id_of(vertex)
    }

    fn id_of(&self, vertex: &V) -> VertexId {
        match self.id_by_vertex.get(vertex) {
            Some(&id) => id,
            None => panic!("vertex {vertex:?} is not in the graph"),
        }
    }

    fn vertex(&self, id: VertexId) -> &V {
        match &self.vertex_by_id[id] {
            Some(vertex) => vertex,
            None => panic!("vertex id {id} is vacant"),
        }
    }

    pub(crate) fn mark_dirty_id(&mut self, id: VertexId) {
        let bits = &mut self.bits_by_id[id];
        bits.set_dirty(true);
        bits.set_cycle_informed(false);

        let index = self.index_by_id[id];
        if index < self.cursor {
            self.cursor = index;
        }
        let vertex = self.vertex(id).clone();
        tracing::trace!(?vertex, index, "vertex marked dirty");
        self.pending
            .push_back(Action::single(ProcessAction::Invalidate, vertex));
    }
}

impl<V> Default for Graph<V>
where
    V: Clone + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
