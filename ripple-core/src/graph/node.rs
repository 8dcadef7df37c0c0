//! Graph Nodes
//!
//! This module defines the per-vertex and per-edge state that lives in the
//! dependency graph: packed vertex bits, edge kinds, cycle records and the
//! actions the processing loop hands back to its driver.

use std::fmt;

use smallvec::SmallVec;

/// Arena slot of a vertex. Recycled when the vertex is removed.
pub(crate) type VertexId = usize;

/// Identifier of a cached strongly connected component.
pub(crate) type CycleId = u64;

/// Packed state bits of a vertex.
///
/// The raw integer never leaves this type; callers go through the named
/// accessors.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct VertexBits(u8);

impl VertexBits {
    const DIRTY: u8 = 0b0001;
    const CYCLE: u8 = 0b0010;
    const SELF_CYCLE: u8 = 0b0100;
    const CYCLE_INFORMED: u8 = 0b1000;

    /// The vertex needs processing.
    pub fn is_dirty(self) -> bool {
        self.0 & Self::DIRTY != 0
    }

    /// The vertex belongs to a strongly connected component of more than one
    /// vertex.
    pub fn is_cycle(self) -> bool {
        self.0 & Self::CYCLE != 0
    }

    /// The vertex has an edge to itself.
    pub fn is_self_cycle(self) -> bool {
        self.0 & Self::SELF_CYCLE != 0
    }

    /// The vertex already received a CYCLE action for its current membership.
    pub fn is_cycle_informed(self) -> bool {
        self.0 & Self::CYCLE_INFORMED != 0
    }

    /// Either kind of cycle.
    pub fn in_any_cycle(self) -> bool {
        self.is_cycle() || self.is_self_cycle()
    }

    pub(crate) fn set_dirty(&mut self, on: bool) {
        self.set(Self::DIRTY, on);
    }

    pub(crate) fn set_cycle(&mut self, on: bool) {
        self.set(Self::CYCLE, on);
    }

    pub(crate) fn set_self_cycle(&mut self, on: bool) {
        self.set(Self::SELF_CYCLE, on);
    }

    pub(crate) fn set_cycle_informed(&mut self, on: bool) {
        self.set(Self::CYCLE_INFORMED, on);
    }

    fn set(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl fmt::Debug for VertexBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.is_dirty() {
            set.entry(&"DIRTY");
        }
        if self.is_cycle() {
            set.entry(&"CYCLE");
        }
        if self.is_self_cycle() {
            set.entry(&"SELF_CYCLE");
        }
        if self.is_cycle_informed() {
            set.entry(&"CYCLE_INFORMED");
        }
        set.finish()
    }
}

/// Kind bitmask carried by an edge.
///
/// Hard edges propagate dirtiness; soft edges only constrain the order.
/// Adding the same edge twice merges the bits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EdgeKind(u8);

impl EdgeKind {
    /// Dirtiness passes through transitively.
    pub const HARD: Self = Self(0b01);

    /// Ordering-only constraint.
    pub const SOFT: Self = Self(0b10);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl fmt::Debug for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Self::HARD), self.contains(Self::SOFT)) {
            (true, true) => f.write_str("HARD|SOFT"),
            (true, false) => f.write_str("HARD"),
            (false, true) => f.write_str("SOFT"),
            (false, false) => f.write_str("NONE"),
        }
    }
}

/// What the driver of the processing loop should do with a vertex group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAction {
    /// The vertex was just marked dirty; drop anything cached.
    Invalidate,

    /// The vertex (or its whole cycle) is due for recomputation.
    Recalculate,

    /// The vertex became part of a cycle.
    Cycle,
}

/// A unit of work produced by the graph.
///
/// INVALIDATE and CYCLE actions always carry a single vertex. RECALCULATE
/// carries the full cycle group of the dirty vertex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action<V> {
    pub kind: ProcessAction,
    pub group: SmallVec<[V; 2]>,
}

impl<V> Action<V> {
    pub(crate) fn single(kind: ProcessAction, vertex: V) -> Self {
        let mut group = SmallVec::new();
        group.push(vertex);
        Self { kind, group }
    }
}

/// A cached strongly connected component.
///
/// Every member's topological index lies within
/// `lower_bound..=upper_bound`; the range decides which slice of the order
/// must be re-sorted when edges touching the component change.
#[derive(Debug, Clone)]
pub(crate) struct CycleInfo {
    pub lower_bound: usize,
    pub upper_bound: usize,
    pub members: SmallVec<[VertexId; 4]>,
}

impl CycleInfo {
    pub fn overlaps(&self, lower: usize, upper: usize) -> bool {
        self.lower_bound <= upper && self.upper_bound >= lower
    }

    /// Whether `index` lies strictly after the lower bound and within the
    /// upper bound, so a path can descend through the component past it.
    pub fn spans(&self, index: usize) -> bool {
        self.lower_bound < index && index <= self.upper_bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_start_clear() {
        let bits = VertexBits::default();
        assert!(!bits.is_dirty());
        assert!(!bits.in_any_cycle());
        assert!(!bits.is_cycle_informed());
    }

    #[test]
    fn bits_toggle_independently() {
        let mut bits = VertexBits::default();
        bits.set_dirty(true);
        bits.set_cycle(true);
        assert!(bits.is_dirty());
        assert!(bits.is_cycle());
        assert!(!bits.is_self_cycle());

        bits.set_dirty(false);
        assert!(!bits.is_dirty());
        assert!(bits.is_cycle());
        assert_eq!(format!("{bits:?}"), r#"{"CYCLE"}"#);
    }

    #[test]
    fn edge_kinds_merge() {
        let both = EdgeKind::HARD.union(EdgeKind::SOFT);
        assert!(both.contains(EdgeKind::HARD));
        assert!(both.contains(EdgeKind::SOFT));

        let soft = both.difference(EdgeKind::HARD);
        assert_eq!(soft, EdgeKind::SOFT);
        assert!(soft.difference(EdgeKind::SOFT).is_empty());
    }

    #[test]
    fn cycle_ranges() {
        let info = CycleInfo {
            lower_bound: 2,
            upper_bound: 5,
            members: SmallVec::new(),
        };
        assert!(info.overlaps(0, 2));
        assert!(info.overlaps(5, 9));
        assert!(!info.overlaps(6, 9));
        assert!(!info.spans(2));
        assert!(info.spans(3));
        assert!(info.spans(5));
    }
}
