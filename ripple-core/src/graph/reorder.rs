//! Incremental Re-sort
//!
//! A variant of the Pearce–Kelly dynamic topological sort, extended to track
//! strongly connected components.
//!
//! # Algorithm
//!
//! 1. Seeds are the queued endpoints. The window `[lower, upper]` spans their
//!    indices and is closed under overlap with cached cycle ranges; members
//!    of an overlapping cycle become seeds too. Inside a closed window, any
//!    path between two window vertices stays inside the window.
//! 2. `F` is everything reachable forward from the seeds inside the window,
//!    `B` everything reaching them backward.
//! 3. Tarjan's algorithm over the reverse adjacency of `F ∩ B` yields its
//!    components with dependencies first.
//! 4. The indices held by `F ∪ B` are pooled, sorted and handed out in the
//!    order `B \ F`, components of `F ∩ B`, `F \ B`. The outer parts keep
//!    their relative order, so `B \ F` only moves down and `F \ B` only moves
//!    up, which keeps every edge leaving the window in order.
//! 5. Cycle membership is refreshed for `F ∩ B`: newly cyclic vertices get a
//!    CYCLE action, vertices that left a cycle are marked dirty again.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;

use super::node::{Action, CycleInfo, EdgeKind, ProcessAction, VertexId};
use super::Graph;

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

type Component = SmallVec<[VertexId; 2]>;

impl<V> Graph<V>
where
    V: Clone + Eq + Hash + Debug,
{
    /// Restore the topological order for all queued edge changes.
    ///
    /// Called by the processing loop before it visits the next vertex; safe
    /// to call directly when nothing is queued.
    pub fn resort(&mut self) {
        if self.to_reorder.is_empty() {
            return;
        }
        let mut seeds: IndexSet<VertexId> = std::mem::take(&mut self.to_reorder);

        let (lower, upper) = self.close_window(&mut seeds);
        let forward = self.reach(&seeds, lower, upper, Direction::Forward);
        let backward = self.reach(&seeds, lower, upper, Direction::Backward);

        let mut before: Vec<VertexId> = backward
            .iter()
            .copied()
            .filter(|id| !forward.contains(id))
            .collect();
        let mut after: Vec<VertexId> = forward
            .iter()
            .copied()
            .filter(|id| !backward.contains(id))
            .collect();
        let middle: IndexSet<VertexId> = forward
            .iter()
            .copied()
            .filter(|id| backward.contains(id))
            .collect();
        before.sort_unstable_by_key(|&id| self.index_by_id[id]);
        after.sort_unstable_by_key(|&id| self.index_by_id[id]);

        let components = self.components(&middle);

        let mut pool: Vec<usize> = before
            .iter()
            .chain(middle.iter())
            .chain(after.iter())
            .map(|&id| self.index_by_id[id])
            .collect();
        pool.sort_unstable();

        let sequence = before
            .iter()
            .copied()
            .chain(components.iter().flatten().copied())
            .chain(after.iter().copied());
        for (index, id) in pool.iter().copied().zip(sequence) {
            self.index_by_id[id] = index;
            self.id_by_index[index] = Some(id);
        }

        tracing::debug!(
            lower,
            upper,
            moved = pool.len(),
            components = components.len(),
            "re-sorted window"
        );

        self.refresh_cycles(&middle, &components);

        if lower < self.cursor {
            self.cursor = lower;
        }
    }

    /// Widen the window until no cached cycle straddles its edge.
    fn close_window(&self, seeds: &mut IndexSet<VertexId>) -> (usize, usize) {
        let mut lower = usize::MAX;
        let mut upper = 0;
        for &id in seeds.iter() {
            let index = self.index_by_id[id];
            lower = lower.min(index);
            upper = upper.max(index);
        }

        loop {
            let mut widened = false;
            for info in self.cycles.values() {
                if !info.overlaps(lower, upper) {
                    continue;
                }
                if info.lower_bound < lower {
                    lower = info.lower_bound;
                    widened = true;
                }
                if info.upper_bound > upper {
                    upper = info.upper_bound;
                    widened = true;
                }
                for &member in &info.members {
                    widened |= seeds.insert(member);
                }
            }
            if !widened {
                return (lower, upper);
            }
        }
    }

    /// Closure of `seeds` along edges in `direction`, limited to the window.
    fn reach(
        &self,
        seeds: &IndexSet<VertexId>,
        lower: usize,
        upper: usize,
        direction: Direction,
    ) -> IndexSet<VertexId> {
        let mut seen: IndexSet<VertexId> = seeds.clone();
        let mut stack: Vec<VertexId> = seeds.iter().copied().collect();

        while let Some(id) = stack.pop() {
            let adjacency = match direction {
                Direction::Forward => &self.forward[id],
                Direction::Backward => &self.reverse[id],
            };
            for &next in adjacency.keys() {
                let index = self.index_by_id[next];
                if index < lower || index > upper {
                    continue;
                }
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }

        seen
    }

    /// Strongly connected components of the subgraph induced by `members`.
    ///
    /// Runs Tarjan's algorithm over the reverse adjacency, iteratively. A
    /// component is emitted once everything that reaches it has been
    /// emitted, so the result lists dependencies before dependents. Members
    /// of each component are sorted by their current index.
    fn components(&self, members: &IndexSet<VertexId>) -> Vec<Component> {
        let mut roots: Vec<VertexId> = members.iter().copied().collect();
        roots.sort_unstable_by_key(|&id| self.index_by_id[id]);

        let mut discovered: HashMap<VertexId, usize> = HashMap::new();
        let mut lowlink: HashMap<VertexId, usize> = HashMap::new();
        let mut on_stack: HashSet<VertexId> = HashSet::new();
        let mut stack: Vec<VertexId> = Vec::new();
        let mut components: Vec<Component> = Vec::new();
        let mut counter = 0;

        for root in roots {
            if discovered.contains_key(&root) {
                continue;
            }

            discovered.insert(root, counter);
            lowlink.insert(root, counter);
            counter += 1;
            stack.push(root);
            on_stack.insert(root);
            let mut calls: Vec<(VertexId, usize)> = vec![(root, 0)];

            while let Some(frame) = calls.last_mut() {
                let (id, position) = *frame;
                let predecessors: &IndexMap<VertexId, EdgeKind> = &self.reverse[id];

                if let Some((&next, _)) = predecessors.get_index(position) {
                    frame.1 += 1;
                    if !members.contains(&next) {
                        continue;
                    }
                    match discovered.get(&next).copied() {
                        None => {
                            discovered.insert(next, counter);
                            lowlink.insert(next, counter);
                            counter += 1;
                            stack.push(next);
                            on_stack.insert(next);
                            calls.push((next, 0));
                        }
                        Some(order) if on_stack.contains(&next) => {
                            let low = lowlink[&id].min(order);
                            lowlink.insert(id, low);
                        }
                        Some(_) => {}
                    }
                    continue;
                }

                calls.pop();
                let low = lowlink[&id];
                if let Some(&(parent, _)) = calls.last() {
                    let parent_low = lowlink[&parent].min(low);
                    lowlink.insert(parent, parent_low);
                }
                if low == discovered[&id] {
                    let mut component = Component::new();
                    while let Some(member) = stack.pop() {
                        on_stack.remove(&member);
                        component.push(member);
                        if member == id {
                            break;
                        }
                    }
                    component.sort_unstable_by_key(|&member| self.index_by_id[member]);
                    components.push(component);
                }
            }
        }

        components
    }

    /// Rebuild cycle records for the re-sorted middle and fire the actions
    /// for vertices whose membership changed.
    fn refresh_cycles(&mut self, middle: &IndexSet<VertexId>, components: &[Component]) {
        let mut was_cyclic: HashSet<VertexId> = HashSet::new();
        for &id in middle {
            if let Some(cycle) = self.cycle_by_id.remove(&id) {
                self.cycles.remove(&cycle);
                was_cyclic.insert(id);
            }
        }

        for component in components {
            let cyclic = component.len() > 1;
            if cyclic {
                let indices = component.iter().map(|&id| self.index_by_id[id]);
                let lower_bound = indices.clone().min().unwrap_or_default();
                let upper_bound = indices.max().unwrap_or_default();

                let cycle = self.next_cycle_id;
                self.next_cycle_id += 1;
                for &member in component {
                    self.cycle_by_id.insert(member, cycle);
                }
                self.cycles.insert(
                    cycle,
                    CycleInfo {
                        lower_bound,
                        upper_bound,
                        members: component.iter().copied().collect(),
                    },
                );
                tracing::debug!(cycle, size = component.len(), "cycle detected");
            }

            for &id in component {
                let was = was_cyclic.contains(&id);
                if cyclic {
                    let bits = &mut self.bits_by_id[id];
                    bits.set_cycle(true);
                    if !was && !bits.is_cycle_informed() {
                        bits.set_cycle_informed(true);
                        let vertex = self.vertex(id).clone();
                        self.pending
                            .push_back(Action::single(ProcessAction::Cycle, vertex));
                    }
                } else if was {
                    let bits = &mut self.bits_by_id[id];
                    bits.set_cycle(false);
                    if !bits.is_self_cycle() {
                        bits.set_cycle_informed(false);
                    }
                    tracing::debug!(vertex = ?self.vertex(id), "vertex left its cycle");
                    self.mark_dirty_id(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::Graph;

    fn chain(names: &[&'static str]) -> Graph<&'static str> {
        let mut graph = Graph::new();
        for name in names {
            graph.add_vertex(*name);
        }
        graph
    }

    fn assert_in_order(graph: &Graph<&'static str>, from: &'static str, to: &'static str) {
        assert!(
            graph.topological_index(&from) < graph.topological_index(&to),
            "{from} should precede {to}"
        );
    }

    #[test]
    fn reversed_chain_is_sorted() {
        let mut graph = chain(&["a", "b", "c", "d"]);
        graph.add_edge(&"d", &"c");
        graph.add_edge(&"c", &"b");
        graph.add_edge(&"b", &"a");
        graph.resort();

        assert_in_order(&graph, "d", "c");
        assert_in_order(&graph, "c", "b");
        assert_in_order(&graph, "b", "a");
    }

    #[test]
    fn unrelated_vertices_keep_edges_in_order() {
        // u -> w stays in order while u is pulled into the window.
        let mut graph = chain(&["to", "u", "w", "x", "from"]);
        graph.add_edge(&"to", &"x");
        graph.add_edge(&"u", &"x");
        graph.add_edge(&"u", &"w");
        graph.add_edge(&"from", &"to");
        graph.resort();

        assert_in_order(&graph, "from", "to");
        assert_in_order(&graph, "to", "x");
        assert_in_order(&graph, "u", "x");
        assert_in_order(&graph, "u", "w");
    }

    #[test]
    fn cycle_is_detected_and_reported() {
        let mut graph = chain(&["a", "b", "c", "d"]);
        graph.add_edge(&"a", &"b");
        graph.add_edge(&"b", &"c");
        graph.add_edge(&"c", &"d");
        graph.add_edge(&"c", &"a");
        graph.resort();

        let mut members = graph.cycle_members(&"a").unwrap();
        members.sort_unstable();
        assert_eq!(members, vec!["a", "b", "c"]);
        assert!(!graph.is_in_cycle(&"d"));
        assert_in_order(&graph, "c", "d");
        assert_in_order(&graph, "a", "d");
        assert_in_order(&graph, "b", "d");
    }

    #[test]
    fn breaking_a_cycle_dirties_its_members() {
        let mut graph = chain(&["a", "b"]);
        graph.add_edge(&"a", &"b");
        graph.add_edge(&"b", &"a");
        graph.resort();
        assert!(graph.is_in_cycle(&"a"));

        graph.remove_edge(&"b", &"a");
        assert!(graph.has_pending_reorder());
        graph.resort();

        assert!(!graph.is_in_cycle(&"a"));
        assert!(!graph.is_in_cycle(&"b"));
        assert!(graph.is_dirty(&"a"));
        assert!(graph.is_dirty(&"b"));
        assert_in_order(&graph, "a", "b");
    }

    #[test]
    fn in_order_edge_inside_a_cycle_range_is_queued() {
        let mut graph = chain(&["p", "x", "y", "q"]);
        graph.add_edge(&"p", &"q");
        graph.add_edge(&"q", &"p");
        graph.resort();
        assert!(graph.is_in_cycle(&"p"));

        // x -> y is in order, but y sits inside the cycle's range.
        assert_in_order(&graph, "x", "y");
        graph.add_edge(&"x", &"y");
        assert!(graph.has_pending_reorder());
        graph.resort();
        assert!(!graph.is_in_cycle(&"x"));
        assert_in_order(&graph, "x", "y");

        // y -> q -> p -> x -> y
        graph.add_edge(&"p", &"x");
        graph.add_edge(&"y", &"q");
        graph.resort();

        let mut members = graph.cycle_members(&"x").unwrap();
        members.sort_unstable();
        assert_eq!(members, vec!["p", "q", "x", "y"]);
    }
}
