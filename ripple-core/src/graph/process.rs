//! Processing Loop
//!
//! Walks the topological order from the cursor and hands dirty vertices to
//! the driver one group at a time.
//!
//! # Order of work
//!
//! 1. Queued immediate actions (INVALIDATE, CYCLE) drain first.
//! 2. Pending edge changes are re-sorted before the walk continues, so a
//!    vertex is never visited ahead of something it depends on.
//! 3. After a RECALCULATE, members of the group that are still cyclic and
//!    were not yet informed receive a CYCLE action.
//! 4. The next dirty vertex at or after the cursor is cleared and handed out
//!    with its whole cycle group.

use std::fmt::Debug;
use std::hash::Hash;

use smallvec::SmallVec;

use super::node::{Action, ProcessAction, VertexId};
use super::Graph;

impl<V> Graph<V>
where
    V: Clone + Eq + Hash + Debug,
{
    /// Pull the next unit of work, or `None` once nothing is dirty.
    ///
    /// The caller may mutate the graph between calls; new edges and dirty
    /// marks are picked up on the next call.
    pub fn next_action(&mut self) -> Option<Action<V>> {
        loop {
            if let Some(action) = self.pending.pop_front() {
                return Some(action);
            }

            if !self.to_reorder.is_empty() {
                self.resort();
                continue;
            }

            if let Some(group) = self.last_group.take() {
                self.inform_cycles(&group);
                continue;
            }

            return self.next_dirty_group();
        }
    }

    /// Pop a queued INVALIDATE or CYCLE without re-sorting or scanning.
    ///
    /// Lets the owner dispatch the actions an edge or dirty-bit change fires
    /// before that call returns.
    pub fn next_immediate(&mut self) -> Option<Action<V>> {
        self.pending.pop_front()
    }

    /// Drain the loop, feeding each action to `handler`.
    ///
    /// Every vertex the handler returns is marked dirty, which is how a
    /// changed vertex pushes work to its dependents.
    pub fn process<F>(&mut self, mut handler: F)
    where
        F: FnMut(&Action<V>) -> Vec<V>,
    {
        while let Some(action) = self.next_action() {
            for vertex in handler(&action) {
                self.mark_dirty(&vertex);
            }
        }
    }

    fn inform_cycles(&mut self, group: &[VertexId]) {
        for &id in group {
            // The vertex may have been removed by the driver.
            if self.vertex_by_id[id].is_none() {
                continue;
            }
            let bits = &mut self.bits_by_id[id];
            if bits.in_any_cycle() && !bits.is_cycle_informed() {
                bits.set_cycle_informed(true);
                let vertex = self.vertex(id).clone();
                self.pending
                    .push_back(Action::single(ProcessAction::Cycle, vertex));
            }
        }
    }

    fn next_dirty_group(&mut self) -> Option<Action<V>> {
        while self.cursor < self.id_by_index.len() {
            let index = self.cursor;
            let id = match self.id_by_index[index] {
                Some(id) if self.bits_by_id[id].is_dirty() => id,
                _ => {
                    self.cursor += 1;
                    continue;
                }
            };

            let members: SmallVec<[VertexId; 2]> = match self.cycle_by_id.get(&id) {
                Some(cycle) => self.cycles[cycle].members.iter().copied().collect(),
                None => SmallVec::from_elem(id, 1),
            };
            for &member in &members {
                self.bits_by_id[member].set_dirty(false);
            }

            self.cursor = index + 1;
            let group = members
                .iter()
                .map(|&member| self.vertex(member).clone())
                .collect();
            tracing::trace!(index, size = members.len(), "recalculate group");
            self.last_group = Some(members);

            return Some(Action {
                kind: ProcessAction::Recalculate,
                group,
            });
        }

        None
    }
}
