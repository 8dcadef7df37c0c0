//! Read Tracking Context
//!
//! The context stack records which vertices a computation reads. Reading a
//! field or calculation while a tracking entry is on top of the stack adds
//! the vertex to that entry's read set; the owner of the entry turns the
//! read set into graph edges once the computation returns.
//!
//! # Implementation
//!
//! The stack lives in the engine rather than in a thread-local, so separate
//! engines never see each other's reads. Entering pushes an entry and
//! returns a guard; the guard pops the entry when finished or dropped, so
//! the stack stays balanced even if the computation panics.
//!
//! Untracked entries shadow the tracking entry below them: reads made while
//! an untracked entry is on top are not recorded anywhere.

use std::cell::RefCell;

use indexmap::IndexMap;

use super::contract::{VertexKey, VertexRef};

/// Vertices read by one computation, in first-read order.
pub type ReadSet = IndexMap<VertexKey, VertexRef>;

struct ContextEntry {
    tracking: bool,
    reads: ReadSet,
}

/// Stack of active read trackers.
#[derive(Default)]
pub(crate) struct ContextStack {
    entries: RefCell<Vec<ContextEntry>>,
}

impl ContextStack {
    /// Push a new entry. Reads are recorded only if `tracking` is set.
    pub fn enter(&self, tracking: bool) -> ContextGuard<'_> {
        let mut entries = self.entries.borrow_mut();
        entries.push(ContextEntry {
            tracking,
            reads: ReadSet::new(),
        });
        ContextGuard {
            stack: self,
            depth: entries.len(),
            finished: false,
        }
    }

    /// Whether reads are currently being recorded.
    pub fn is_tracking(&self) -> bool {
        self.entries
            .borrow()
            .last()
            .map_or(false, |entry| entry.tracking)
    }

    /// Record a read in the top entry. Returns whether it was recorded.
    pub fn record(&self, key: VertexKey, vertex: impl FnOnce() -> VertexRef) -> bool {
        let mut entries = self.entries.borrow_mut();
        match entries.last_mut() {
            Some(entry) if entry.tracking => {
                entry.reads.entry(key).or_insert_with(vertex);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub fn depth(&self) -> usize {
        self.entries.borrow().len()
    }

    fn pop(&self, depth: usize) -> ReadSet {
        let mut entries = self.entries.borrow_mut();
        debug_assert_eq!(
            entries.len(),
            depth,
            "read context mismatch: expected depth {depth}, got {}",
            entries.len()
        );
        entries.pop().map(|entry| entry.reads).unwrap_or_default()
    }
}

/// Guard that pops its context entry when finished or dropped.
pub(crate) struct ContextGuard<'a> {
    stack: &'a ContextStack,
    depth: usize,
    finished: bool,
}

impl ContextGuard<'_> {
    /// Pop the entry and hand back what it recorded.
    pub fn finish(mut self) -> ReadSet {
        self.finished = true;
        self.stack.pop(self.depth)
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.stack.pop(self.depth);
        }
    }
}
