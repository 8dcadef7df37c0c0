//! Vertex Contracts
//!
//! Every kind of vertex (fields, calculations, and anything a consumer
//! builds on top of the engine) takes part in the graph through two small
//! traits.
//!
//! - [`Retainable`]: liveness hooks called by the engine's refcount table.
//! - [`Processable`]: handlers for the actions of a processing pass.
//!
//! Vertices are shared as [`VertexRef`] (`Rc<dyn Vertex>`) and identified by
//! a [`VertexKey`] that is never reused.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identity of a vertex.
///
/// Unlike the graph's arena slot, a key is never recycled, so it can be
/// held across the death and revival of a vertex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexKey(u64);

impl VertexKey {
    /// Generate a new unique key.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for VertexKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VertexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for VertexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Liveness hooks driven by [`Engine::retain`](super::Engine::retain) and
/// [`Engine::release`](super::Engine::release).
pub trait Retainable {
    /// Human readable name used in logs and graph exports.
    fn debug_name(&self) -> String;

    fn vertex_key(&self) -> VertexKey;

    /// Called exactly once per 0 -> 1 refcount transition. Registers the
    /// vertex with the graph.
    fn alive(&self);

    /// Called exactly once per 1 -> 0 refcount transition. Must drop every
    /// edge and retain the vertex owns.
    fn dead(&self);
}

/// Handlers for processing actions. A missing handler is a no-op.
pub trait Processable {
    /// Recompute. `group` holds every member of the vertex's cycle (or just
    /// the vertex). Returns the vertices to mark dirty next.
    fn recalculate(&self, _group: &[VertexRef]) -> Vec<VertexRef> {
        Vec::new()
    }

    /// The vertex joined a cycle. Returns the vertices to mark dirty next.
    fn cycle(&self) -> Vec<VertexRef> {
        Vec::new()
    }

    /// The vertex was marked dirty.
    fn invalidate(&self) {}
}

/// Anything that can sit in the graph.
pub trait Vertex: Retainable + Processable {}

impl<T: Retainable + Processable + ?Sized> Vertex for T {}

/// Shared handle to a vertex of any kind.
pub type VertexRef = Rc<dyn Vertex>;

/// Conversion accepted by every engine operation that takes a vertex.
pub trait AsVertex {
    fn key(&self) -> VertexKey;

    fn vertex(&self) -> VertexRef;
}

impl AsVertex for VertexRef {
    fn key(&self) -> VertexKey {
        self.vertex_key()
    }

    fn vertex(&self) -> VertexRef {
        Rc::clone(self)
    }
}
