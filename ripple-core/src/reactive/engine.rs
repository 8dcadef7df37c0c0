//! Reactive Engine
//!
//! The engine is the central coordinator that connects fields,
//! calculations and any other vertex kind to the dependency graph.
//!
//! # How It Works
//!
//! 1. A vertex joins the graph when it is first retained (`alive`) and
//!    leaves it when its last retain is released (`dead`).
//!
//! 2. Reads made inside [`Engine::track_reads`] are recorded; the reader
//!    turns them into edges.
//!
//! 3. Marking a vertex dirty asks the scheduler for a flush. A flush pulls
//!    actions from the graph and dispatches them to the vertices until
//!    nothing is dirty:
//!    a. INVALIDATE as soon as a vertex is marked dirty
//!    b. CYCLE when a vertex joins a cycle
//!    c. RECALCULATE in topological order; whatever the vertex returns is
//!       marked dirty in turn
//!
//! # Ownership
//!
//! `Engine` is a cheap handle around shared state. The graph and the vertex
//! table hold only keys and weak references; strong references live in the
//! retained table, in calculations' dependency sets and in subscriptions.
//! Graph callbacks never run while the graph is borrowed, so a callback may
//! freely add edges, retain vertices or mark them dirty.

use std::cell::{Cell, RefCell};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::config::{EngineConfig, FlushMode};
use crate::graph::{Action, EdgeKind, Graph, ProcessAction, VertexBits};

use super::calc::Calculation;
use super::context::{ContextStack, ReadSet};
use super::contract::{AsVertex, Vertex, VertexKey, VertexRef};
use super::debug::{DebugEdge, DebugGraph, DebugVertex};
use super::error::CalcResult;
use super::field::Field;
use super::flush::{FlushTask, ImmediateScheduler, LocalTaskScheduler, ManualScheduler, Scheduler};
use super::subscriber::{Subscriber, Subscription};

struct Retained {
    count: usize,
    vertex: VertexRef,
}

struct EngineInner {
    config: EngineConfig,
    graph: RefCell<Graph<VertexKey>>,
    vertices: RefCell<HashMap<VertexKey, Weak<dyn Vertex>>>,
    context: ContextStack,
    retained: RefCell<HashMap<VertexKey, Retained>>,
    scheduler: RefCell<Rc<dyn Scheduler>>,
    flush_pending: Cell<bool>,
    flushing: Cell<bool>,
    reflush: Cell<bool>,
    debug_subscribers: RefCell<Vec<Subscriber<Rc<DebugGraph>>>>,
}

/// Handle to an engine. Clones share the same graph.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

impl Engine {
    /// Create an engine with the default configuration (manual flushing).
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let scheduler: Rc<dyn Scheduler> = match config.flush {
            FlushMode::Manual => Rc::new(ManualScheduler),
            FlushMode::Immediate => Rc::new(ImmediateScheduler),
            FlushMode::LocalTask => Rc::new(LocalTaskScheduler),
        };
        tracing::debug!(engine = %config.label, flush = ?config.flush, "engine created");

        Self {
            inner: Rc::new(EngineInner {
                config,
                graph: RefCell::new(Graph::new()),
                vertices: RefCell::new(HashMap::new()),
                context: ContextStack::default(),
                retained: RefCell::new(HashMap::new()),
                scheduler: RefCell::new(scheduler),
                flush_pending: Cell::new(false),
                flushing: Cell::new(false),
                reflush: Cell::new(false),
                debug_subscribers: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Shorthand for [`Field::new`].
    pub fn field<T>(&self, value: T) -> Field<T>
    where
        T: Clone + PartialEq + 'static,
    {
        Field::new(self, value)
    }

    /// Shorthand for [`Calculation::new`].
    pub fn calc<T, F>(&self, func: F) -> Calculation<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn() -> CalcResult<T> + 'static,
    {
        Calculation::new(self, func)
    }

    // ---- Liveness ----

    /// Increment the refcount; the first retain brings the vertex alive.
    pub fn retain(&self, vertex: &impl AsVertex) {
        let key = vertex.key();
        let revived = {
            let mut retained = self.inner.retained.borrow_mut();
            match retained.entry(key) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().count += 1;
                    None
                }
                Entry::Vacant(entry) => {
                    let strong = vertex.vertex();
                    entry.insert(Retained {
                        count: 1,
                        vertex: Rc::clone(&strong),
                    });
                    Some(strong)
                }
            }
        };

        tracing::trace!(vertex = %key, "retained");
        if let Some(vertex) = revived {
            vertex.alive();
        }
    }

    /// Decrement the refcount; the last release kills the vertex.
    ///
    /// Panics if the vertex is not retained.
    pub fn release(&self, vertex: &impl AsVertex) {
        let key = vertex.key();
        let dead = {
            let mut retained = self.inner.retained.borrow_mut();
            let remaining = retained.get_mut(&key).map(|entry| {
                entry.count -= 1;
                entry.count
            });
            let Some(remaining) = remaining else {
                panic!(
                    "released vertex {} ({key}) that is not retained",
                    vertex.vertex().debug_name()
                );
            };
            if remaining == 0 {
                retained.remove(&key).map(|entry| entry.vertex)
            } else {
                None
            }
        };

        tracing::trace!(vertex = %key, "released");
        if let Some(vertex) = dead {
            vertex.dead();
        }
    }

    pub fn refcount(&self, vertex: &impl AsVertex) -> usize {
        self.inner
            .retained
            .borrow()
            .get(&vertex.key())
            .map_or(0, |entry| entry.count)
    }

    pub fn is_retained(&self, vertex: &impl AsVertex) -> bool {
        self.refcount(vertex) > 0
    }

    // ---- Graph ----

    pub fn add_vertex(&self, vertex: &impl AsVertex) {
        let key = vertex.key();
        self.inner.graph.borrow_mut().add_vertex(key);
        self.inner
            .vertices
            .borrow_mut()
            .insert(key, Rc::downgrade(&vertex.vertex()));
    }

    pub fn remove_vertex(&self, vertex: &impl AsVertex) {
        let key = vertex.key();
        self.inner.graph.borrow_mut().remove_vertex(&key);
        self.inner.vertices.borrow_mut().remove(&key);
    }

    /// Add a hard edge: `to` depends on `from`.
    pub fn add_edge(&self, from: &impl AsVertex, to: &impl AsVertex) {
        let (from, to) = (from.key(), to.key());
        self.mutate_graph(|graph| graph.add_edge(&from, &to));
    }

    pub fn remove_edge(&self, from: &impl AsVertex, to: &impl AsVertex) {
        let (from, to) = (from.key(), to.key());
        self.mutate_graph(|graph| graph.remove_edge(&from, &to));
    }

    /// Add an ordering-only edge.
    pub fn add_soft_edge(&self, from: &impl AsVertex, to: &impl AsVertex) {
        let (from, to) = (from.key(), to.key());
        self.mutate_graph(|graph| graph.add_soft_edge(&from, &to));
    }

    pub fn remove_soft_edge(&self, from: &impl AsVertex, to: &impl AsVertex) {
        let (from, to) = (from.key(), to.key());
        self.mutate_graph(|graph| graph.remove_soft_edge(&from, &to));
    }

    /// Mark a vertex dirty, invalidate it right away and schedule a flush.
    pub fn mark_dirty(&self, vertex: &impl AsVertex) {
        let key = vertex.key();
        self.mutate_graph(|graph| graph.mark_dirty(&key));
    }

    pub fn unmark_dirty(&self, vertex: &impl AsVertex) {
        self.inner.graph.borrow_mut().unmark_dirty(&vertex.key());
    }

    pub fn mark_cycle_informed(&self, vertex: &impl AsVertex) {
        self.inner
            .graph
            .borrow_mut()
            .mark_cycle_informed(&vertex.key());
    }

    /// Vertices a change of `vertex` should dirty next.
    pub fn forward_dependencies(&self, vertex: &impl AsVertex) -> Vec<VertexRef> {
        let keys = self
            .inner
            .graph
            .borrow()
            .forward_dependencies(&vertex.key());
        keys.iter().filter_map(|key| self.lookup(key)).collect()
    }

    pub fn contains(&self, vertex: &impl AsVertex) -> bool {
        self.inner.graph.borrow().contains(&vertex.key())
    }

    pub fn vertex_count(&self) -> usize {
        self.inner.graph.borrow().len()
    }

    pub fn vertex_bits(&self, vertex: &impl AsVertex) -> VertexBits {
        self.inner.graph.borrow().bits(&vertex.key())
    }

    pub fn is_dirty(&self, vertex: &impl AsVertex) -> bool {
        self.vertex_bits(vertex).is_dirty()
    }

    // ---- Read tracking ----

    /// Run `f`, recording every vertex it reads.
    pub fn track_reads<R>(&self, f: impl FnOnce() -> R) -> (R, ReadSet) {
        let guard = self.inner.context.enter(true);
        let value = f();
        (value, guard.finish())
    }

    /// Run `f` without recording its reads, even inside a tracked call.
    pub fn untrack_reads<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.inner.context.enter(false);
        f()
    }

    /// Called by a vertex when it is read. Returns whether the read was
    /// recorded by an active tracker.
    pub fn notify_read(&self, vertex: &impl AsVertex) -> bool {
        self.inner.context.record(vertex.key(), || vertex.vertex())
    }

    pub fn is_tracking(&self) -> bool {
        self.inner.context.is_tracking()
    }

    // ---- Flushing ----

    /// Install the scheduler that decides when pending flushes run.
    pub fn subscribe(&self, scheduler: impl Scheduler + 'static) {
        *self.inner.scheduler.borrow_mut() = Rc::new(scheduler);
    }

    /// Process every dirty vertex to quiescence.
    ///
    /// A call made while a flush is running only asks the running flush to
    /// go around once more.
    pub fn flush(&self) {
        let inner = &self.inner;
        if inner.flushing.get() {
            inner.reflush.set(true);
            return;
        }

        let flushing = FlushGuard::enter(&inner.flushing);
        tracing::debug!(engine = %inner.config.label, "flush started");
        loop {
            inner.flush_pending.set(false);
            inner.reflush.set(false);
            // A flush started from inside a tracked body must not leak the
            // reads it makes into that body.
            self.untrack_reads(|| self.process());
            if !inner.reflush.get() {
                break;
            }
        }
        drop(flushing);
        tracing::debug!(engine = %inner.config.label, "flush finished");

        self.notify_debug_subscribers();
    }

    /// Whether a flush has been requested and has not run yet.
    pub fn has_pending_flush(&self) -> bool {
        self.inner.flush_pending.get()
    }

    fn schedule_flush(&self) {
        let inner = &self.inner;
        if inner.flushing.get() || inner.flush_pending.replace(true) {
            return;
        }

        let weak = Rc::downgrade(inner);
        let task = FlushTask::new(move || {
            if let Some(inner) = weak.upgrade() {
                Engine { inner }.flush();
            }
        });
        let scheduler = Rc::clone(&inner.scheduler.borrow());
        scheduler.schedule(task);
    }

    fn process(&self) {
        loop {
            let action = self.inner.graph.borrow_mut().next_action();
            match action {
                Some(action) => self.dispatch(action),
                None => break,
            }
        }
    }

    /// Apply a graph change, dispatch what it fired and schedule a flush if
    /// it dirtied anything.
    fn mutate_graph<R>(&self, f: impl FnOnce(&mut Graph<VertexKey>) -> R) -> R {
        let result = f(&mut self.inner.graph.borrow_mut());
        if self.drain_immediate() {
            self.schedule_flush();
        }
        result
    }

    /// Dispatch the INVALIDATE and CYCLE actions a graph change fired.
    /// Returns whether any vertex was invalidated.
    fn drain_immediate(&self) -> bool {
        let mut dirtied = false;
        loop {
            let action = self.inner.graph.borrow_mut().next_immediate();
            match action {
                Some(action) => {
                    dirtied |= action.kind == ProcessAction::Invalidate;
                    self.dispatch(action);
                }
                None => return dirtied,
            }
        }
    }

    fn dispatch(&self, action: Action<VertexKey>) {
        tracing::trace!(kind = ?action.kind, group = ?action.group, "dispatch");
        let group: Vec<VertexRef> = action
            .group
            .iter()
            .filter_map(|key| self.lookup(key))
            .collect();

        match action.kind {
            ProcessAction::Invalidate => {
                for vertex in &group {
                    vertex.invalidate();
                }
            }
            ProcessAction::Cycle => {
                for vertex in &group {
                    let next = vertex.cycle();
                    self.mark_all_dirty(next);
                }
            }
            ProcessAction::Recalculate => {
                for vertex in &group {
                    let next = vertex.recalculate(&group);
                    self.mark_all_dirty(next);
                }
            }
        }
    }

    fn mark_all_dirty(&self, vertices: Vec<VertexRef>) {
        for vertex in vertices {
            // A callback may have killed the vertex it returns.
            if !self.contains(&vertex) {
                tracing::trace!(vertex = %vertex.key(), "skipping dirty mark of dead vertex");
                continue;
            }
            self.mark_dirty(&vertex);
        }
    }

    fn lookup(&self, key: &VertexKey) -> Option<VertexRef> {
        self.inner.vertices.borrow().get(key).and_then(Weak::upgrade)
    }

    // ---- Diagnostics ----

    /// Snapshot of the graph in topological order.
    pub fn debug_get_graph(&self) -> DebugGraph {
        let graph = self.inner.graph.borrow();
        let vertices = graph
            .vertices()
            .map(|key| {
                let bits = graph.bits(key);
                DebugVertex {
                    id: key.as_u64(),
                    index: graph.topological_index(key),
                    label: self.label_of(key),
                    dirty: bits.is_dirty(),
                    cycle: bits.in_any_cycle(),
                }
            })
            .collect();
        let edges = graph
            .edges()
            .map(|(from, to, kind)| DebugEdge {
                from: from.as_u64(),
                to: to.as_u64(),
                hard: kind.contains(EdgeKind::HARD),
                soft: kind.contains(EdgeKind::SOFT),
            })
            .collect();

        DebugGraph {
            label: self.inner.config.label.clone(),
            vertices,
            edges,
        }
    }

    /// The graph as Graphviz DOT.
    pub fn debug(&self) -> String {
        self.debug_get_graph().to_dot()
    }

    /// Receive a graph snapshot after every completed flush.
    pub fn debug_subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&DebugGraph) + 'static,
    {
        let subscriber = Subscriber::new(move |graph: Rc<DebugGraph>| handler(&graph));
        let id = subscriber.id();
        self.inner.debug_subscribers.borrow_mut().push(subscriber);

        let weak = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .debug_subscribers
                    .borrow_mut()
                    .retain(|subscriber| subscriber.id() != id);
            }
        })
    }

    fn notify_debug_subscribers(&self) {
        let handlers: Vec<_> = self
            .inner
            .debug_subscribers
            .borrow()
            .iter()
            .map(Subscriber::handler)
            .collect();
        if handlers.is_empty() {
            return;
        }

        let snapshot = Rc::new(self.debug_get_graph());
        for handler in handlers {
            handler(Rc::clone(&snapshot));
        }
    }

    fn label_of(&self, key: &VertexKey) -> String {
        self.lookup(key)
            .map(|vertex| vertex.debug_name())
            .unwrap_or_else(|| key.to_string())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("label", &self.inner.config.label)
            .field("vertices", &self.vertex_count())
            .field("flushing", &self.inner.flushing.get())
            .finish()
    }
}

/// Clears the flushing flag even if a callback panics.
struct FlushGuard<'a>(&'a Cell<bool>);

impl<'a> FlushGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}
