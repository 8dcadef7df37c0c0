//! Field Implementation
//!
//! A Field is a mutable leaf value: the source of truth the rest of the
//! graph is computed from.
//!
//! # How Fields Work
//!
//! 1. Reading a field inside a tracked computation records it as a
//!    dependency of that computation.
//!
//! 2. Writing a different value marks the field dirty, but only while it is
//!    retained. An unobserved field is just a cell.
//!
//! 3. When the field is processed it wakes its direct subscribers and hands
//!    its dependents to the engine to be marked dirty.
//!
//! # Subscriber clocks
//!
//! Each write bumps a change clock (only while someone is subscribed), and
//! each subscriber remembers the clock it last saw. A burst of writes
//! between two flushes reaches a subscriber once, with the latest value,
//! and a subscriber that joined mid-burst is not told about writes it
//! already saw.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use super::contract::{AsVertex, Processable, Retainable, VertexKey, VertexRef};
use super::engine::Engine;
use super::subscriber::{Subscriber, Subscription};

struct FieldInner<T> {
    engine: Engine,
    key: VertexKey,
    this: Weak<FieldInner<T>>,
    name: RefCell<String>,
    value: RefCell<T>,
    clock: Cell<u64>,
    alive: Cell<bool>,
    /// Each subscriber with the clock it last saw.
    subscribers: RefCell<Vec<(Subscriber<T>, u64)>>,
}

/// A mutable value in the dependency graph.
///
/// # Example
///
/// ```rust
/// use ripple_core::reactive::Engine;
///
/// let engine = Engine::new();
/// let count = engine.field(1);
/// count.set(5);
/// assert_eq!(count.get(), 5);
/// ```
pub struct Field<T>
where
    T: Clone + PartialEq + 'static,
{
    inner: Rc<FieldInner<T>>,
}

impl<T> Field<T>
where
    T: Clone + PartialEq + 'static,
{
    /// Create a detached field. It joins the graph once retained.
    pub fn new(engine: &Engine, value: T) -> Self {
        let key = VertexKey::new();
        let inner = Rc::new_cyclic(|this| FieldInner {
            engine: engine.clone(),
            key,
            this: this.clone(),
            name: RefCell::new(format!("field:{key}")),
            value: RefCell::new(value),
            clock: Cell::new(0),
            alive: Cell::new(false),
            subscribers: RefCell::new(Vec::new()),
        });
        Self { inner }
    }

    /// Set the name shown in logs and graph exports.
    pub fn named(self, name: impl Into<String>) -> Self {
        *self.inner.name.borrow_mut() = name.into();
        self
    }

    /// Get the current value, recording the read if a tracker is active.
    pub fn get(&self) -> T {
        self.inner.engine.notify_read(&*self.inner);
        self.get_untracked()
    }

    /// Get the current value without establishing a dependency.
    pub fn get_untracked(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Replace the value. Equal values are ignored.
    pub fn set(&self, value: T) {
        let inner = &self.inner;
        if *inner.value.borrow() == value {
            return;
        }

        if !inner.subscribers.borrow().is_empty() {
            inner.clock.set(inner.clock.get() + 1);
        }
        *inner.value.borrow_mut() = value;
        tracing::trace!(field = %inner.name.borrow(), "field set");

        if inner.alive.get() {
            inner.engine.mark_dirty(&**inner);
        }
    }

    /// Set the value computed from the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.inner.value.borrow());
        self.set(next);
    }

    /// Call `handler` with the current value now and after every flush that
    /// changed it. The field stays retained until the subscription ends.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(T) + 'static,
    {
        let inner = &self.inner;
        inner.engine.retain(self);

        let subscriber = Subscriber::new(handler);
        let id = subscriber.id();
        subscriber.notify(self.get_untracked());
        inner
            .subscribers
            .borrow_mut()
            .push((subscriber, inner.clock.get()));

        let weak = Rc::downgrade(inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .subscribers
                    .borrow_mut()
                    .retain(|(subscriber, _)| subscriber.id() != id);
                inner.engine.release(&*inner);
            }
        })
    }

    pub fn key(&self) -> VertexKey {
        self.inner.key
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Whether the field is currently a vertex of the graph.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.get()
    }
}

impl<T> Clone for Field<T>
where
    T: Clone + PartialEq + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Field<T>
where
    T: Clone + PartialEq + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &*self.inner.name.borrow())
            .field("value", &*self.inner.value.borrow())
            .field("alive", &self.inner.alive.get())
            .finish()
    }
}

impl<T> AsVertex for Field<T>
where
    T: Clone + PartialEq + 'static,
{
    fn key(&self) -> VertexKey {
        self.inner.key
    }

    fn vertex(&self) -> VertexRef {
        self.inner.clone()
    }
}

impl<T> AsVertex for FieldInner<T>
where
    T: Clone + PartialEq + 'static,
{
    fn key(&self) -> VertexKey {
        self.key
    }

    fn vertex(&self) -> VertexRef {
        match self.this.upgrade() {
            Some(inner) => inner as VertexRef,
            None => unreachable!("field {} used while being dropped", self.key),
        }
    }
}

impl<T> Retainable for FieldInner<T>
where
    T: Clone + PartialEq + 'static,
{
    fn debug_name(&self) -> String {
        self.name.borrow().clone()
    }

    fn vertex_key(&self) -> VertexKey {
        self.key
    }

    fn alive(&self) {
        self.engine.add_vertex(self);
        self.alive.set(true);
    }

    fn dead(&self) {
        self.alive.set(false);
        self.engine.remove_vertex(self);
    }
}

impl<T> Processable for FieldInner<T>
where
    T: Clone + PartialEq + 'static,
{
    fn recalculate(&self, _group: &[VertexRef]) -> Vec<VertexRef> {
        let clock = self.clock.get();
        let due: Vec<Rc<dyn Fn(T)>> = self
            .subscribers
            .borrow_mut()
            .iter_mut()
            .filter(|(_, seen)| *seen < clock)
            .map(|(subscriber, seen)| {
                *seen = clock;
                subscriber.handler()
            })
            .collect();

        if !due.is_empty() {
            let value = self.value.borrow().clone();
            for handler in due {
                handler(value.clone());
            }
        }

        self.engine.forward_dependencies(self)
    }
}
