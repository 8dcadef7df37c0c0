//! Calculation Implementation
//!
//! A Calculation is a cached derived value that re-evaluates only when
//! something it read on its last run changes.
//!
//! # How Calculations Work
//!
//! 1. A detached (unretained) calculation is a plain function: every `get`
//!    runs the body and nothing is cached.
//!
//! 2. Once retained, the first `get` runs the body inside a read tracker.
//!    Every vertex the body read becomes a dependency: it is retained and
//!    gets an edge to the calculation. Vertices read on an earlier run but
//!    not on this one lose their edge and are released, so only the path
//!    actually taken is tracked.
//!
//! 3. When a dependency changes, the engine invalidates the calculation and
//!    later asks it to recalculate. If the new result equals the old one
//!    (per the comparator) the old result is kept and dependents are left
//!    alone.
//!
//! # Cycles
//!
//! Reading a calculation while its own body is running is a cycle. The
//! read yields [`CalcError::Cycle`] tagged with the re-entered calculation,
//! its origin. The error passes through every calculation in between
//! untouched; only the origin may turn it into its error handler's value
//! once its own body returns.
//!
//! Once the graph has seen the edges closing the loop every member of the
//! cycle receives a CYCLE action. A member with an error handler settles on
//! the handler's value; a member already holding a cycle error keeps it;
//! any other member settles on a cycle error of its own.
//!
//! # State machine
//!
//! ```text
//! DEAD --alive--> READY --get/recalculate--> CALLING --> CACHED | ERROR
//!                   ^                                        |
//!                   +---------------invalidate---------------+
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use super::context::ReadSet;
use super::contract::{AsVertex, Processable, Retainable, VertexKey, VertexRef};
use super::engine::Engine;
use super::error::{CalcError, CalcResult};
use super::subscriber::{Subscriber, Subscription};

/// Observable state of a calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalcState {
    /// Not retained; not in the graph.
    Dead,

    /// In the graph, with no usable cached result.
    Ready,

    /// The body is running.
    Calling,

    /// Holds a value.
    Cached,

    /// Holds an error.
    Error,
}

enum Slot<T> {
    Dead,
    /// Keeps the invalidated result to compare the next one against.
    Ready(Option<CalcResult<T>>),
    Calling,
    Settled(CalcResult<T>),
}

type ErrorHandler<T> = Rc<dyn Fn(&CalcError) -> T>;
type Comparator<T> = Rc<dyn Fn(&T, &T) -> bool>;

struct CalcInner<T> {
    engine: Engine,
    key: VertexKey,
    this: Weak<CalcInner<T>>,
    name: RefCell<String>,
    func: Box<dyn Fn() -> CalcResult<T>>,
    slot: RefCell<Slot<T>>,
    /// The settled result differs from the one dependents last saw.
    changed: Cell<bool>,
    /// An invalidation arrived while the body was running.
    invalidated_while_calling: Cell<bool>,
    /// Guards the body of a detached calculation against re-entry.
    detached_calling: Cell<bool>,
    on_error: RefCell<Option<ErrorHandler<T>>>,
    cmp: RefCell<Comparator<T>>,
    dependencies: RefCell<ReadSet>,
    subscribers: RefCell<Vec<Subscriber<CalcResult<T>>>>,
}

/// A lazily evaluated, memoized value derived from other vertices.
///
/// # Example
///
/// ```rust
/// use ripple_core::reactive::{Engine, Calculation};
///
/// let engine = Engine::new();
/// let a = engine.field(1);
/// let b = {
///     let a = a.clone();
///     Calculation::new(&engine, move || Ok(a.get() * 2))
/// };
/// engine.retain(&b);
///
/// assert_eq!(b.get(), Ok(2));
/// a.set(5);
/// assert_eq!(b.get(), Ok(2));
/// engine.flush();
/// assert_eq!(b.get(), Ok(10));
/// ```
pub struct Calculation<T>
where
    T: Clone + PartialEq + 'static,
{
    inner: Rc<CalcInner<T>>,
}

impl<T> Calculation<T>
where
    T: Clone + PartialEq + 'static,
{
    /// Create a detached calculation. The body is not run until read.
    pub fn new<F>(engine: &Engine, func: F) -> Self
    where
        F: Fn() -> CalcResult<T> + 'static,
    {
        let key = VertexKey::new();
        let inner = Rc::new_cyclic(|this| CalcInner {
            engine: engine.clone(),
            key,
            this: this.clone(),
            name: RefCell::new(format!("calc:{key}")),
            func: Box::new(func),
            slot: RefCell::new(Slot::Dead),
            changed: Cell::new(false),
            invalidated_while_calling: Cell::new(false),
            detached_calling: Cell::new(false),
            on_error: RefCell::new(None),
            cmp: RefCell::new(Rc::new(|a: &T, b: &T| a == b)),
            dependencies: RefCell::new(ReadSet::new()),
            subscribers: RefCell::new(Vec::new()),
        });
        Self { inner }
    }

    /// Set the name shown in logs and graph exports.
    pub fn named(self, name: impl Into<String>) -> Self {
        *self.inner.name.borrow_mut() = name.into();
        self
    }

    /// Recover from errors and cycles with `handler`'s value.
    pub fn on_error<F>(self, handler: F) -> Self
    where
        F: Fn(&CalcError) -> T + 'static,
    {
        self.set_error_handler(handler);
        self
    }

    /// Install an error handler. A live calculation is marked dirty so its
    /// current error can be replaced.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&CalcError) -> T + 'static,
    {
        *self.inner.on_error.borrow_mut() = Some(Rc::new(handler));
        if self.is_alive() {
            self.inner.engine.mark_dirty(&*self.inner);
        }
    }

    /// Replace the equality used to decide whether a new result is a change.
    pub fn set_cmp<F>(self, cmp: F) -> Self
    where
        F: Fn(&T, &T) -> bool + 'static,
    {
        *self.inner.cmp.borrow_mut() = Rc::new(cmp);
        self
    }

    /// Get the value, running the body if nothing is cached.
    ///
    /// Inside a tracked computation the read is recorded as a dependency.
    pub fn get(&self) -> CalcResult<T> {
        let inner = &*self.inner;
        inner.engine.notify_read(inner);
        inner.read()
    }

    /// Call `handler` with the current result now and whenever a flush
    /// changes it. The calculation stays retained until the subscription
    /// ends.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(CalcResult<T>) + 'static,
    {
        let inner = &self.inner;
        inner.engine.retain(self);

        let subscriber = Subscriber::new(handler);
        let id = subscriber.id();
        subscriber.notify(inner.engine.untrack_reads(|| inner.read()));
        inner.subscribers.borrow_mut().push(subscriber);

        let weak = Rc::downgrade(inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .subscribers
                    .borrow_mut()
                    .retain(|subscriber| subscriber.id() != id);
                inner.engine.release(&*inner);
            }
        })
    }

    pub fn state(&self) -> CalcState {
        self.inner.state()
    }

    /// Whether the calculation is currently a vertex of the graph.
    pub fn is_alive(&self) -> bool {
        self.state() != CalcState::Dead
    }

    pub fn key(&self) -> VertexKey {
        self.inner.key
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }
}

impl<T> Clone for Calculation<T>
where
    T: Clone + PartialEq + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Calculation<T>
where
    T: Clone + PartialEq + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Calculation")
            .field("name", &*self.inner.name.borrow())
            .field("state", &self.state())
            .finish()
    }
}

impl<T> CalcInner<T>
where
    T: Clone + PartialEq + 'static,
{
    fn state(&self) -> CalcState {
        match &*self.slot.borrow() {
            Slot::Dead => CalcState::Dead,
            Slot::Ready(_) => CalcState::Ready,
            Slot::Calling => CalcState::Calling,
            Slot::Settled(Ok(_)) => CalcState::Cached,
            Slot::Settled(Err(_)) => CalcState::Error,
        }
    }

    fn read(&self) -> CalcResult<T> {
        let mut slot = self.slot.borrow_mut();
        match std::mem::replace(&mut *slot, Slot::Calling) {
            Slot::Settled(result) => {
                *slot = Slot::Settled(result.clone());
                result
            }
            Slot::Ready(previous) => {
                drop(slot);
                self.execute(previous)
            }
            Slot::Calling => {
                drop(slot);
                tracing::debug!(calculation = %self.name.borrow(), "calculation re-entered");
                Err(CalcError::Cycle { origin: self.key })
            }
            Slot::Dead => {
                *slot = Slot::Dead;
                drop(slot);
                self.call_detached()
            }
        }
    }

    /// Run the body without caching. Reads land in the caller's tracker.
    fn call_detached(&self) -> CalcResult<T> {
        if self.detached_calling.replace(true) {
            return Err(CalcError::Cycle { origin: self.key });
        }
        let outcome = (self.func)();
        self.detached_calling.set(false);
        outcome.or_else(|error| self.absorb(error))
    }

    /// Run the body tracked and settle the result. The slot is `Calling`.
    fn execute(&self, previous: Option<CalcResult<T>>) -> CalcResult<T> {
        tracing::trace!(calculation = %self.name.borrow(), "executing");
        let (outcome, reads) = self.engine.track_reads(|| (self.func)());
        let outcome = outcome.or_else(|error| self.absorb(error));

        if !matches!(*self.slot.borrow(), Slot::Calling) {
            tracing::debug!(
                calculation = %self.name.borrow(),
                "calculation died while running"
            );
            return outcome;
        }

        let result = self.settle(previous, outcome);
        self.update_dependencies(reads);

        if self.invalidated_while_calling.replace(false) {
            self.invalidate();
            self.engine.mark_dirty(self);
        }
        result
    }

    /// Handle an error raised by this calculation's body. A cycle that
    /// started at another calculation passes through unchanged.
    fn absorb(&self, error: CalcError) -> CalcResult<T> {
        match error.cycle_origin() {
            Some(origin) if origin != self.key => Err(error),
            _ => self.recover(error),
        }
    }

    /// Turn an error into the handler's value, read untracked.
    fn recover(&self, error: CalcError) -> CalcResult<T> {
        let handler = self.on_error.borrow().clone();
        match handler {
            Some(handler) => Ok(self.engine.untrack_reads(|| handler(&error))),
            None => Err(error),
        }
    }

    /// Store `outcome`, keeping `previous` instead when they are equal.
    fn settle(&self, previous: Option<CalcResult<T>>, outcome: CalcResult<T>) -> CalcResult<T> {
        let result = match previous {
            Some(previous) if self.same(&previous, &outcome) => previous,
            Some(_) => {
                self.changed.set(true);
                outcome
            }
            None => outcome,
        };
        *self.slot.borrow_mut() = Slot::Settled(result.clone());
        result
    }

    fn same(&self, a: &CalcResult<T>, b: &CalcResult<T>) -> bool {
        match (a, b) {
            (Ok(a), Ok(b)) => {
                let cmp = Rc::clone(&self.cmp.borrow());
                cmp(a, b)
            }
            (Err(a), Err(b)) => a == b,
            _ => false,
        }
    }

    /// Diff the new read set against the old one, adding edges and retains
    /// for new dependencies and dropping them for stale ones.
    fn update_dependencies(&self, reads: ReadSet) {
        let previous = std::mem::take(&mut *self.dependencies.borrow_mut());

        for (key, dependency) in &reads {
            if previous.contains_key(key) {
                continue;
            }
            // A self-read is an edge, not a retain; retaining would keep
            // the calculation alive forever.
            if *key != self.key {
                self.engine.retain(dependency);
            }
            self.engine.add_edge(dependency, self);
        }

        for (key, dependency) in &previous {
            if reads.contains_key(key) {
                continue;
            }
            self.engine.remove_edge(dependency, self);
            if *key != self.key {
                self.engine.release(dependency);
            }
        }

        *self.dependencies.borrow_mut() = reads;
    }

    /// Hand a changed `result` to subscribers and dependents, once.
    fn propagate(&self, result: CalcResult<T>) -> Vec<VertexRef> {
        if !self.changed.replace(false) {
            return Vec::new();
        }

        let handlers: Vec<_> = self
            .subscribers
            .borrow()
            .iter()
            .map(Subscriber::handler)
            .collect();
        self.engine.untrack_reads(|| {
            for handler in handlers {
                handler(result.clone());
            }
        });

        self.engine.forward_dependencies(self)
    }
}

impl<T> AsVertex for Calculation<T>
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

impl<T> AsVertex for CalcInner<T>
where
    T: Clone + PartialEq + 'static,
{
    fn key(&self) -> VertexKey {
        self.key
    }

    fn vertex(&self) -> VertexRef {
        match self.this.upgrade() {
            Some(inner) => inner as VertexRef,
            None => unreachable!("calculation {} used while being dropped", self.key),
        }
    }
}

impl<T> Retainable for CalcInner<T>
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
        *self.slot.borrow_mut() = Slot::Ready(None);
    }

    fn dead(&self) {
        let dependencies = std::mem::take(&mut *self.dependencies.borrow_mut());
        for (key, dependency) in &dependencies {
            self.engine.remove_edge(dependency, self);
            if *key != self.key {
                self.engine.release(dependency);
            }
        }
        self.engine.remove_vertex(self);

        *self.slot.borrow_mut() = Slot::Dead;
        self.changed.set(false);
        self.invalidated_while_calling.set(false);
    }
}

impl<T> Processable for CalcInner<T>
where
    T: Clone + PartialEq + 'static,
{
    fn recalculate(&self, _group: &[VertexRef]) -> Vec<VertexRef> {
        match self.state() {
            CalcState::Dead => return Vec::new(),
            CalcState::Calling => {
                tracing::warn!(
                    calculation = %self.name.borrow(),
                    "recalculation requested while the calculation is running"
                );
                return Vec::new();
            }
            CalcState::Ready | CalcState::Cached | CalcState::Error => {}
        }
        let result = self.read();
        self.propagate(result)
    }

    fn cycle(&self) -> Vec<VertexRef> {
        let taken = std::mem::replace(&mut *self.slot.borrow_mut(), Slot::Calling);
        let previous = match taken {
            Slot::Settled(result) => Some(result),
            Slot::Ready(previous) => previous,
            other => {
                *self.slot.borrow_mut() = other;
                return Vec::new();
            }
        };

        tracing::debug!(calculation = %self.name.borrow(), "calculation is part of a cycle");
        let has_handler = self.on_error.borrow().is_some();
        let outcome = match &previous {
            Some(Err(error)) if error.is_cycle() && !has_handler => Err(error.clone()),
            _ => self.recover(CalcError::Cycle { origin: self.key }),
        };
        let result = self.settle(previous, outcome);
        self.propagate(result)
    }

    fn invalidate(&self) {
        let mut slot = self.slot.borrow_mut();
        match std::mem::replace(&mut *slot, Slot::Dead) {
            Slot::Settled(result) => *slot = Slot::Ready(Some(result)),
            Slot::Calling => {
                *slot = Slot::Calling;
                self.invalidated_while_calling.set(true);
            }
            other => *slot = other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
        let count = Rc::new(Cell::new(0));
        (count.clone(), count)
    }

    #[test]
    fn detached_calculation_runs_every_time() {
        let engine = Engine::new();
        let (runs, runs_clone) = counter();
        let calc = engine.calc(move || {
            runs_clone.set(runs_clone.get() + 1);
            Ok(1)
        });

        assert_eq!(calc.get(), Ok(1));
        assert_eq!(calc.get(), Ok(1));
        assert_eq!(runs.get(), 2);
        assert_eq!(calc.state(), CalcState::Dead);
    }

    #[test]
    fn retained_calculation_caches() {
        let engine = Engine::new();
        let (runs, runs_clone) = counter();
        let calc = engine.calc(move || {
            runs_clone.set(runs_clone.get() + 1);
            Ok("value".to_string())
        });
        engine.retain(&calc);
        assert_eq!(calc.state(), CalcState::Ready);

        assert_eq!(calc.get(), Ok("value".to_string()));
        assert_eq!(calc.get(), Ok("value".to_string()));
        assert_eq!(runs.get(), 1);
        assert_eq!(calc.state(), CalcState::Cached);

        engine.release(&calc);
        assert_eq!(calc.state(), CalcState::Dead);
        assert!(!engine.contains(&calc));
    }

    #[test]
    fn errors_are_cached_until_invalidated() {
        let engine = Engine::new();
        let (runs, runs_clone) = counter();
        let calc: Calculation<i32> = engine.calc(move || {
            runs_clone.set(runs_clone.get() + 1);
            Err(CalcError::msg("nope"))
        });
        engine.retain(&calc);

        let first = calc.get().unwrap_err();
        let second = calc.get().unwrap_err();
        assert_eq!(first, second);
        assert_eq!(runs.get(), 1);
        assert_eq!(calc.state(), CalcState::Error);

        engine.mark_dirty(&calc);
        assert_eq!(calc.state(), CalcState::Ready);
        engine.flush();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn error_handler_supplies_a_value() {
        let engine = Engine::new();
        let calc = engine
            .calc(|| Err(CalcError::msg("nope")))
            .on_error(|error| format!("recovered from {error}"));
        engine.retain(&calc);

        assert_eq!(calc.get(), Ok("recovered from nope".to_string()));
    }

    #[test]
    fn reads_become_edges_and_retains() {
        let engine = Engine::new();
        let a = engine.field(1).named("a");
        let calc = {
            let a = a.clone();
            engine.calc(move || Ok(a.get() + 1)).named("calc")
        };
        engine.retain(&calc);
        calc.get().unwrap();

        assert!(a.is_alive());
        assert_eq!(engine.refcount(&a), 1);
        let graph = engine.debug_get_graph();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].from, a.key().as_u64());
        assert_eq!(graph.edges[0].to, calc.key().as_u64());

        engine.release(&calc);
        assert!(!a.is_alive());
        assert_eq!(engine.vertex_count(), 0);
    }

    #[test]
    fn self_read_is_a_cycle() {
        let engine = Engine::new();
        let slot: Rc<RefCell<Option<Calculation<i32>>>> = Rc::default();
        let slot_clone = slot.clone();
        let calc = engine.calc(move || match slot_clone.borrow().as_ref() {
            Some(me) => me.get().map(|value| value + 1),
            None => Ok(0),
        });
        *slot.borrow_mut() = Some(calc.clone());
        engine.retain(&calc);

        let error = calc.get().unwrap_err();
        assert_eq!(error.cycle_origin(), Some(calc.key()));
        assert!(engine.vertex_bits(&calc).is_self_cycle());

        // The self-edge holds no retain.
        assert_eq!(engine.refcount(&calc), 1);
        slot.borrow_mut().take();
        engine.release(&calc);
        assert_eq!(engine.vertex_count(), 0);
    }

    #[test]
    fn detached_self_read_is_a_cycle() {
        let engine = Engine::new();
        let slot: Rc<RefCell<Option<Calculation<i32>>>> = Rc::default();
        let slot_clone = slot.clone();
        let calc = engine.calc(move || match slot_clone.borrow().as_ref() {
            Some(me) => me.get(),
            None => Ok(0),
        });
        *slot.borrow_mut() = Some(calc.clone());

        assert!(calc.get().unwrap_err().is_cycle());
        slot.borrow_mut().take();
    }

    #[test]
    fn handler_ignores_cycles_started_elsewhere() {
        let engine = Engine::new();
        let slot: Rc<RefCell<Option<Calculation<i32>>>> = Rc::default();
        let b = {
            let slot = slot.clone();
            engine
                .calc(move || match slot.borrow().as_ref() {
                    Some(a) => a.get(),
                    None => Ok(0),
                })
                .on_error(|_| -1)
        };
        let a = {
            let b = b.clone();
            engine.calc(move || b.get())
        };
        *slot.borrow_mut() = Some(a.clone());
        engine.retain(&a);

        // The cycle started at `a`, so `b` hands the error on untouched.
        assert_eq!(a.get().unwrap_err().cycle_origin(), Some(a.key()));
        assert_eq!(b.get().unwrap_err().cycle_origin(), Some(a.key()));

        // Once the loop is known, `b` recovers and `a` keeps its error.
        engine.flush();
        assert_eq!(b.get(), Ok(-1));
        assert_eq!(a.get().unwrap_err().cycle_origin(), Some(a.key()));

        slot.borrow_mut().take();
    }

    #[test]
    fn subscribers_see_changes_only() {
        let engine = Engine::new();
        let a = engine.field(2);
        let parity = {
            let a = a.clone();
            engine.calc(move || Ok(a.get() % 2))
        };

        let seen: Rc<RefCell<Vec<CalcResult<i32>>>> = Rc::default();
        let seen_clone = seen.clone();
        let subscription = parity.subscribe(move |result| seen_clone.borrow_mut().push(result));

        a.set(4);
        engine.flush();
        a.set(5);
        engine.flush();

        assert_eq!(*seen.borrow(), vec![Ok(0), Ok(1)]);
        drop(subscription);
        assert!(!parity.is_alive());
    }

    #[test]
    fn custom_comparator_suppresses_changes() {
        let engine = Engine::new();
        let a = engine.field(10);
        let rounded = {
            let a = a.clone();
            engine
                .calc(move || Ok(a.get()))
                .set_cmp(|old: &i32, new: &i32| old / 10 == new / 10)
        };
        let seen: Rc<RefCell<Vec<CalcResult<i32>>>> = Rc::default();
        let seen_clone = seen.clone();
        let _subscription = rounded.subscribe(move |result| seen_clone.borrow_mut().push(result));

        a.set(15);
        engine.flush();
        assert_eq!(rounded.get(), Ok(10));

        a.set(21);
        engine.flush();
        assert_eq!(*seen.borrow(), vec![Ok(10), Ok(21)]);
    }
}
