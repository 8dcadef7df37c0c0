//! Reactive Layer
//!
//! This module gives the vertices of the dependency graph their meaning:
//! fields, calculations and the engine that drives them.
//!
//! # Concepts
//!
//! ## Fields
//!
//! A Field holds a mutable value. Reading it inside a tracked computation
//! makes that computation depend on it; writing it marks it dirty so the
//! next flush reaches everything downstream.
//!
//! ## Calculations
//!
//! A Calculation is a memoized function of other vertices. It runs lazily,
//! records what it read, and re-runs only when one of those reads changed.
//! Dependency cycles are detected and reported as [`CalcError::Cycle`].
//!
//! ## Engine
//!
//! The Engine owns the graph, the read-tracking stack, the retain table and
//! the flush scheduler. Vertices exist in the graph only while retained;
//! an unretained field or calculation behaves like a plain value or
//! function.
//!
//! # Implementation Notes
//!
//! Everything here is single-threaded (`Rc`/`RefCell`). Handles are cheap
//! clones of shared state, and the graph refers to vertices by
//! [`VertexKey`] so it never owns them.

mod calc;
mod context;
mod contract;
mod debug;
mod engine;
mod error;
mod field;
mod flush;
mod subscriber;

pub use calc::{CalcState, Calculation};
pub use context::ReadSet;
pub use contract::{AsVertex, Processable, Retainable, Vertex, VertexKey, VertexRef};
pub use debug::{DebugEdge, DebugGraph, DebugVertex};
pub use engine::Engine;
pub use error::{CalcError, CalcResult};
pub use field::Field;
pub use flush::{FlushTask, ImmediateScheduler, LocalTaskScheduler, ManualScheduler, Scheduler};
pub use subscriber::{SubscriberId, Subscription};
