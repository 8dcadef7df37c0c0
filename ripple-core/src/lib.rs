//! Ripple Core
//!
//! This crate provides an incremental computation engine. It implements:
//!
//! - A dependency graph that keeps a topological order up to date as edges
//!   come and go, and tracks the cycles among its vertices
//! - Fields (mutable values) and calculations (memoized derived values)
//!   with automatic dependency tracking
//! - A flush loop that recomputes only what a change can reach
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: The ordered dependency graph and its processing loop
//! - `reactive`: The engine, fields, calculations and flush schedulers
//! - `config`: Engine settings
//!
//! # Example
//!
//! ```rust
//! use ripple_core::reactive::Engine;
//!
//! let engine = Engine::new();
//! let count = engine.field(1);
//! let doubled = {
//!     let count = count.clone();
//!     engine.calc(move || Ok(count.get() * 2))
//! };
//!
//! let _subscription = doubled.subscribe(|value| println!("doubled: {value:?}"));
//! count.set(5);
//! engine.flush(); // prints "doubled: Ok(10)"
//! assert_eq!(doubled.get(), Ok(10));
//! ```

pub mod config;
pub mod graph;
pub mod reactive;

pub use config::{EngineConfig, FlushMode};
pub use reactive::{CalcError, CalcResult, Calculation, Engine, Field};
