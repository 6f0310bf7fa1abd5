//! Flowplan Core -- exact rate balancing for production-flow graphs.
//!
//! A production plan is a graph of nodes (crafting machines, splitters,
//! mergers, sinks, nested groups) whose pins carry item flow rates. When one
//! pin's rate is edited, the engine finds every pin that edit can move,
//! writes the graph's constraints as a linear system over exact rationals,
//! solves it, and commits the new rates -- or leaves the graph untouched and
//! reports why not.
//!
//! # Four-Stage Solve Pipeline
//!
//! Each call to [`engine::Engine::solve`] runs:
//!
//! 1. **Collect** -- Walk from the edited pin to the relevant pin set.
//! 2. **Build** -- Allocate variables and emit hard and soft equations.
//! 3. **Solve** -- Gaussian elimination with partial pivoting, then the
//!    negative-rate check.
//! 4. **Apply** -- Write rates, rescale groups, annotate link flow, notify
//!    hooks.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut engine = Engine::new(graph);
//! let report = engine.solve_expr(output_pin, "45 / 2")?;
//! for change in &report.changed {
//!     println!("{:?}: {} -> {}", change.pin, change.old, change.new);
//! }
//! ```
//!
//! # Key Types
//!
//! - [`engine::Engine`] -- Pipeline orchestrator and atomic topology edits.
//! - [`graph::FlowGraph`] -- Arena of nodes, pins and links.
//! - [`node::NodeKind`] -- The six node kinds and their rate rules.
//! - [`rational::Rational`] -- Reduced 64-bit fraction with checked math.
//! - [`hook::RateHook`] -- Derived-state plug-ins run after each solve.
//! - [`record::GraphRecord`] -- Serde shape for persisting a graph.

pub mod apply;
pub mod config;
pub mod engine;
pub mod equation;
pub mod graph;
pub mod hook;
pub mod id;
pub mod node;
pub mod rational;
pub mod recipe;
pub mod record;
pub mod relevant;
pub mod solver;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
