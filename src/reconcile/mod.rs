//! # Reconcile
//!
//! Plan/apply over the bootstrap dependency graph.
//!
//! - [`graph`]: resource addresses and their topological order
//! - [`executor`]: timeout-bounded, retried and recorded cloud calls
//! - [`plan`]: planned changes and apply reports
//! - [`engine`]: lock, load state, converge, persist

pub mod engine;
pub mod executor;
pub mod graph;
pub mod plan;

pub use engine::Engine;
pub use executor::{Executor, Mode};
pub use graph::{DependencyGraph, ResourceAddress};
pub use plan::{ApplyReport, ChangeAction, Plan, PlannedChange, ResourceAction};
