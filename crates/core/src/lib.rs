//! NodeReaper core: snapshot records, policy and the pure decision engine.
//!
//! Nothing in this crate performs I/O. The kube adapter builds [`NodeRecord`]s
//! and [`PodRecord`]s, the engine feeds them through [`analyzer::evaluate`] and
//! [`finalizer::plan`] and acts on the results.

#![forbid(unsafe_code)]

pub mod analyzer;
pub mod config;
pub mod finalizer;
pub mod model;
pub mod verdict;

pub use config::{ConfigError, PolicyConfig};
pub use model::{NodeDetails, NodeRecord, OwnerKind, PodPhase, PodRecord, Readiness, Taint};
pub use verdict::{Condition, FinalizerAction, Reason, SkipCause, Verdict};
