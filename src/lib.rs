//! Parallel training operator core.
//!
//! Drives data-parallel training across a fixed pool of workers, merges
//! their parameters at epoch boundaries, and dispatches user-extensible
//! hooks on a time-scale vocabulary. Worker state is exchanged through a
//! tagged hierarchical registry with wildcard-aware resolution.

pub mod config;
pub mod data;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod merge;
pub mod net;
pub mod operator;
pub mod optimization;
pub mod registry;
pub mod strategy;

pub use error::{OperatorErr, Result};
pub use hooks::{Hook, HookRef, LiveTime, TimeScale, TimeStep};
pub use operator::{
    Operator, OperatorBuilder, OperatorState, ThreadWorkerFactory, WorkerProgress,
};
pub use registry::{Registry, RegistryRef, RegistryResolver};
