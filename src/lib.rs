//! Conductor: parallel task execution across a pool of workers.
//!
//! Tasks form a dependency graph and may declare the files they touch.
//! The pool claims ready tasks under exclusive file locks, distributes them
//! to skill-matched workers, retries failures with backoff, times out hung
//! attempts and scales the worker count with load. A whole graph can also be
//! run in group mode, where related tasks are batched and released tier by
//! tier.
//!
//! Execution itself is delegated to an [`orchestration::ExecutionBackend`].

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use error::{Error, Result};
