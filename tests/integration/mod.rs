//! Integration test suite for conductor.
//!
//! These tests drive a real `PoolManager` against scripted execution
//! backends and verify that the registry, orchestrator, lock manager,
//! grouper and scheduler work together correctly.
//!
//! # Test Categories
//!
//! - `scenarios`: Flat-queue execution, retries, timeouts and shutdown
//! - `group_mode`: DAG grouping and tier-by-tier scheduling
//! - `scaling`: Auto-scaling bounds and scale-down choices
//! - `properties`: Property tests for locks, backoff, grouping and scaling
//!
//! # Timing
//!
//! Async tests run on a paused tokio clock, so backoff and timeout paths
//! finish instantly and deterministically.

mod fixtures;

mod group_mode;
mod scaling;
mod properties;
