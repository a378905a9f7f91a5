//! Integration test suite for weeki.
//!
//! These tests drive the orchestrator end to end: directive intake,
//! decomposition, scheduling through the shared agent pool, and the final
//! status read back from the task registry.
//!
//! # Test Categories
//!
//! - `scenarios`: Fan-in graphs, dependency ordering, failure handling
//! - `concurrency`: Pool capacity under one and many tasks
//! - `timeouts`: Deadlines, retries and slot release
//! - `cancellation`: Per-task cancellation and shutdown
//!
//! All agents are scripted in-process; no external services are involved.

mod fixtures;

mod scenarios;
mod cancellation;
