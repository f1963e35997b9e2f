//! Mock implementations and test utilities for the AOF orchestration engine
//!
//! This crate provides the testing infrastructure shared by the engine,
//! protocol, and service crates:
//! - A scripted [`MockExecutor`] with full spawn-call recording
//! - A [`RecordingAdapter`] notification sink
//! - Fluent builders for tasks and workflows
//! - Ready-made fixtures (org chart, review workflow)

pub mod adapter;
pub mod builders;
pub mod executor;
pub mod fixtures;

pub use adapter::RecordingAdapter;
pub use builders::{TaskBuilder, WorkflowBuilder};
pub use executor::MockExecutor;
pub use fixtures::{review_workflow, standard_org_chart};
