//! Filesystem persistence for the AOF orchestration engine.
//!
//! Tasks live as one frontmatter+markdown file each under a status-named
//! directory; the file on disk is the source of truth. This crate provides:
//!
//! - [`TaskStore`] - directory-per-status CRUD with atomic writes and moves
//! - [`frontmatter`] - the canonical YAML+markdown codec
//! - [`body`] - the markdown body section conventions (work log, reports)
//! - [`EventLogger`] - append-only JSONL journal with subscriber fan-out
//! - [`DirLock`] - advisory cross-process lock for scheduler polls

pub mod body;
pub mod event_log;
pub mod frontmatter;
pub mod lock;
pub mod task_store;

pub use event_log::{EventLogger, EventQuery};
pub use lock::DirLock;
pub use task_store::{LintIssue, TaskArtifact, TaskStore, TransitionCtx};
