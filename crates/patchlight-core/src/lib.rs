//! Domain types for patchlight.
//!
//! Everything in this crate is plain data: change sets, file patches,
//! findings, review results, and async task snapshots. Serialization happens
//! here; I/O lives in the adapter and engine crates.

pub mod patch;
pub mod review;
pub mod task;

pub use patch::{EditKind, FilePatch};
pub use review::{
    ChangeSet, Finding, FindingSummary, ReviewMetadata, ReviewMode, ReviewResult,
    ReviewStatistics, Severity,
};
pub use task::{Task, TaskStatus};
