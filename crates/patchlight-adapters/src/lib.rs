//! External collaborators for the patchlight engine.
//!
//! This crate holds the narrow contracts the engine consumes - a durable
//! key-value store and a diff provider - together with their production
//! implementations, plus the layered configuration both sides read from.

pub mod config;
pub mod scm;
pub mod store;

pub use config::Config;
pub use scm::{DiffProvider, GitLabProvider, StaticProvider};
pub use store::{FileStore, KeyValueStore, MemoryStore};
