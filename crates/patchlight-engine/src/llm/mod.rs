//! Completion-service client, prompt construction, and response salvage.

pub mod client;
pub mod prompts;
pub mod repair;

pub use client::{ChatMessage, CompletionBackend, HttpCompletionClient};
pub use repair::{repair_analysis, RepairedAnalysis};
