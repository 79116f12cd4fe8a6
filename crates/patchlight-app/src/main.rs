//! patchlight - AI-assisted review of merge-request diffs.
//!
//! Thin CLI over the review engine: run one review synchronously and print
//! the result as JSON, or check the health of the engine's collaborators.

use anyhow::Result;
use clap::{Parser, Subcommand};
use patchlight_adapters::config::Config;
use patchlight_adapters::scm::GitLabProvider;
use patchlight_adapters::store::FileStore;
use patchlight_core::{ChangeSet, ReviewMode};
use patchlight_engine::llm::client::HttpCompletionClient;
use patchlight_engine::reviewer::ReviewEngine;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "patchlight",
    about = "AI-assisted code review for merge-request diffs",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Review the changes between two refs of a project.
    Review {
        /// Project identifier on the VCS host (e.g. group/app).
        #[arg(long)]
        project: String,

        /// Source branch to review.
        #[arg(long)]
        source: String,

        /// Target branch to compare against.
        #[arg(long)]
        target: String,

        /// Commit hash of the source branch head, when known. Enables the
        /// content-addressed cache.
        #[arg(long)]
        commit: Option<String>,

        /// Review mode: full, security, performance, or quick.
        #[arg(long, default_value = "full")]
        mode: String,

        /// Logical work-item id correlating repeated submissions.
        #[arg(long)]
        task: Option<String>,
    },

    /// Check connectivity to the store and the completion service.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load();
    let engine = build_engine(&config)?;

    match args.command {
        Command::Review {
            project,
            source,
            target,
            commit,
            mode,
            task,
        } => {
            let change = ChangeSet {
                project,
                source_branch: source,
                source_commit: commit,
                target_branch: target,
                mode: mode.parse::<ReviewMode>()?,
                task_id: task,
            };
            let result = engine.run_review(&change).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Check => {
            let store = engine.store_healthy().await;
            let backend = engine.backend_available();
            println!(
                "{}",
                serde_json::json!({
                    "store": if store { "ok" } else { "unavailable" },
                    "completion_backend": if backend { "configured" } else { "not configured" },
                })
            );
            if !backend {
                eprintln!("hint: set PATCHLIGHT_API_KEY to enable LLM analysis");
            }
        }
    }

    Ok(())
}

fn build_engine(config: &Config) -> Result<Arc<ReviewEngine>> {
    let provider = Arc::new(GitLabProvider::new(
        &config.scm_base_url,
        config.scm_token.clone(),
    )?);
    let backend = Arc::new(HttpCompletionClient::from_config(config)?);
    let store = Arc::new(FileStore::new(config.data_dir()));
    Ok(Arc::new(ReviewEngine::new(provider, backend, store, config)))
}
