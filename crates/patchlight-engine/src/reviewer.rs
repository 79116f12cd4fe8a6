//! Review orchestration: the engine callers actually drive.
//!
//! One run per review request. The run checks the duplicate-submission
//! cache, then the content-addressed cache, pulls historical findings for
//! the logical task, fetches and selects changed files, fans analysis out
//! under the concurrency cap, and persists the result into every cache
//! keyspace. The synchronous entry point returns the result directly; the
//! asynchronous pair tracks the run through the durable task store.

use crate::analyzer::FileAnalyzer;
use crate::cache::ReviewCache;
use crate::llm::client::CompletionBackend;
use crate::selector::CostSelector;
use crate::tasks::TaskStore;
use chrono::Utc;
use patchlight_adapters::config::Config;
use patchlight_adapters::scm::DiffProvider;
use patchlight_adapters::store::KeyValueStore;
use patchlight_core::{
    ChangeSet, ReviewMetadata, ReviewResult, ReviewStatistics, Task,
};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct ReviewEngine {
    provider: Arc<dyn DiffProvider>,
    backend: Arc<dyn CompletionBackend>,
    analyzer: FileAnalyzer,
    selector: CostSelector,
    cache: ReviewCache,
    tasks: TaskStore,
    model: String,
}

/// Where a run pushes progress. The synchronous path reports nowhere; the
/// asynchronous path pushes into the task store.
enum ProgressSink<'a> {
    None,
    Task {
        tasks: &'a TaskStore,
        task_id: &'a str,
    },
}

impl ProgressSink<'_> {
    async fn report(&self, progress: u8, message: &str) {
        if let ProgressSink::Task { tasks, task_id } = self {
            tasks.update_progress(task_id, progress, message).await;
        }
    }
}

impl ReviewEngine {
    pub fn new(
        provider: Arc<dyn DiffProvider>,
        backend: Arc<dyn CompletionBackend>,
        store: Arc<dyn KeyValueStore>,
        config: &Config,
    ) -> Self {
        Self {
            provider,
            backend: Arc::clone(&backend),
            analyzer: FileAnalyzer::from_config(backend, config),
            selector: CostSelector::from_config(config),
            cache: ReviewCache::new(
                Arc::clone(&store),
                config.review_cache_ttl(),
                config.history_cache_ttl(),
            ),
            tasks: TaskStore::new(store, config.task_ttl()),
            model: config.default_model.clone(),
        }
    }

    /// Run one review to completion and return the result.
    pub async fn run_review(&self, change: &ChangeSet) -> anyhow::Result<ReviewResult> {
        self.run_inner(change, &ProgressSink::None).await
    }

    /// Start an asynchronous review. Returns the task id to poll; the task
    /// always reaches a terminal state unless the process dies.
    pub async fn submit(&self, change: ChangeSet) -> anyhow::Result<String> {
        change.validate()?;
        let task_id = Uuid::new_v4().to_string();
        self.tasks.create(&task_id).await?;

        let engine = self.clone();
        let id = task_id.clone();
        tokio::spawn(async move {
            let sink = ProgressSink::Task {
                tasks: &engine.tasks,
                task_id: &id,
            };
            match engine.run_inner(&change, &sink).await {
                Ok(result) => engine.tasks.complete(&id, result).await,
                Err(err) => {
                    error!("review task {} failed: {}", id, err);
                    engine.tasks.fail(&id, &err.to_string()).await;
                }
            }
        });

        Ok(task_id)
    }

    /// Snapshot of an asynchronous review job.
    pub async fn poll(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).await
    }

    /// Drop task-index references to entries the store already expired.
    pub async fn sweep_tasks(&self) -> usize {
        self.tasks.sweep().await
    }

    pub async fn store_healthy(&self) -> bool {
        self.cache.health_check().await
    }

    pub fn backend_available(&self) -> bool {
        self.backend.is_available()
    }

    async fn run_inner(
        &self,
        change: &ChangeSet,
        progress: &ProgressSink<'_>,
    ) -> anyhow::Result<ReviewResult> {
        change.validate()?;
        let task_id = change.task_id.as_deref();

        progress.report(5, "checking for duplicate submission").await;
        if let Some(previous) = self
            .cache
            .get_duplicate_review(
                &change.project,
                &change.source_branch,
                &change.target_branch,
                task_id,
            )
            .await
        {
            // The duplicate key carries no mode; trust the hit only when the
            // stored result was produced under the requested mode.
            if previous.mode == change.mode {
                info!(
                    "returning duplicate review {} for {} {} -> {}",
                    previous.review_id, change.project, change.source_branch, change.target_branch
                );
                return Ok(previous);
            }
            info!(
                "duplicate hit for {} has mode {}, requested {}; running fresh review",
                change.project, previous.mode, change.mode
            );
        }

        if let Some(commit) = change.source_commit.as_deref() {
            if let Some(previous) = self
                .cache
                .get_cached_review(
                    &change.project,
                    commit,
                    &change.target_branch,
                    change.mode.as_str(),
                    task_id,
                )
                .await
            {
                return Ok(previous);
            }
        }

        progress.report(10, "fetching historical findings").await;
        let history = self
            .cache
            .get_historical_findings(&change.project, &change.target_branch, task_id)
            .await;

        progress.report(20, "fetching changed files").await;
        let head_ref = change
            .source_commit
            .as_deref()
            .unwrap_or(&change.source_branch);
        let files = self
            .provider
            .list_changed_files(&change.project, &change.target_branch, head_ref)
            .await?;

        if files.is_empty() {
            info!(
                "no changes between {} and {} in {}",
                change.target_branch, head_ref, change.project
            );
            return Ok(self.empty_result(change));
        }

        progress.report(30, "selecting files for analysis").await;
        let selection = self.selector.select(files);
        let cost_estimate = self.selector.estimate_total_cost(&selection.files);

        progress
            .report(40, &format!("analyzing {} files", selection.files.len()))
            .await;
        let outcome = self
            .analyzer
            .analyze_files(&selection.files, change.mode, &history)
            .await;

        progress.report(90, "aggregating results").await;
        let statistics = ReviewStatistics {
            files_analyzed: selection.files.len(),
            files_excluded: selection.excluded,
            total_additions: selection.files.iter().map(|f| f.num_added_lines).sum(),
            total_deletions: selection.files.iter().map(|f| f.num_removed_lines).sum(),
            failed_files: outcome.failed_files,
        };
        let result = ReviewResult {
            review_id: Uuid::new_v4().to_string(),
            mode: change.mode,
            score: outcome.score,
            summary: outcome.summary,
            findings: outcome.findings,
            suggestions: outcome.suggestions,
            statistics,
            metadata: ReviewMetadata {
                model: self.model.clone(),
                reviewed_at: Utc::now(),
                cost_estimate,
            },
            from_cache: false,
        };

        progress.report(95, "persisting results").await;
        if let Some(commit) = change.source_commit.as_deref() {
            self.cache
                .put_cached_review(
                    &change.project,
                    commit,
                    &change.target_branch,
                    change.mode.as_str(),
                    task_id,
                    &result,
                )
                .await;
        }
        self.cache
            .put_duplicate_review(
                &change.project,
                &change.source_branch,
                &change.target_branch,
                task_id,
                &result,
            )
            .await;
        self.cache
            .save_historical_findings(
                &change.project,
                &change.target_branch,
                task_id,
                &result.findings,
            )
            .await;

        info!(
            "review {} completed with score {:.1}",
            result.review_id, result.score
        );
        Ok(result)
    }

    fn empty_result(&self, change: &ChangeSet) -> ReviewResult {
        ReviewResult {
            review_id: Uuid::new_v4().to_string(),
            mode: change.mode,
            score: 10.0,
            summary: "No changes to review".to_string(),
            findings: Vec::new(),
            suggestions: Vec::new(),
            statistics: ReviewStatistics::default(),
            metadata: ReviewMetadata {
                model: self.model.clone(),
                reviewed_at: Utc::now(),
                cost_estimate: 0.0,
            },
            from_cache: false,
        }
    }
}
