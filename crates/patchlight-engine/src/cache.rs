//! Review result caching and the historical findings ledger.
//!
//! Three keyspaces over the durable store, one value shape (a serialized
//! review result or findings map):
//!
//! 1. content-addressed - keyed on the source commit hash, so any new commit
//!    misses; TTL ~7 days.
//! 2. duplicate-submission - keyed on branch identity without the commit, so
//!    re-submitting the same branch/task pair replays the last result; TTL
//!    ~7 days. The key deliberately omits the review mode; callers must
//!    check the stored result's mode before trusting a hit.
//! 3. historical ledger - keyed on (project, target branch, logical task),
//!    commit- and source-branch-agnostic, mapping filename to reduced
//!    finding summaries; TTL ~30 days. Every save replaces the stored map.
//!
//! Every operation degrades on store failure: reads become misses, writes
//! become no-ops, and nothing here ever aborts a review.

use patchlight_adapters::store::KeyValueStore;
use patchlight_core::{Finding, FindingSummary, ReviewResult};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REVIEW_KEY_PREFIX: &str = "patchlight:review:";
const DEDUP_KEY_PREFIX: &str = "patchlight:dedup:";
const HISTORY_KEY_PREFIX: &str = "patchlight:history:";

#[derive(Clone)]
pub struct ReviewCache {
    store: Arc<dyn KeyValueStore>,
    review_ttl: Duration,
    history_ttl: Duration,
}

impl ReviewCache {
    pub fn new(store: Arc<dyn KeyValueStore>, review_ttl: Duration, history_ttl: Duration) -> Self {
        Self {
            store,
            review_ttl,
            history_ttl,
        }
    }

    /// Content-addressed lookup: exact code identity via the commit hash.
    pub async fn get_cached_review(
        &self,
        project: &str,
        source_commit: &str,
        target_branch: &str,
        mode: &str,
        task_id: Option<&str>,
    ) -> Option<ReviewResult> {
        let key = review_key(project, source_commit, target_branch, mode, task_id);
        match self.read_result(&key).await {
            Some(result) => {
                info!(
                    "cache hit for review: {} commit:{} -> {}",
                    project,
                    short(source_commit),
                    target_branch
                );
                Some(result)
            }
            None => {
                info!(
                    "cache miss for review: {} commit:{} -> {}",
                    project,
                    short(source_commit),
                    target_branch
                );
                None
            }
        }
    }

    pub async fn put_cached_review(
        &self,
        project: &str,
        source_commit: &str,
        target_branch: &str,
        mode: &str,
        task_id: Option<&str>,
        result: &ReviewResult,
    ) {
        let key = review_key(project, source_commit, target_branch, mode, task_id);
        self.write_result(&key, result, self.review_ttl).await;
    }

    /// Branch-identity lookup for duplicate submissions. The key carries no
    /// commit hash and no mode; the caller must verify the returned result's
    /// mode before trusting the hit.
    pub async fn get_duplicate_review(
        &self,
        project: &str,
        source_branch: &str,
        target_branch: &str,
        task_id: Option<&str>,
    ) -> Option<ReviewResult> {
        let key = duplicate_key(project, source_branch, target_branch, task_id);
        match self.read_result(&key).await {
            Some(result) => {
                info!(
                    "duplicate hit for review: {} {} -> {}",
                    project, source_branch, target_branch
                );
                Some(result)
            }
            None => {
                info!(
                    "duplicate miss for review: {} {} -> {}",
                    project, source_branch, target_branch
                );
                None
            }
        }
    }

    /// Unconditional overwrite with TTL reset.
    pub async fn put_duplicate_review(
        &self,
        project: &str,
        source_branch: &str,
        target_branch: &str,
        task_id: Option<&str>,
        result: &ReviewResult,
    ) {
        let key = duplicate_key(project, source_branch, target_branch, task_id);
        self.write_result(&key, result, self.review_ttl).await;
    }

    /// Findings from earlier submissions of the same logical task, grouped
    /// by filename. Empty on miss and on any store error.
    pub async fn get_historical_findings(
        &self,
        project: &str,
        target_branch: &str,
        task_id: Option<&str>,
    ) -> HashMap<String, Vec<FindingSummary>> {
        let key = history_key(project, target_branch, task_id);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                info!(
                    "no historical findings for: {} -> {}",
                    project, target_branch
                );
                return HashMap::new();
            }
            Err(err) => {
                warn!("error reading historical findings: {}", err);
                return HashMap::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(map) => {
                info!("found historical findings for: {} -> {}", project, target_branch);
                map
            }
            Err(err) => {
                warn!("discarding unreadable historical findings: {}", err);
                HashMap::new()
            }
        }
    }

    /// Group findings by filename, reduce each to its summary form, and
    /// REPLACE the stored map for this key. Saves never merge; findings for
    /// files absent from this save are gone.
    pub async fn save_historical_findings(
        &self,
        project: &str,
        target_branch: &str,
        task_id: Option<&str>,
        findings: &[Finding],
    ) {
        let mut by_file: HashMap<String, Vec<FindingSummary>> = HashMap::new();
        for finding in findings {
            let filename = if finding.filename.is_empty() {
                "unknown".to_string()
            } else {
                finding.filename.clone()
            };
            by_file.entry(filename).or_default().push(finding.into());
        }

        let key = history_key(project, target_branch, task_id);
        let raw = match serde_json::to_string(&by_file) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("error serializing historical findings: {}", err);
                return;
            }
        };
        if let Err(err) = self.store.put(&key, raw, self.history_ttl).await {
            warn!("error saving historical findings: {}", err);
        } else {
            info!(
                "saved historical findings for {} files: {} -> {}",
                by_file.len(),
                project,
                target_branch
            );
        }
    }

    pub async fn health_check(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!("store health check failed: {}", err);
                false
            }
        }
    }

    async fn read_result(&self, key: &str) -> Option<ReviewResult> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!("error reading cached review: {}", err);
                return None;
            }
        };
        match serde_json::from_str::<ReviewResult>(&raw) {
            Ok(mut result) => {
                result.from_cache = true;
                Some(result)
            }
            Err(err) => {
                warn!("discarding unreadable cached review: {}", err);
                None
            }
        }
    }

    async fn write_result(&self, key: &str, result: &ReviewResult, ttl: Duration) {
        let raw = match serde_json::to_string(result) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("error serializing review result: {}", err);
                return;
            }
        };
        if let Err(err) = self.store.put(key, raw, ttl).await {
            warn!("error caching review result: {}", err);
        }
    }
}

fn short(commit: &str) -> &str {
    &commit[..commit.len().min(8)]
}

fn hash_components(components: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(components.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Keyspace 1: includes the commit hash so any new commit misses.
fn review_key(
    project: &str,
    source_commit: &str,
    target_branch: &str,
    mode: &str,
    task_id: Option<&str>,
) -> String {
    let components = match task_id {
        Some(task) => format!(
            "{}:{}:{}:{}:{}",
            project, source_commit, target_branch, mode, task
        ),
        None => format!("{}:{}:{}:{}", project, source_commit, target_branch, mode),
    };
    format!("{}{}", REVIEW_KEY_PREFIX, hash_components(&components))
}

/// Keyspace 2: branch identity only; no commit, no mode.
fn duplicate_key(
    project: &str,
    source_branch: &str,
    target_branch: &str,
    task_id: Option<&str>,
) -> String {
    let components = format!(
        "{}:{}:{}:{}",
        project,
        source_branch,
        target_branch,
        task_id.unwrap_or("")
    );
    format!("{}{}", DEDUP_KEY_PREFIX, hash_components(&components))
}

/// Keyspace 3: task identity on the target branch; commit- and
/// source-branch-agnostic so every submission of the task shares it.
fn history_key(project: &str, target_branch: &str, task_id: Option<&str>) -> String {
    let components = match task_id {
        Some(task) => format!("{}:{}:{}", project, target_branch, task),
        None => format!("{}:{}", project, target_branch),
    };
    format!("{}{}", HISTORY_KEY_PREFIX, hash_components(&components))
}
