//! Durable state machine for asynchronous review jobs.
//!
//! Tasks move pending -> running -> completed | failed and never leave a
//! terminal state. Snapshots live in the durable store under a TTL; an id
//! index supports sweeping references to entries the store already expired.
//! Progress reporting is strictly best-effort: storage errors are logged and
//! swallowed so a flaky store can never abort the review that owns the task.

use patchlight_adapters::store::KeyValueStore;
use patchlight_core::{ReviewResult, Task, TaskStatus};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const TASK_KEY_PREFIX: &str = "patchlight:task:";
const TASK_INDEX_KEY: &str = "patchlight:tasks";

/// TTL for the id index. Longer than any task TTL so the index outlives the
/// entries it references; sweep trims the difference.
const INDEX_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Clone)]
pub struct TaskStore {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl TaskStore {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Idempotent-by-id creation. An existing task is returned unchanged.
    pub async fn create(&self, task_id: &str) -> anyhow::Result<Task> {
        if let Some(existing) = self.load(task_id).await {
            return Ok(existing);
        }

        let task = Task::new(task_id);
        self.save(&task).await?;

        let mut index = self.read_index().await;
        if !index.iter().any(|id| id == task_id) {
            index.push(task_id.to_string());
            self.write_index(&index).await;
        }

        info!("task {} created", task_id);
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.load(task_id).await
    }

    /// Clamp progress to [0, 100], keep it non-decreasing, and mark the task
    /// running. Unknown ids and storage errors are logged, never raised.
    pub async fn update_progress(&self, task_id: &str, progress: u8, message: &str) {
        let Some(mut task) = self.load(task_id).await else {
            warn!("task {} not found when updating progress", task_id);
            return;
        };
        if task.status.is_terminal() {
            warn!(
                "ignoring progress update for terminal task {} ({})",
                task_id,
                task.status.as_str()
            );
            return;
        }

        let clamped = progress.min(100);
        task.status = TaskStatus::Running;
        task.progress = task.progress.max(clamped);
        task.message = message.to_string();
        task.updated_at = Utc::now();

        if let Err(err) = self.save(&task).await {
            warn!("failed to store progress for task {}: {}", task_id, err);
            return;
        }
        info!("task {} progress: {}% - {}", task_id, task.progress, message);
    }

    /// Terminal transition; subsequent updates to this id are ignored.
    pub async fn complete(&self, task_id: &str, result: ReviewResult) {
        let Some(mut task) = self.load(task_id).await else {
            warn!("task {} not found when completing", task_id);
            return;
        };
        if task.status.is_terminal() {
            warn!("ignoring completion of terminal task {}", task_id);
            return;
        }

        task.status = TaskStatus::Completed;
        task.progress = 100;
        task.message = "task completed".to_string();
        task.result = Some(result);
        task.error = None;
        task.updated_at = Utc::now();

        if let Err(err) = self.save(&task).await {
            warn!("failed to store completion for task {}: {}", task_id, err);
            return;
        }
        info!("task {} completed", task_id);
    }

    /// Terminal transition recording the failure text.
    pub async fn fail(&self, task_id: &str, error: &str) {
        let Some(mut task) = self.load(task_id).await else {
            warn!("task {} not found when failing", task_id);
            return;
        };
        if task.status.is_terminal() {
            warn!("ignoring failure of terminal task {}", task_id);
            return;
        }

        task.status = TaskStatus::Failed;
        task.message = "task failed".to_string();
        task.error = Some(error.to_string());
        task.updated_at = Utc::now();

        if let Err(err) = self.save(&task).await {
            warn!("failed to store failure for task {}: {}", task_id, err);
            return;
        }
        warn!("task {} failed: {}", task_id, error);
    }

    pub async fn delete(&self, task_id: &str) -> bool {
        let deleted = match self.store.delete(&task_key(task_id)).await {
            Ok(deleted) => deleted,
            Err(err) => {
                warn!("failed to delete task {}: {}", task_id, err);
                false
            }
        };
        let mut index = self.read_index().await;
        let before = index.len();
        index.retain(|id| id != task_id);
        if index.len() != before {
            self.write_index(&index).await;
        }
        deleted
    }

    /// Drop index references to entries the store has already expired.
    /// Entry expiry itself is the store's job.
    pub async fn sweep(&self) -> usize {
        let index = self.read_index().await;
        let mut live = Vec::with_capacity(index.len());
        let mut removed = 0;
        for task_id in index {
            if self.load(&task_id).await.is_some() {
                live.push(task_id);
            } else {
                removed += 1;
            }
        }
        if removed > 0 {
            self.write_index(&live).await;
            info!("swept {} expired task references", removed);
        }
        removed
    }

    pub async fn count(&self) -> usize {
        self.read_index().await.len()
    }

    async fn load(&self, task_id: &str) -> Option<Task> {
        let raw = match self.store.get(&task_key(task_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!("failed to read task {}: {}", task_id, err);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(task) => Some(task),
            Err(err) => {
                warn!("failed to parse task {}: {}", task_id, err);
                None
            }
        }
    }

    async fn save(&self, task: &Task) -> anyhow::Result<()> {
        let raw = serde_json::to_string(task)?;
        self.store.put(&task_key(&task.task_id), raw, self.ttl).await
    }

    async fn read_index(&self) -> Vec<String> {
        match self.store.get(TASK_INDEX_KEY).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("failed to read task index: {}", err);
                Vec::new()
            }
        }
    }

    async fn write_index(&self, index: &[String]) {
        let raw = match serde_json::to_string(index) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        if let Err(err) = self.store.put(TASK_INDEX_KEY, raw, INDEX_TTL).await {
            warn!("failed to write task index: {}", err);
        }
    }
}

fn task_key(task_id: &str) -> String {
    format!("{}{}", TASK_KEY_PREFIX, task_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use patchlight_adapters::store::{BoxFuture, MemoryStore};
    use patchlight_core::{ReviewMetadata, ReviewMode};

    const TTL: Duration = Duration::from_secs(600);

    fn task_store() -> TaskStore {
        TaskStore::new(Arc::new(MemoryStore::new()), TTL)
    }

    fn sample_result() -> ReviewResult {
        ReviewResult {
            review_id: "rev-1".to_string(),
            mode: ReviewMode::Full,
            score: 8.0,
            summary: "ok".to_string(),
            findings: Vec::new(),
            suggestions: Vec::new(),
            statistics: Default::default(),
            metadata: ReviewMetadata {
                model: "gpt-4".to_string(),
                reviewed_at: Utc::now(),
                cost_estimate: 0.0,
            },
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = task_store();
        let first = store.create("t-1").await.unwrap();
        store.update_progress("t-1", 40, "working").await;
        let again = store.create("t-1").await.unwrap();
        // Second create returns the live task, not a reset one.
        assert_eq!(again.progress, 40);
        assert_eq!(first.task_id, again.task_id);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_progress_is_clamped_to_100() {
        let store = task_store();
        store.create("t-1").await.unwrap();
        store.update_progress("t-1", 150, "overshoot").await;
        let task = store.get("t-1").await.unwrap();
        assert_eq!(task.progress, 100);
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let store = task_store();
        store.create("t-1").await.unwrap();
        store.update_progress("t-1", 50, "half").await;
        store.update_progress("t-1", 30, "stale write").await;
        let task = store.get("t-1").await.unwrap();
        assert_eq!(task.progress, 50);
    }

    #[tokio::test]
    async fn test_unknown_id_is_a_noop() {
        let store = task_store();
        store.update_progress("ghost", 10, "nobody home").await;
        assert!(store.get("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_to_completed() {
        let store = task_store();
        store.create("t-1").await.unwrap();
        store.update_progress("t-1", 20, "fetching diff").await;
        store.complete("t-1", sample_result()).await;

        let task = store.get("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.result.is_some());
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn test_terminal_state_rejects_further_updates() {
        let store = task_store();
        store.create("t-1").await.unwrap();
        store.complete("t-1", sample_result()).await;

        store.update_progress("t-1", 10, "late write").await;
        store.fail("t-1", "late failure").await;

        let task = store.get("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn test_fail_records_error_text() {
        let store = task_store();
        store.create("t-1").await.unwrap();
        store.fail("t-1", "diff provider unreachable").await;

        let task = store.get("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("diff provider unreachable"));
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_references() {
        // Zero TTL: entries expire immediately while the index survives.
        let store = TaskStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(0));
        store.create("t-1").await.unwrap();
        assert_eq!(store.count().await, 1);
        assert!(store.get("t-1").await.is_none());

        let removed = store.sweep().await;
        assert_eq!(removed, 1);
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_removes_task_and_reference() {
        let store = task_store();
        store.create("t-1").await.unwrap();
        assert!(store.delete("t-1").await);
        assert!(store.get("t-1").await.is_none());
        assert_eq!(store.count().await, 0);
        assert!(!store.delete("t-1").await);
    }

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
            Box::pin(async { Err(anyhow::anyhow!("connection refused")) })
        }
        fn put<'a>(
            &'a self,
            _key: &'a str,
            _value: String,
            _ttl: Duration,
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async { Err(anyhow::anyhow!("connection refused")) })
        }
        fn delete<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, anyhow::Result<bool>> {
            Box::pin(async { Err(anyhow::anyhow!("connection refused")) })
        }
        fn ping<'a>(&'a self) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async { Err(anyhow::anyhow!("connection refused")) })
        }
    }

    #[tokio::test]
    async fn test_progress_swallows_storage_errors() {
        let store = TaskStore::new(Arc::new(FailingStore), TTL);
        // Must log and return, never panic or propagate.
        store.update_progress("t-1", 50, "flaky store").await;
        store.complete("t-1", sample_result()).await;
        store.fail("t-1", "boom").await;
    }
}
