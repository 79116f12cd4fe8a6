//! Concurrent per-file analysis and aggregation.
//!
//! Each selected file becomes one analysis unit: payload construction, a
//! completion call, and salvage parsing of whatever comes back. Units run
//! under a bounded semaphore so the number of outstanding completion calls
//! never exceeds the configured width. A unit that fails is recorded in
//! `failed_files` and contributes nothing else; the batch always finishes.
//!
//! Files that carry historical findings from an earlier submission of the
//! same logical task are re-reviewed narrowly: confirm the old issues are
//! fixed, report only severe new ones.

use crate::llm::client::{ChatMessage, CompletionBackend};
use crate::llm::prompts::{
    analysis_schema, build_analysis_payload, first_pass_prompt, summary_prompt, system_prompt,
    verify_fix_prompt,
};
use crate::llm::repair::{repair_analysis, RepairedAnalysis};
use patchlight_adapters::config::Config;
use patchlight_core::{FilePatch, Finding, FindingSummary, ReviewMode, Severity};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Caps on aggregated output, bounding downstream payload size.
const MAX_FINDINGS: usize = 30;
const MAX_SUGGESTIONS: usize = 20;

const BASE_SCORE: f64 = 8.0;
const MIN_SCORE: f64 = 2.0;
const HIGH_PENALTY: f64 = 1.0;
const MEDIUM_PENALTY: f64 = 0.5;
const LOW_PENALTY: f64 = 0.2;
const FAILED_FILE_PENALTY: f64 = 0.5;
const LARGE_REVIEW_PENALTY: f64 = 0.3;
const LARGE_REVIEW_THRESHOLD: usize = 10;

/// Aggregated result of one analysis batch.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOutcome {
    pub findings: Vec<Finding>,
    pub suggestions: Vec<String>,
    pub failed_files: Vec<String>,
    pub score: f64,
    pub summary: String,
}

#[derive(Clone)]
pub struct FileAnalyzer {
    backend: Arc<dyn CompletionBackend>,
    max_concurrent: usize,
    max_file_lines: usize,
}

impl FileAnalyzer {
    pub fn new(backend: Arc<dyn CompletionBackend>, max_concurrent: usize, max_file_lines: usize) -> Self {
        Self {
            backend,
            max_concurrent: max_concurrent.max(1),
            max_file_lines,
        }
    }

    pub fn from_config(backend: Arc<dyn CompletionBackend>, config: &Config) -> Self {
        Self::new(
            backend,
            config.max_concurrent_file_reviews,
            config.max_file_lines,
        )
    }

    /// Analyze every file in parallel under the concurrency cap and fold the
    /// unit results into one outcome. Aggregation does not depend on unit
    /// completion order.
    pub async fn analyze_files(
        &self,
        files: &[FilePatch],
        mode: ReviewMode,
        history: &HashMap<String, Vec<FindingSummary>>,
    ) -> AnalysisOutcome {
        info!(
            "analyzing {} files ({} mode, width {})",
            files.len(),
            mode,
            self.max_concurrent
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let units = files.iter().map(|patch| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let permit = semaphore.acquire_owned().await;
                if permit.is_err() {
                    return (
                        patch.filename.clone(),
                        Err(anyhow::anyhow!("analysis pool closed")),
                    );
                }
                let result = self
                    .analyze_single(patch, mode, history.get(&patch.filename))
                    .await;
                (patch.filename.clone(), result)
            }
        });
        let results = futures::future::join_all(units).await;

        let mut findings: Vec<Finding> = Vec::new();
        let mut suggestions: Vec<String> = Vec::new();
        let mut failed_files: Vec<String> = Vec::new();
        for (filename, result) in results {
            match result {
                Ok(repaired) => {
                    findings.extend(repaired.findings);
                    suggestions.extend(repaired.suggestions);
                }
                Err(err) => {
                    warn!("analysis of {} failed: {}", filename, err);
                    failed_files.push(filename);
                }
            }
        }

        findings.truncate(MAX_FINDINGS);
        suggestions.truncate(MAX_SUGGESTIONS);

        let score = compute_score(&findings, files.len(), failed_files.len());
        let summary = self
            .generate_summary(&findings, suggestions.len(), files.len(), failed_files.len())
            .await;

        info!(
            "analysis complete: {} findings, {} suggestions, {} failed files, score {:.1}",
            findings.len(),
            suggestions.len(),
            failed_files.len(),
            score
        );

        AnalysisOutcome {
            findings,
            suggestions,
            failed_files,
            score,
            summary,
        }
    }

    async fn analyze_single(
        &self,
        patch: &FilePatch,
        mode: ReviewMode,
        history: Option<&Vec<FindingSummary>>,
    ) -> anyhow::Result<RepairedAnalysis> {
        if !self.backend.is_available() {
            debug!(
                "completion backend unavailable, skipping analysis of {}",
                patch.filename
            );
            return Ok(RepairedAnalysis::default());
        }

        let payload = build_analysis_payload(patch, self.max_file_lines);
        let user = match history {
            Some(prior) if !prior.is_empty() => {
                debug!(
                    "re-reviewing {} against {} historical findings",
                    patch.filename,
                    prior.len()
                );
                verify_fix_prompt(&payload, prior)
            }
            _ => first_pass_prompt(&payload, mode),
        };

        let messages = vec![
            ChatMessage::system(system_prompt(mode)),
            ChatMessage::user(user),
        ];
        let schema = analysis_schema();
        let raw = self.backend.complete(&messages, Some(&schema)).await?;

        let mut repaired = repair_analysis(&raw);
        for finding in &mut repaired.findings {
            if finding.filename.is_empty() {
                finding.filename = patch.filename.clone();
            }
        }
        Ok(repaired)
    }

    /// Short natural-language summary. One completion call when the backend
    /// is up; a deterministic severity-count summary otherwise.
    async fn generate_summary(
        &self,
        findings: &[Finding],
        suggestions: usize,
        files_analyzed: usize,
        failed_files: usize,
    ) -> String {
        let (high, medium, low) = severity_counts(findings);

        if self.backend.is_available() {
            let prompt = summary_prompt(high, medium, low, files_analyzed, failed_files, suggestions);
            let messages = vec![ChatMessage::user(prompt)];
            match self.backend.complete(&messages, None).await {
                Ok(text) if !text.trim().is_empty() => return text.trim().to_string(),
                Ok(_) => {}
                Err(err) => warn!("summary generation failed: {}", err),
            }
        }

        fallback_summary(high, medium, files_analyzed, failed_files)
    }
}

fn severity_counts(findings: &[Finding]) -> (usize, usize, usize) {
    let mut high = 0;
    let mut medium = 0;
    let mut low = 0;
    for finding in findings {
        match finding.severity {
            Severity::High => high += 1,
            Severity::Medium => medium += 1,
            Severity::Low => low += 1,
        }
    }
    (high, medium, low)
}

/// Weighted score: start from the baseline, subtract per finding severity
/// and per failed file, floor at the minimum.
fn compute_score(findings: &[Finding], files_analyzed: usize, failed_files: usize) -> f64 {
    let mut score = BASE_SCORE;
    for finding in findings {
        score -= match finding.severity {
            Severity::High => HIGH_PENALTY,
            Severity::Medium => MEDIUM_PENALTY,
            Severity::Low => LOW_PENALTY,
        };
    }
    score -= failed_files as f64 * FAILED_FILE_PENALTY;
    if files_analyzed > LARGE_REVIEW_THRESHOLD {
        score -= LARGE_REVIEW_PENALTY;
    }
    score.max(MIN_SCORE)
}

fn fallback_summary(high: usize, medium: usize, files_analyzed: usize, failed_files: usize) -> String {
    let mut summary = format!(
        "Analyzed {} files: {} high and {} medium severity findings.",
        files_analyzed, high, medium
    );
    if failed_files > 0 {
        summary.push_str(&format!(" {} files could not be analyzed.", failed_files));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchlight_adapters::store::BoxFuture;
    use patchlight_core::EditKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn patch(filename: &str) -> FilePatch {
        FilePatch::new(
            filename,
            None,
            EditKind::Modified,
            String::new(),
            "fn main() {}".to_string(),
            "+fn main() {}".to_string(),
        )
    }

    fn finding_json(count: usize, severity: &str) -> String {
        let findings: Vec<String> = (0..count)
            .map(|i| {
                format!(
                    r#"{{"type": "bug", "severity": "{}", "description": "issue {}"}}"#,
                    severity, i
                )
            })
            .collect();
        format!(
            r#"{{"findings": [{}], "suggestions": []}}"#,
            findings.join(",")
        )
    }

    /// Scripted backend: canned responses per filename, optional failures,
    /// and concurrency accounting.
    struct FakeBackend {
        responses: HashMap<String, String>,
        fail_files: Vec<String>,
        available: bool,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                responses: HashMap::new(),
                fail_files: Vec::new(),
                available: true,
                delay: Duration::from_millis(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn respond(mut self, filename: &str, body: &str) -> Self {
            self.responses.insert(filename.to_string(), body.to_string());
            self
        }

        fn failing(mut self, filename: &str) -> Self {
            self.fail_files.push(filename.to_string());
            self
        }

        fn unavailable(mut self) -> Self {
            self.available = false;
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl CompletionBackend for FakeBackend {
        fn complete<'a>(
            &'a self,
            messages: &'a [ChatMessage],
            _schema: Option<&'a serde_json::Value>,
        ) -> BoxFuture<'a, anyhow::Result<String>> {
            Box::pin(async move {
                let prompt = messages
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                self.prompts
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(prompt.clone());

                // Summary calls have no file payload attached.
                if prompt.contains("summary of a code review") {
                    return Ok("Generated summary.".to_string());
                }

                let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(current, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if let Some(failing) = self.fail_files.iter().find(|f| prompt.contains(f.as_str())) {
                    return Err(anyhow::anyhow!("simulated timeout for {}", failing));
                }
                for (filename, body) in &self.responses {
                    if prompt.contains(filename.as_str()) {
                        return Ok(body.clone());
                    }
                }
                Ok(r#"{"findings": [], "suggestions": []}"#.to_string())
            })
        }

        fn is_available(&self) -> bool {
            self.available
        }
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_width() {
        let backend = Arc::new(FakeBackend::new().with_delay(Duration::from_millis(20)));
        let analyzer = FileAnalyzer::new(backend.clone(), 3, 1000);
        let files: Vec<FilePatch> = (0..8).map(|i| patch(&format!("f{}.rs", i))).collect();

        analyzer.analyze_files(&files, ReviewMode::Full, &HashMap::new()).await;

        assert!(backend.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(backend.max_in_flight.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let backend = Arc::new(
            FakeBackend::new()
                .respond("good.rs", &finding_json(2, "low"))
                .failing("bad.rs"),
        );
        let analyzer = FileAnalyzer::new(backend, 2, 1000);
        let files = vec![patch("good.rs"), patch("bad.rs")];

        let outcome = analyzer
            .analyze_files(&files, ReviewMode::Full, &HashMap::new())
            .await;

        assert_eq!(outcome.findings.len(), 2);
        assert_eq!(outcome.failed_files, vec!["bad.rs".to_string()]);
        // 8.0 - 2 * 0.2 (low findings) - 0.5 (failed file)
        assert!((outcome.score - 7.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unavailable_backend_degrades_quietly() {
        let backend = Arc::new(FakeBackend::new().unavailable());
        let analyzer = FileAnalyzer::new(backend, 2, 1000);
        let files = vec![patch("a.rs"), patch("b.rs")];

        let outcome = analyzer
            .analyze_files(&files, ReviewMode::Full, &HashMap::new())
            .await;

        assert!(outcome.findings.is_empty());
        assert!(outcome.failed_files.is_empty());
        assert_eq!(outcome.score, BASE_SCORE);
        // Deterministic fallback summary, not an LLM call.
        assert!(outcome.summary.contains("Analyzed 2 files"));
    }

    #[tokio::test]
    async fn test_historical_findings_switch_to_verify_prompt() {
        let backend = Arc::new(FakeBackend::new());
        let analyzer = FileAnalyzer::new(backend.clone(), 2, 1000);
        let files = vec![patch("tracked.rs"), patch("fresh.rs")];
        let mut history = HashMap::new();
        history.insert(
            "tracked.rs".to_string(),
            vec![FindingSummary {
                finding_type: "bug".to_string(),
                line: Some(3),
                severity: Severity::High,
                description: "old issue".to_string(),
                suggestion: String::new(),
            }],
        );

        analyzer.analyze_files(&files, ReviewMode::Full, &history).await;

        let prompts = backend.prompts.lock().unwrap_or_else(|e| e.into_inner());
        let tracked = prompts
            .iter()
            .find(|p| p.contains("tracked.rs") && !p.contains("summary"))
            .unwrap();
        assert!(tracked.contains("still unresolved"));
        let fresh = prompts
            .iter()
            .find(|p| p.contains("fresh.rs") && !p.contains("summary"))
            .unwrap();
        assert!(!fresh.contains("still unresolved"));
    }

    #[tokio::test]
    async fn test_findings_and_suggestions_are_capped() {
        let many_suggestions: Vec<String> =
            (0..30).map(|i| format!("\"tip {}\"", i)).collect();
        let body = format!(
            r#"{{"findings": {}, "suggestions": [{}]}}"#,
            serde_json::to_string(
                &(0..40)
                    .map(|i| serde_json::json!({"type": "bug", "severity": "low", "description": format!("d{}", i)}))
                    .collect::<Vec<_>>()
            )
            .unwrap(),
            many_suggestions.join(",")
        );
        let backend = Arc::new(FakeBackend::new().respond("big.rs", &body));
        let analyzer = FileAnalyzer::new(backend, 1, 1000);

        let outcome = analyzer
            .analyze_files(&[patch("big.rs")], ReviewMode::Full, &HashMap::new())
            .await;

        assert_eq!(outcome.findings.len(), MAX_FINDINGS);
        assert_eq!(outcome.suggestions.len(), MAX_SUGGESTIONS);
    }

    #[tokio::test]
    async fn test_filename_injected_into_findings() {
        let backend = Arc::new(FakeBackend::new().respond("target.rs", &finding_json(1, "high")));
        let analyzer = FileAnalyzer::new(backend, 1, 1000);

        let outcome = analyzer
            .analyze_files(&[patch("target.rs")], ReviewMode::Full, &HashMap::new())
            .await;

        assert_eq!(outcome.findings[0].filename, "target.rs");
    }

    #[test]
    fn test_score_floors_at_minimum() {
        let findings: Vec<Finding> = (0..20)
            .map(|_| Finding {
                finding_type: "bug".to_string(),
                filename: "f.rs".to_string(),
                line: None,
                severity: Severity::High,
                description: "bad".to_string(),
                suggestion: String::new(),
            })
            .collect();
        assert_eq!(compute_score(&findings, 5, 0), MIN_SCORE);
    }

    #[test]
    fn test_score_penalizes_large_reviews() {
        let small = compute_score(&[], 10, 0);
        let large = compute_score(&[], 11, 0);
        assert!((small - BASE_SCORE).abs() < 1e-9);
        assert!((large - (BASE_SCORE - LARGE_REVIEW_PENALTY)).abs() < 1e-9);
    }

    #[test]
    fn test_score_failed_file_not_better_than_excluded() {
        // A failed file can only lower the score relative to excluding it.
        let with_failure = compute_score(&[], 3, 1);
        let without = compute_score(&[], 2, 0);
        assert!(with_failure <= without);
    }

    #[test]
    fn test_fallback_summary_mentions_failures() {
        let summary = fallback_summary(1, 2, 5, 2);
        assert!(summary.contains("1 high"));
        assert!(summary.contains("2 files could not be analyzed"));
    }
}
