use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named review category. Each mode carries a focus-area set that shapes the
/// analysis prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReviewMode {
    #[default]
    Full,
    Security,
    Performance,
    Quick,
}

impl ReviewMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewMode::Full => "full",
            ReviewMode::Security => "security",
            ReviewMode::Performance => "performance",
            ReviewMode::Quick => "quick",
        }
    }

    pub fn focus_areas(&self) -> &'static [&'static str] {
        match self {
            ReviewMode::Full => &["quality", "security", "performance", "maintainability"],
            ReviewMode::Security => &["security", "vulnerabilities", "data protection"],
            ReviewMode::Performance => &["performance", "optimization", "scalability"],
            ReviewMode::Quick => &["basic quality", "syntax", "conventions"],
        }
    }

    pub fn all() -> &'static [ReviewMode] {
        &[
            ReviewMode::Full,
            ReviewMode::Security,
            ReviewMode::Performance,
            ReviewMode::Quick,
        ]
    }
}

impl fmt::Display for ReviewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(ReviewMode::Full),
            "security" => Ok(ReviewMode::Security),
            "performance" => Ok(ReviewMode::Performance),
            "quick" => Ok(ReviewMode::Quick),
            other => Err(anyhow::anyhow!("Unknown review mode '{}'", other)),
        }
    }
}

/// Severity of a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    #[default]
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    /// Parse model-reported severities, falling back to low for anything
    /// outside the allowed set.
    pub fn parse_lossy(raw: &str) -> Severity {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" | "critical" => Severity::High,
            "medium" | "warning" => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

/// One reported issue with its location and suggested fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(rename = "type", default)]
    pub finding_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub suggestion: String,
}

/// Reduced finding form stored in the historical ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingSummary {
    #[serde(rename = "type", default)]
    pub finding_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub suggestion: String,
}

impl From<&Finding> for FindingSummary {
    fn from(finding: &Finding) -> Self {
        Self {
            finding_type: finding.finding_type.clone(),
            line: finding.line,
            severity: finding.severity,
            description: finding.description.clone(),
            suggestion: finding.suggestion.clone(),
        }
    }
}

/// One review request: which project, which refs, how to review, and the
/// optional logical task correlating repeated submissions of the same work
/// item. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub project: String,
    pub source_branch: String,
    /// Commit hash of the source ref when the caller knows it. Enables the
    /// content-addressed cache keyspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_commit: Option<String>,
    pub target_branch: String,
    #[serde(default)]
    pub mode: ReviewMode,
    /// Caller-supplied work-item identifier chaining historical findings
    /// across commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl ChangeSet {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.project.trim().is_empty() {
            return Err(anyhow::anyhow!("project must not be empty"));
        }
        if self.source_branch.trim().is_empty() {
            return Err(anyhow::anyhow!("source_branch must not be empty"));
        }
        if self.target_branch.trim().is_empty() {
            return Err(anyhow::anyhow!("target_branch must not be empty"));
        }
        Ok(())
    }
}

/// Aggregate counters attached to a finished review.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewStatistics {
    pub files_analyzed: usize,
    /// Files dropped by the cost selector.
    #[serde(default)]
    pub files_excluded: usize,
    #[serde(default)]
    pub total_additions: usize,
    #[serde(default)]
    pub total_deletions: usize,
    /// Files whose analysis unit failed; these penalize the score but do not
    /// fail the review.
    #[serde(default)]
    pub failed_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewMetadata {
    pub model: String,
    pub reviewed_at: DateTime<Utc>,
    #[serde(default)]
    pub cost_estimate: f64,
}

/// Completed review as returned to callers and persisted in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub review_id: String,
    pub mode: ReviewMode,
    pub score: f64,
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub statistics: ReviewStatistics,
    pub metadata: ReviewMetadata,
    /// Set on results replayed from a cache keyspace rather than computed.
    #[serde(default)]
    pub from_cache: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip() {
        for mode in ReviewMode::all() {
            let parsed: ReviewMode = mode.as_str().parse().unwrap();
            assert_eq!(parsed, *mode);
        }
    }

    #[test]
    fn test_mode_rejects_unknown() {
        assert!("style".parse::<ReviewMode>().is_err());
    }

    #[test]
    fn test_severity_parse_lossy_falls_back_to_low() {
        assert_eq!(Severity::parse_lossy("HIGH"), Severity::High);
        assert_eq!(Severity::parse_lossy("warning"), Severity::Medium);
        assert_eq!(Severity::parse_lossy("banana"), Severity::Low);
        assert_eq!(Severity::parse_lossy(""), Severity::Low);
    }

    #[test]
    fn test_changeset_validation() {
        let mut change = ChangeSet {
            project: "group/app".to_string(),
            source_branch: "feature/login".to_string(),
            source_commit: None,
            target_branch: "develop".to_string(),
            mode: ReviewMode::Full,
            task_id: Some("JIRA-123".to_string()),
        };
        assert!(change.validate().is_ok());

        change.target_branch = "  ".to_string();
        assert!(change.validate().is_err());
    }

    #[test]
    fn test_finding_summary_reduction_keeps_location() {
        let finding = Finding {
            finding_type: "sql_injection".to_string(),
            filename: "db.py".to_string(),
            line: Some(42),
            severity: Severity::High,
            description: "string-built query".to_string(),
            suggestion: "use bound parameters".to_string(),
        };
        let summary = FindingSummary::from(&finding);
        assert_eq!(summary.line, Some(42));
        assert_eq!(summary.severity, Severity::High);
        assert_eq!(summary.finding_type, "sql_injection");
    }

    #[test]
    fn test_finding_deserializes_with_defaults() {
        let finding: Finding = serde_json::from_str(r#"{"description": "x"}"#).unwrap();
        assert_eq!(finding.severity, Severity::Low);
        assert!(finding.finding_type.is_empty());
        assert!(finding.line.is_none());
    }
}
