//! Configuration management for patchlight
//!
//! Settings live in ~/.config/patchlight/config.toml. Every field can be
//! overridden from the environment, which is how deployments are expected to
//! inject credentials.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

fn default_api_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4".to_string()
}

fn default_fallback_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_scm_base_url() -> String {
    "https://gitlab.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_completion_tokens() -> u32 {
    2_000
}

fn default_max_files_per_review() -> usize {
    50
}

fn default_max_file_lines() -> usize {
    1_000
}

fn default_max_concurrent_file_reviews() -> usize {
    5
}

fn default_smart_filtering() -> bool {
    true
}

fn default_max_cost_per_review() -> f64 {
    0.50
}

fn default_review_cache_ttl_days() -> u64 {
    7
}

fn default_history_cache_ttl_days() -> u64 {
    30
}

fn default_task_ttl_secs() -> u64 {
    86_400
}

/// Paths and file types that never enter a review, regardless of smart
/// filtering. Glob syntax, `*` crosses directory separators.
fn default_ignore_path_patterns() -> Vec<String> {
    [
        "node_modules/*",
        "*/node_modules/*",
        "dist/*",
        "*/dist/*",
        "build/*",
        "*/build/*",
        "target/*",
        "*/target/*",
        "out/*",
        "*/out/*",
        "venv/*",
        "*/venv/*",
        ".venv/*",
        "*/.venv/*",
        "__pycache__/*",
        "*/__pycache__/*",
        ".git/*",
        "*/.git/*",
        ".idea/*",
        "*/.idea/*",
        ".vscode/*",
        "*/.vscode/*",
        "coverage/*",
        "*/coverage/*",
        "vendor/*",
        "*/vendor/*",
        "*.min.js",
        "*.min.css",
        "*.lock",
        "*.log",
        "*.tmp",
        "*.cache",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Completion-service API key. Usually injected via PATCHLIGHT_API_KEY.
    pub api_key: Option<String>,
    pub api_base_url: String,
    pub default_model: String,
    pub fallback_model: String,
    pub request_timeout_secs: u64,
    pub max_completion_tokens: u32,

    /// VCS host the diff provider talks to.
    pub scm_base_url: String,
    pub scm_token: Option<String>,

    pub max_files_per_review: usize,
    pub max_file_lines: usize,
    pub max_concurrent_file_reviews: usize,
    pub smart_filtering: bool,
    /// Per-review spend ceiling in USD.
    pub max_cost_per_review: f64,
    pub ignore_path_patterns: Vec<String>,

    pub review_cache_ttl_days: u64,
    pub history_cache_ttl_days: u64,
    pub task_ttl_secs: u64,

    /// Directory for the file-backed store. Defaults to the platform data
    /// dir when unset.
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base_url: default_api_base_url(),
            default_model: default_model(),
            fallback_model: default_fallback_model(),
            request_timeout_secs: default_request_timeout_secs(),
            max_completion_tokens: default_max_completion_tokens(),
            scm_base_url: default_scm_base_url(),
            scm_token: None,
            max_files_per_review: default_max_files_per_review(),
            max_file_lines: default_max_file_lines(),
            max_concurrent_file_reviews: default_max_concurrent_file_reviews(),
            smart_filtering: default_smart_filtering(),
            max_cost_per_review: default_max_cost_per_review(),
            ignore_path_patterns: default_ignore_path_patterns(),
            review_cache_ttl_days: default_review_cache_ttl_days(),
            history_cache_ttl_days: default_history_cache_ttl_days(),
            task_ttl_secs: default_task_ttl_secs(),
            data_dir: None,
        }
    }
}

impl Config {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("patchlight"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load config from disk, apply environment overrides, or fall back to
    /// defaults. A corrupt file is preserved as a backup and replaced with
    /// defaults rather than aborting startup.
    pub fn load() -> Self {
        let mut config = Self::load_file().unwrap_or_default();
        config.apply_env();
        config
    }

    fn load_file() -> Option<Self> {
        let path = Self::config_path()?;
        let content = fs::read_to_string(&path).ok()?;
        match toml::from_str::<Config>(&content) {
            Ok(config) => Some(config),
            Err(err) => {
                warn!("config file {} is corrupt: {}", path.display(), err);
                preserve_corrupt_config(&path, &content);
                None
            }
        }
    }

    /// Save config to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
        fs::create_dir_all(&dir)?;
        let path = dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Environment variables win over the config file.
    pub fn apply_env(&mut self) {
        if let Ok(key) = env::var("PATCHLIGHT_API_KEY").or_else(|_| env::var("OPENAI_API_KEY")) {
            if !key.trim().is_empty() {
                self.api_key = Some(key.trim().to_string());
            }
        }
        if let Ok(url) = env::var("PATCHLIGHT_API_BASE") {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().trim_end_matches('/').to_string();
            }
        }
        if let Ok(model) = env::var("PATCHLIGHT_MODEL") {
            if !model.trim().is_empty() {
                self.default_model = model.trim().to_string();
            }
        }
        if let Ok(model) = env::var("PATCHLIGHT_FALLBACK_MODEL") {
            if !model.trim().is_empty() {
                self.fallback_model = model.trim().to_string();
            }
        }
        if let Ok(url) = env::var("PATCHLIGHT_SCM_URL") {
            if !url.trim().is_empty() {
                self.scm_base_url = url.trim().trim_end_matches('/').to_string();
            }
        }
        if let Ok(token) = env::var("PATCHLIGHT_SCM_TOKEN") {
            if !token.trim().is_empty() {
                self.scm_token = Some(token.trim().to_string());
            }
        }
        if let Some(n) = parse_env("PATCHLIGHT_MAX_FILES") {
            self.max_files_per_review = n;
        }
        if let Some(n) = parse_env("PATCHLIGHT_MAX_FILE_LINES") {
            self.max_file_lines = n;
        }
        if let Some(n) = parse_env("PATCHLIGHT_MAX_CONCURRENT_FILE_REVIEWS") {
            self.max_concurrent_file_reviews = n;
        }
        if let Some(v) = parse_env::<f64>("PATCHLIGHT_MAX_COST_PER_REVIEW") {
            self.max_cost_per_review = v;
        }
        if let Some(v) = parse_env::<bool>("PATCHLIGHT_SMART_FILTERING") {
            self.smart_filtering = v;
        }
        if let Ok(raw) = env::var("PATCHLIGHT_IGNORE_PATTERNS") {
            let patterns: Vec<String> = raw
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if !patterns.is_empty() {
                self.ignore_path_patterns = patterns;
            }
        }
        if let Ok(dir) = env::var("PATCHLIGHT_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = Some(PathBuf::from(dir.trim()));
            }
        }
    }

    /// Directory for the file-backed store.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("patchlight")
        })
    }

    pub fn review_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.review_cache_ttl_days * 24 * 60 * 60)
    }

    pub fn history_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.history_cache_ttl_days * 24 * 60 * 60)
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

fn preserve_corrupt_config(path: &std::path::Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

/// Per-1k-token pricing for a model, in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
}

/// Pricing table for cost estimation. Unknown models get a conservative
/// default rather than zero so the selector still bounds spend.
pub fn model_cost(model: &str) -> ModelCost {
    match model {
        "gpt-4" => ModelCost {
            input: 0.03,
            output: 0.06,
        },
        "gpt-4-turbo" => ModelCost {
            input: 0.01,
            output: 0.03,
        },
        "gpt-3.5-turbo" => ModelCost {
            input: 0.001,
            output: 0.002,
        },
        "claude-3-sonnet" => ModelCost {
            input: 0.015,
            output: 0.075,
        },
        "claude-3-haiku" => ModelCost {
            input: 0.00025,
            output: 0.00125,
        },
        _ => ModelCost {
            input: 0.01,
            output: 0.03,
        },
    }
}

/// Selection priority by file extension. Zero means the file is excluded
/// from smart-filtered reviews entirely; unknown extensions sit mid-table.
pub fn file_priority(extension: &str) -> i32 {
    match extension {
        ".py" | ".js" | ".ts" | ".java" | ".go" | ".rs" => 10,
        ".cpp" | ".c" | ".cs" | ".php" | ".rb" => 9,
        ".yaml" | ".yml" | ".json" => 7,
        ".xml" | ".html" => 6,
        ".css" | ".scss" | ".less" => 5,
        ".md" => 3,
        ".txt" | ".rst" => 2,
        ".png" | ".jpg" | ".gif" | ".svg" => 1,
        ".lock" | ".log" | ".tmp" | ".cache" => 0,
        _ => 5,
    }
}
