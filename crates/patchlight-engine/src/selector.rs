//! Budget-constrained selection of which changed files enter analysis.
//!
//! Two layers: an ignore-glob set that always applies (build artifacts,
//! vendor trees, lockfiles), and optional smart filtering that ranks files
//! by extension priority plus a large-diff bonus, then greedily accepts
//! files while the running cost estimate stays under the per-review ceiling.
//! The greedy cutoff is deliberate: once a file would exceed the ceiling,
//! everything after it is excluded too, keeping selection deterministic.

use patchlight_adapters::config::{file_priority, model_cost, Config, ModelCost};
use patchlight_core::FilePatch;
use regex::Regex;
use tracing::{debug, info};

/// Flat output-token allowance per analysis call, used in cost estimates.
const OUTPUT_TOKEN_ALLOWANCE: f64 = 1_000.0;

/// Rough tokens-per-character ratio for cost estimation.
const CHARS_PER_TOKEN: f64 = 4.0;

/// Result of selection: the ordered analysis set plus how many changed files
/// were left out, for reporting.
#[derive(Debug, Clone)]
pub struct Selection {
    pub files: Vec<FilePatch>,
    pub excluded: usize,
}

#[derive(Clone)]
pub struct CostSelector {
    max_files: usize,
    smart_filtering: bool,
    cost_ceiling: f64,
    cost: ModelCost,
    ignore: Vec<Regex>,
}

impl CostSelector {
    pub fn new(
        max_files: usize,
        smart_filtering: bool,
        cost_ceiling: f64,
        cost: ModelCost,
        ignore_patterns: &[String],
    ) -> Self {
        let ignore = ignore_patterns
            .iter()
            .filter_map(|pattern| Regex::new(&glob_to_regex(pattern)).ok())
            .collect();
        Self {
            max_files,
            smart_filtering,
            cost_ceiling,
            cost,
            ignore,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_files_per_review,
            config.smart_filtering,
            config.max_cost_per_review,
            model_cost(&config.default_model),
            &config.ignore_path_patterns,
        )
    }

    /// Apply ignore globs, then smart filtering or a plain truncation.
    pub fn select(&self, files: Vec<FilePatch>) -> Selection {
        let total = files.len();
        let candidates: Vec<FilePatch> = files
            .into_iter()
            .filter(|patch| {
                let ignored = self.is_ignored(&patch.filename);
                if ignored {
                    debug!("ignoring {} (matches ignore pattern)", patch.filename);
                }
                !ignored
            })
            .collect();

        let selected = if self.smart_filtering {
            self.select_by_priority(candidates)
        } else {
            let mut kept = candidates;
            kept.truncate(self.max_files);
            kept
        };

        let excluded = total - selected.len();
        if excluded > 0 {
            info!("selected {}/{} changed files for analysis", selected.len(), total);
        }
        Selection {
            files: selected,
            excluded,
        }
    }

    fn select_by_priority(&self, candidates: Vec<FilePatch>) -> Vec<FilePatch> {
        let mut ranked: Vec<(i32, FilePatch)> = candidates
            .into_iter()
            .filter_map(|patch| {
                let base = file_priority(&patch.extension());
                if base == 0 {
                    // Zero-priority extensions are excluded entirely.
                    return None;
                }
                let changed = patch.changed_lines();
                let bonus = if changed > 100 {
                    2
                } else if changed > 50 {
                    1
                } else {
                    0
                };
                Some((base + bonus, patch))
            })
            .collect();

        // Stable sort keeps the original order among equal priorities.
        ranked.sort_by_key(|(priority, _)| std::cmp::Reverse(*priority));

        let mut selected = Vec::new();
        let mut running_cost = 0.0;
        for (_, patch) in ranked {
            let cost = self.estimate_file_cost(&patch);
            if running_cost + cost > self.cost_ceiling {
                // Greedy cutoff: later files are out even if they would fit.
                break;
            }
            running_cost += cost;
            selected.push(patch);
        }

        selected.truncate(self.max_files);
        selected
    }

    /// Estimated spend for one file's analysis call, in USD.
    pub fn estimate_file_cost(&self, patch: &FilePatch) -> f64 {
        let chars = patch.patch.len() + patch.new_content.len();
        let input_tokens = chars as f64 / CHARS_PER_TOKEN;
        (input_tokens * self.cost.input + OUTPUT_TOKEN_ALLOWANCE * self.cost.output) / 1_000.0
    }

    /// Estimated spend for the whole selection, reported in result metadata.
    pub fn estimate_total_cost(&self, files: &[FilePatch]) -> f64 {
        files.iter().map(|f| self.estimate_file_cost(f)).sum()
    }

    fn is_ignored(&self, filename: &str) -> bool {
        let normalized = normalize_path(filename);
        self.ignore.iter().any(|re| re.is_match(&normalized))
    }
}

fn normalize_path(path: &str) -> String {
    let mut normalized = path.replace('\\', "/");
    while let Some(stripped) = normalized.strip_prefix("./") {
        normalized = stripped.to_string();
    }
    normalized
}

/// Translate an fnmatch-style glob to an anchored regex. `*` crosses
/// directory separators, matching the behavior the ignore list was written
/// against.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push('^');
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out.push('$');
    out
}
