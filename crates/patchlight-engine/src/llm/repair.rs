//! Best-effort repair of malformed analysis output.
//!
//! Models are asked for a JSON object with `findings` and `suggestions`, and
//! return one most of the time. The rest arrives wrapped in markdown fences,
//! surrounded by prose, with trailing commas, bare keys, or single-quoted
//! strings. This module runs an ordered salvage chain and always produces a
//! usable result:
//!
//! 1. strip markdown code fences
//! 2. extract the first balanced `{...}` span (string-aware brace counting)
//! 3. conservative textual fixes, then a structural parse
//! 4. aggressive extraction of just the `findings` / `suggestions` array
//!    bodies, reassembled into a minimal object
//! 5. an empty-findings result carrying a diagnostic suggestion
//!
//! Each tier is independently testable; the chain returns the first tier
//! that yields a structurally valid object. Parsed objects are then coerced:
//! missing fields get safe defaults, invalid severities fall back to low,
//! non-object findings and non-string suggestions are dropped.

use patchlight_core::{Finding, Severity};
use regex::Regex;
use serde_json::Value;

/// Suggestion text attached when no tier could recover anything.
const PARSE_FAILURE_SUGGESTION: &str =
    "Analysis response could not be parsed; re-run the review or inspect the raw model output.";

/// Typed result of the salvage chain. Never an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepairedAnalysis {
    pub findings: Vec<Finding>,
    pub suggestions: Vec<String>,
}

impl RepairedAnalysis {
    fn parse_failure() -> Self {
        Self {
            findings: Vec::new(),
            suggestions: vec![PARSE_FAILURE_SUGGESTION.to_string()],
        }
    }
}

/// Run the salvage chain over raw model output.
pub fn repair_analysis(raw: &str) -> RepairedAnalysis {
    let unfenced = strip_markdown_fences(raw);

    let mut candidates: Vec<String> = Vec::new();
    push_candidate(&mut candidates, unfenced);
    if let Some(span) = extract_balanced_span(unfenced, '{', '}') {
        push_candidate(&mut candidates, span);
    }
    // Textually repaired variants of everything collected so far.
    for i in 0..candidates.len() {
        let fixed = fix_json_issues(&candidates[i]);
        push_candidate(&mut candidates, &fixed);
    }

    for candidate in &candidates {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return coerce_analysis(value);
        }
    }

    // Aggressive fallback: pull out just the array bodies and rebuild a
    // minimal object around them.
    if let Some(value) = extract_arrays_aggressively(unfenced) {
        return coerce_analysis(value);
    }

    RepairedAnalysis::parse_failure()
}

fn push_candidate(candidates: &mut Vec<String>, candidate: &str) {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return;
    }
    if !candidates.iter().any(|existing| existing == trimmed) {
        candidates.push(trimmed.to_string());
    }
}

/// Strip markdown code fences from a response.
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if trimmed.starts_with("```json") {
        trimmed.strip_prefix("```json").unwrap_or(trimmed)
    } else if trimmed.starts_with("```") {
        trimmed.strip_prefix("```").unwrap_or(trimmed)
    } else {
        trimmed
    };
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

/// Extract the first balanced fragment between matching delimiters,
/// ignoring delimiters inside string literals.
fn extract_balanced_span(text: &str, open: char, close: char) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    let mut start_idx = None;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if c == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }

        if c == open {
            if depth == 0 {
                start_idx = Some(i);
            }
            depth += 1;
        } else if c == close && depth > 0 {
            depth -= 1;
            if depth == 0 {
                if let Some(start) = start_idx {
                    return Some(&text[start..=i]);
                }
            }
        }
    }

    None
}

/// Conservative textual fixes for common model mistakes. Applied before a
/// structural parse; anything this breaks would not have parsed anyway.
fn fix_json_issues(json: &str) -> String {
    let mut fixed = json.to_string();

    // Smart quotes to regular quotes.
    fixed = fixed.replace('\u{201C}', "\"");
    fixed = fixed.replace('\u{201D}', "\"");
    fixed = fixed.replace('\u{2018}', "'");
    fixed = fixed.replace('\u{2019}', "'");

    // Quote bare object keys: {type: ...} -> {"type": ...}
    if let Ok(re) = Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)"#) {
        fixed = re.replace_all(&fixed, "$1\"$2\"$3").into_owned();
    }

    // Single-quoted string values to double-quoted.
    if let Ok(re) = Regex::new(r#"(:\s*)'([^'"]*)'"#) {
        fixed = re.replace_all(&fixed, "$1\"$2\"").into_owned();
    }

    // Trailing commas before a closing bracket.
    if let Ok(re) = Regex::new(r#",(\s*[}\]])"#) {
        fixed = re.replace_all(&fixed, "$1").into_owned();
    }

    // Control characters that slipped into the payload.
    fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Last-resort tier: locate the `findings` and `suggestions` array bodies by
/// pattern search and reassemble a minimal object.
fn extract_arrays_aggressively(text: &str) -> Option<Value> {
    let findings = extract_named_array(text, "findings");
    let suggestions = extract_named_array(text, "suggestions");
    if findings.is_none() && suggestions.is_none() {
        return None;
    }

    let assembled = format!(
        "{{\"findings\": {}, \"suggestions\": {}}}",
        findings.as_deref().unwrap_or("[]"),
        suggestions.as_deref().unwrap_or("[]")
    );
    serde_json::from_str(&fix_json_issues(&assembled)).ok()
}

fn extract_named_array(text: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r#""?{}"?\s*:\s*\["#, name)).ok()?;
    let m = re.find(text)?;
    let from_bracket = &text[m.end() - 1..];
    extract_balanced_span(from_bracket, '[', ']').map(|s| s.to_string())
}

/// Schema validation and coercion: every parsed value becomes a well-formed
/// analysis, whatever shape the model actually produced.
fn coerce_analysis(value: Value) -> RepairedAnalysis {
    // A bare array is treated as the findings list.
    let object = match value {
        Value::Array(items) => {
            let mut map = serde_json::Map::new();
            map.insert("findings".to_string(), Value::Array(items));
            Value::Object(map)
        }
        other => other,
    };

    let findings = object
        .get("findings")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(coerce_finding).collect())
        .unwrap_or_default();

    let suggestions = object
        .get("suggestions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().to_string())
                .collect()
        })
        .unwrap_or_default();

    RepairedAnalysis {
        findings,
        suggestions,
    }
}

fn coerce_finding(item: &Value) -> Option<Finding> {
    // Non-object findings are dropped outright.
    let obj = item.as_object()?;

    let severity = obj
        .get("severity")
        .and_then(Value::as_str)
        .map(Severity::parse_lossy)
        .unwrap_or_default();

    let line = obj
        .get("line_number")
        .or_else(|| obj.get("line"))
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok());

    Some(Finding {
        finding_type: string_field(obj, "type").unwrap_or_else(|| "general".to_string()),
        filename: string_field(obj, "filename").unwrap_or_default(),
        line,
        severity,
        description: string_field(obj, "description")
            .or_else(|| string_field(obj, "message"))
            .unwrap_or_default(),
        suggestion: string_field(obj, "suggestion").unwrap_or_default(),
    })
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
