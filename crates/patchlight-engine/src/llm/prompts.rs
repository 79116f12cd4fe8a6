//! Prompt construction for per-file analysis and review summaries.

use patchlight_core::{FilePatch, FindingSummary, ReviewMode};

/// JSON Schema for the per-file analysis response. Passed to backends that
/// support structured output; the repair chain handles the rest.
pub fn analysis_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "findings": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "type": {"type": "string", "description": "Issue category"},
                        "line_number": {"type": "integer", "description": "Line in the new file"},
                        "severity": {"type": "string", "enum": ["high", "medium", "low"]},
                        "description": {"type": "string"},
                        "suggestion": {"type": "string", "description": "How to fix it"}
                    },
                    "required": ["type", "severity", "description"]
                }
            },
            "suggestions": {
                "type": "array",
                "items": {"type": "string"},
                "description": "File-level improvement suggestions"
            }
        },
        "required": ["findings", "suggestions"]
    })
}

/// System prompt shared by every per-file analysis call, sharpened by mode.
pub fn system_prompt(mode: ReviewMode) -> String {
    let base = "You are a senior code reviewer analyzing one changed file from a merge request. \
                Report concrete, actionable issues with line numbers. \
                Respond with a JSON object containing \"findings\" and \"suggestions\".";
    match mode {
        ReviewMode::Security => format!(
            "{} Concentrate on security defects: injection, unsafe deserialization, \
             authentication bypass, secret handling, path traversal.",
            base
        ),
        ReviewMode::Performance => format!(
            "{} Concentrate on performance defects: algorithmic complexity, repeated queries, \
             blocking I/O on hot paths, unbounded memory growth.",
            base
        ),
        ReviewMode::Quick => format!(
            "{} Keep it to obvious problems and convention violations; skip speculative issues.",
            base
        ),
        ReviewMode::Full => base.to_string(),
    }
}

/// Combine full (length-capped) file content with the diff into one analysis
/// payload. Files with no retrievable content fall back to the diff alone.
pub fn build_analysis_payload(patch: &FilePatch, max_file_lines: usize) -> String {
    let full_content = if !patch.new_content.is_empty() {
        patch.new_content.as_str()
    } else {
        patch.old_content.as_str()
    };

    if full_content.is_empty() {
        return format!(
            "File: {}\nChange kind: {}\n\nDiff:\n```diff\n{}\n```",
            patch.filename,
            patch.edit_kind.as_str(),
            patch.patch
        );
    }

    let truncated = truncate_lines(full_content, max_file_lines);
    format!(
        "File: {}\nChange kind: {}\n\nFull file content:\n```\n{}\n```\n\nDiff:\n```diff\n{}\n```",
        patch.filename,
        patch.edit_kind.as_str(),
        truncated,
        patch.patch
    )
}

/// First-pass review prompt for a file with no prior findings.
pub fn first_pass_prompt(payload: &str, mode: ReviewMode) -> String {
    format!(
        "Review the following file change, focusing on: {}.\n\n{}\n\n\
         Report specific problems with line numbers and a concrete fix for each. \
         This is a single-file review; judge the file on its own, not the wider architecture.",
        mode.focus_areas().join(", "),
        payload
    )
}

/// Incremental re-review prompt for a file with findings from an earlier
/// submission of the same logical task. Narrows the analysis instead of
/// repeating a general review.
pub fn verify_fix_prompt(payload: &str, history: &[FindingSummary]) -> String {
    let mut prior = String::new();
    for (i, finding) in history.iter().enumerate() {
        prior.push_str(&format!(
            "{}. [{}] {} (line {}): {}\n",
            i + 1,
            finding.severity.as_str(),
            finding.finding_type,
            finding
                .line
                .map(|l| l.to_string())
                .unwrap_or_else(|| "?".to_string()),
            finding.description
        ));
    }

    format!(
        "This file was reviewed before for the same work item. Previously reported issues:\n{}\n\
         {}\n\n\
         Verify the fixes instead of re-reviewing from scratch. Report a finding only if:\n\
         (a) one of the issues above is still unresolved, or\n\
         (b) the new changes introduce a severe new problem.\n\
         If everything above is fixed and nothing severe was added, return empty findings.",
        prior, payload
    )
}

/// Prompt for the overall review summary, built from aggregate counts.
pub fn summary_prompt(
    high: usize,
    medium: usize,
    low: usize,
    files_analyzed: usize,
    failed_files: usize,
    suggestions: usize,
) -> String {
    format!(
        "Write a two or three sentence summary of a code review with these results:\n\
         - files analyzed: {}\n\
         - high severity findings: {}\n\
         - medium severity findings: {}\n\
         - low severity findings: {}\n\
         - files whose analysis failed: {}\n\
         - improvement suggestions: {}\n\
         Assess overall quality and the main direction for improvement. Plain text only.",
        files_analyzed, high, medium, low, failed_files, suggestions
    )
}

fn truncate_lines(content: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() <= max_lines {
        return content.to_string();
    }
    let mut out = lines[..max_lines].join("\n");
    out.push_str(&format!(
        "\n... [file truncated, original length {} lines]",
        lines.len()
    ));
    out
}
