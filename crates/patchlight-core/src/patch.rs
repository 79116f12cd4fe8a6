use serde::{Deserialize, Serialize};

/// How a file was changed between the two refs of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditKind {
    Added,
    Deleted,
    Renamed,
    Modified,
}

impl EditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditKind::Added => "added",
            EditKind::Deleted => "deleted",
            EditKind::Renamed => "renamed",
            EditKind::Modified => "modified",
        }
    }
}

/// One changed file as reported by the diff provider.
///
/// Contents are opaque text as far as the engine is concerned: full old/new
/// file bodies plus the unified diff between them. Line counts are derived
/// from the diff at construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePatch {
    pub filename: String,
    /// Previous path when the file was renamed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_filename: Option<String>,
    pub edit_kind: EditKind,
    #[serde(default)]
    pub old_content: String,
    #[serde(default)]
    pub new_content: String,
    /// Unified diff text for this file.
    #[serde(default)]
    pub patch: String,
    pub num_added_lines: usize,
    pub num_removed_lines: usize,
}

impl FilePatch {
    pub fn new(
        filename: impl Into<String>,
        old_filename: Option<String>,
        edit_kind: EditKind,
        old_content: String,
        new_content: String,
        patch: String,
    ) -> Self {
        let (num_added_lines, num_removed_lines) = count_patch_lines(&patch);
        Self {
            filename: filename.into(),
            old_filename,
            edit_kind,
            old_content,
            new_content,
            patch,
            num_added_lines,
            num_removed_lines,
        }
    }

    /// Total changed-line count, used for selection priority.
    pub fn changed_lines(&self) -> usize {
        self.num_added_lines + self.num_removed_lines
    }

    /// File extension including the leading dot, lowercased. Empty when the
    /// filename has none.
    pub fn extension(&self) -> String {
        match self.filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => {
                format!(".{}", ext.to_ascii_lowercase())
            }
            _ => String::new(),
        }
    }
}

fn count_patch_lines(patch: &str) -> (usize, usize) {
    let mut added = 0;
    let mut removed = 0;
    for line in patch.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            added += 1;
        } else if line.starts_with('-') {
            removed += 1;
        }
    }
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATCH: &str = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,3 +1,4 @@\n-fn old() {}\n+fn new_one() {}\n+fn new_two() {}\n context\n";

    #[test]
    fn test_line_counts_skip_file_headers() {
        let patch = FilePatch::new(
            "src/lib.rs",
            None,
            EditKind::Modified,
            String::new(),
            String::new(),
            PATCH.to_string(),
        );
        assert_eq!(patch.num_added_lines, 2);
        assert_eq!(patch.num_removed_lines, 1);
        assert_eq!(patch.changed_lines(), 3);
    }

    #[test]
    fn test_extension_lowercased_with_dot() {
        let patch = FilePatch::new(
            "Src/Main.RS",
            None,
            EditKind::Added,
            String::new(),
            String::new(),
            String::new(),
        );
        assert_eq!(patch.extension(), ".rs");
    }

    #[test]
    fn test_extension_empty_for_dotless_and_hidden_files() {
        let none = FilePatch::new(
            "Makefile",
            None,
            EditKind::Added,
            String::new(),
            String::new(),
            String::new(),
        );
        assert_eq!(none.extension(), "");

        let hidden = FilePatch::new(
            ".gitignore",
            None,
            EditKind::Added,
            String::new(),
            String::new(),
            String::new(),
        );
        assert_eq!(hidden.extension(), "");
    }

    #[test]
    fn test_edit_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&EditKind::Renamed).unwrap(),
            "\"renamed\""
        );
    }
}
