//! Diff provider: fetches changed files and file contents from the VCS host.
//!
//! The engine only needs two calls, expressed by [`DiffProvider`]. The
//! production implementation talks to a GitLab-compatible REST API; missing
//! files (new or deleted sides of a diff) come back as empty content rather
//! than errors.

use crate::store::BoxFuture;
use patchlight_core::{EditKind, FilePatch};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub trait DiffProvider: Send + Sync {
    /// Changed files between two refs, with full old/new contents attached.
    fn list_changed_files<'a>(
        &'a self,
        project: &'a str,
        base_ref: &'a str,
        head_ref: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Vec<FilePatch>>>;

    /// File contents at a ref. Empty string when the file does not exist.
    fn read_file<'a>(
        &'a self,
        project: &'a str,
        path: &'a str,
        git_ref: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>>;
}

// ---------------------------------------------------------------------------
// GitLab-compatible HTTP provider
// ---------------------------------------------------------------------------

const PROVIDER_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct CompareResponse {
    #[serde(default)]
    diffs: Vec<CompareDiff>,
}

#[derive(Debug, Deserialize)]
struct CompareDiff {
    #[serde(default)]
    old_path: String,
    #[serde(default)]
    new_path: String,
    #[serde(default)]
    new_file: bool,
    #[serde(default)]
    deleted_file: bool,
    #[serde(default)]
    renamed_file: bool,
    #[serde(default)]
    diff: String,
}

impl CompareDiff {
    fn edit_kind(&self) -> EditKind {
        if self.new_file {
            EditKind::Added
        } else if self.deleted_file {
            EditKind::Deleted
        } else if self.renamed_file {
            EditKind::Renamed
        } else {
            EditKind::Modified
        }
    }
}

pub struct GitLabProvider {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl GitLabProvider {
    pub fn new(base_url: &str, token: Option<String>) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| anyhow::anyhow!("invalid SCM base url '{}': {}", base_url, e))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    fn api_url(&self, tail: &str) -> String {
        format!("{}/api/v4/{}", self.base_url.as_str().trim_end_matches('/'), tail)
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.http.get(url);
        if let Some(token) = &self.token {
            builder = builder.header("PRIVATE-TOKEN", token);
        }
        builder
    }

    async fn fetch_compare(
        &self,
        project: &str,
        base_ref: &str,
        head_ref: &str,
    ) -> anyhow::Result<CompareResponse> {
        let url = self.api_url(&format!(
            "projects/{}/repository/compare",
            encode_path_component(project)
        ));
        let response = self
            .request(url)
            .query(&[("from", base_ref), ("to", head_ref)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "compare request for {} failed with status {}",
                project,
                response.status()
            ));
        }
        Ok(response.json().await?)
    }
}

impl DiffProvider for GitLabProvider {
    fn list_changed_files<'a>(
        &'a self,
        project: &'a str,
        base_ref: &'a str,
        head_ref: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Vec<FilePatch>>> {
        Box::pin(async move {
            let compare = self.fetch_compare(project, base_ref, head_ref).await?;
            debug!(
                "compare {}...{} in {}: {} changed files",
                base_ref,
                head_ref,
                project,
                compare.diffs.len()
            );

            let mut patches = Vec::with_capacity(compare.diffs.len());
            for entry in compare.diffs {
                let kind = entry.edit_kind();
                let old_content = if entry.new_file {
                    String::new()
                } else {
                    self.read_file(project, &entry.old_path, base_ref).await?
                };
                let new_content = if entry.deleted_file {
                    String::new()
                } else {
                    self.read_file(project, &entry.new_path, head_ref).await?
                };
                let old_filename = if entry.renamed_file {
                    Some(entry.old_path.clone())
                } else {
                    None
                };
                patches.push(FilePatch::new(
                    entry.new_path,
                    old_filename,
                    kind,
                    old_content,
                    new_content,
                    entry.diff,
                ));
            }
            Ok(patches)
        })
    }

    fn read_file<'a>(
        &'a self,
        project: &'a str,
        path: &'a str,
        git_ref: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let url = self.api_url(&format!(
                "projects/{}/repository/files/{}/raw",
                encode_path_component(project),
                encode_path_component(path)
            ));
            let response = match self.request(url).query(&[("ref", git_ref)]).send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!("error retrieving {} at {}: {}", path, git_ref, err);
                    return Ok(String::new());
                }
            };
            if response.status() == reqwest::StatusCode::NOT_FOUND {
                // New or deleted file; the empty side of the diff.
                return Ok(String::new());
            }
            if !response.status().is_success() {
                warn!(
                    "error retrieving {} at {}: status {}",
                    path,
                    git_ref,
                    response.status()
                );
                return Ok(String::new());
            }
            Ok(response.text().await.unwrap_or_default())
        })
    }
}

/// Percent-encode a project or file path for use as a single URL component,
/// the way the GitLab API expects (`group/app` -> `group%2Fapp`).
fn encode_path_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Static provider for tests
// ---------------------------------------------------------------------------

/// Serves a fixed set of patches; file reads return empty content.
#[derive(Default)]
pub struct StaticProvider {
    files: Vec<FilePatch>,
}

impl StaticProvider {
    pub fn new(files: Vec<FilePatch>) -> Self {
        Self { files }
    }
}

impl DiffProvider for StaticProvider {
    fn list_changed_files<'a>(
        &'a self,
        _project: &'a str,
        _base_ref: &'a str,
        _head_ref: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Vec<FilePatch>>> {
        Box::pin(async move { Ok(self.files.clone()) })
    }

    fn read_file<'a>(
        &'a self,
        _project: &'a str,
        _path: &'a str,
        _git_ref: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move { Ok(String::new()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_kind_mapping() {
        let added = CompareDiff {
            old_path: String::new(),
            new_path: "a.rs".to_string(),
            new_file: true,
            deleted_file: false,
            renamed_file: false,
            diff: String::new(),
        };
        assert_eq!(added.edit_kind(), EditKind::Added);

        let renamed = CompareDiff {
            old_path: "old.rs".to_string(),
            new_path: "new.rs".to_string(),
            new_file: false,
            deleted_file: false,
            renamed_file: true,
            diff: String::new(),
        };
        assert_eq!(renamed.edit_kind(), EditKind::Renamed);
    }

    #[test]
    fn test_encode_path_component() {
        assert_eq!(encode_path_component("group/app"), "group%2Fapp");
        assert_eq!(encode_path_component("src/main.rs"), "src%2Fmain.rs");
        assert_eq!(encode_path_component("plain"), "plain");
    }

    #[test]
    fn test_compare_response_parses_gitlab_shape() {
        let raw = r#"{
            "commit": {"id": "abc"},
            "diffs": [
                {"old_path": "a.rs", "new_path": "a.rs", "new_file": false,
                 "deleted_file": false, "renamed_file": false, "diff": "@@ -1 +1 @@"}
            ]
        }"#;
        let parsed: CompareResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.diffs.len(), 1);
        assert_eq!(parsed.diffs[0].new_path, "a.rs");
    }

    #[tokio::test]
    async fn test_static_provider_returns_fixed_set() {
        let provider = StaticProvider::new(vec![FilePatch::new(
            "a.rs",
            None,
            EditKind::Modified,
            String::new(),
            String::new(),
            "+x".to_string(),
        )]);
        let files = provider.list_changed_files("p", "main", "dev").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(provider.read_file("p", "a.rs", "dev").await.unwrap(), "");
    }
}
