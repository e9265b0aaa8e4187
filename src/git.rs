//! Git-hosting provider
//!
//! PR creation, default-branch lookup, PR-comment replies, and best-effort
//! repository indexing for LLM context. The production implementation
//! speaks the GitHub REST v3 API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GitError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("GitHub API error ({status}): {message}")]
    Api { status: u16, message: String },
}

pub type GitResult<T> = Result<T, GitError>;

#[derive(Debug, Clone, Default)]
pub struct CreatePrOptions {
    pub repo: String,
    pub branch: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// Structured repository summary suitable for LLM context
#[derive(Debug, Clone, Default)]
pub struct RepoContext {
    pub default_branch: String,
    /// Language name -> bytes of code, largest first
    pub languages: Vec<(String, u64)>,
    /// Sample of file paths from the tree
    pub tree: Vec<String>,
    /// README excerpt, when present
    pub readme: String,
}

impl RepoContext {
    /// Render for inclusion in a stage prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.languages.is_empty() {
            let names: Vec<&str> = self.languages.iter().map(|(n, _)| n.as_str()).collect();
            let _ = writeln!(out, "Languages: {}", names.join(", "));
        }
        if !self.tree.is_empty() {
            let _ = writeln!(out, "Files:");
            for path in &self.tree {
                let _ = writeln!(out, "  {path}");
            }
        }
        if !self.readme.is_empty() {
            let _ = writeln!(out, "README excerpt:\n{}", self.readme);
        }
        out
    }
}

#[async_trait]
pub trait GitProvider: Send + Sync {
    /// Open a pull request; returns `(pr_url, pr_number)`.
    async fn create_pr(&self, options: &CreatePrOptions) -> GitResult<(String, u64)>;

    /// Default branch of the repository.
    async fn get_default_branch(&self, repo: &str) -> GitResult<String>;

    /// Post a comment on a pull request.
    async fn reply_to_pr_comment(&self, repo: &str, pr_number: u64, body: &str) -> GitResult<()>;

    /// Best-effort structured summary of the repository.
    async fn index_repo(&self, repo: &str) -> GitResult<RepoContext>;
}

#[async_trait]
impl<T: GitProvider + ?Sized> GitProvider for Arc<T> {
    async fn create_pr(&self, options: &CreatePrOptions) -> GitResult<(String, u64)> {
        (**self).create_pr(options).await
    }

    async fn get_default_branch(&self, repo: &str) -> GitResult<String> {
        (**self).get_default_branch(repo).await
    }

    async fn reply_to_pr_comment(&self, repo: &str, pr_number: u64, body: &str) -> GitResult<()> {
        (**self).reply_to_pr_comment(repo, pr_number, body).await
    }

    async fn index_repo(&self, repo: &str) -> GitResult<RepoContext> {
        (**self).index_repo(repo).await
    }
}

const TREE_SAMPLE_LIMIT: usize = 200;
const README_EXCERPT_LIMIT: usize = 4 * 1024;

/// GitHub REST v3 client
pub struct GithubProvider {
    client: Client,
    token: String,
    api_base: String,
}

impl GithubProvider {
    pub fn new(token: String) -> Self {
        Self::with_base(token, "https://api.github.com".to_string())
    }

    /// Override the API base (tests, GitHub Enterprise).
    pub fn with_base(token: String, api_base: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("telecoder")
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.api_base))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
    }

    async fn check(response: reqwest::Response) -> GitResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .json::<GithubErrorBody>()
            .await
            .map(|b| b.message)
            .unwrap_or_else(|_| status.to_string());
        Err(GitError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[derive(Deserialize)]
struct GithubErrorBody {
    message: String,
}

#[derive(Serialize)]
struct CreatePrBody<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct PrResponse {
    html_url: String,
    number: u64,
}

#[derive(Deserialize)]
struct RepoResponse {
    default_branch: String,
}

#[derive(Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    entry_type: String,
}

#[async_trait]
impl GitProvider for GithubProvider {
    async fn create_pr(&self, options: &CreatePrOptions) -> GitResult<(String, u64)> {
        let response = self
            .request(reqwest::Method::POST, &format!("/repos/{}/pulls", options.repo))
            .json(&CreatePrBody {
                title: &options.title,
                head: &options.branch,
                base: &options.base,
                body: &options.body,
            })
            .send()
            .await?;

        let pr: PrResponse = Self::check(response).await?.json().await?;
        tracing::info!(repo = %options.repo, pr_number = pr.number, "Created pull request");
        Ok((pr.html_url, pr.number))
    }

    async fn get_default_branch(&self, repo: &str) -> GitResult<String> {
        let response = self
            .request(reqwest::Method::GET, &format!("/repos/{repo}"))
            .send()
            .await?;
        let repo_info: RepoResponse = Self::check(response).await?.json().await?;
        Ok(repo_info.default_branch)
    }

    async fn reply_to_pr_comment(&self, repo: &str, pr_number: u64, body: &str) -> GitResult<()> {
        // PRs are issues for commenting purposes
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{repo}/issues/{pr_number}/comments"),
            )
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn index_repo(&self, repo: &str) -> GitResult<RepoContext> {
        let default_branch = self.get_default_branch(repo).await?;
        let mut context = RepoContext {
            default_branch: default_branch.clone(),
            ..RepoContext::default()
        };

        // Everything past the default branch is best-effort
        match self
            .request(reqwest::Method::GET, &format!("/repos/{repo}/languages"))
            .send()
            .await
        {
            Ok(response) => {
                if let Ok(languages) = response.json::<BTreeMap<String, u64>>().await {
                    let mut pairs: Vec<(String, u64)> = languages.into_iter().collect();
                    pairs.sort_by(|a, b| b.1.cmp(&a.1));
                    context.languages = pairs;
                }
            }
            Err(e) => tracing::debug!(repo, error = %e, "Language lookup failed"),
        }

        match self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{repo}/git/trees/{default_branch}?recursive=1"),
            )
            .send()
            .await
        {
            Ok(response) => {
                if let Ok(tree) = response.json::<TreeResponse>().await {
                    context.tree = tree
                        .tree
                        .into_iter()
                        .filter(|e| e.entry_type == "blob")
                        .map(|e| e.path)
                        .take(TREE_SAMPLE_LIMIT)
                        .collect();
                }
            }
            Err(e) => tracing::debug!(repo, error = %e, "Tree lookup failed"),
        }

        match self
            .request(reqwest::Method::GET, &format!("/repos/{repo}/readme"))
            .header("Accept", "application/vnd.github.raw+json")
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                if let Ok(text) = response.text().await {
                    context.readme = text.chars().take(README_EXCERPT_LIMIT).collect();
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(repo, error = %e, "README lookup failed"),
        }

        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_repo_context() {
        let context = RepoContext {
            default_branch: "main".to_string(),
            languages: vec![("Go".to_string(), 1000), ("Shell".to_string(), 50)],
            tree: vec!["go.mod".to_string(), "main.go".to_string()],
            readme: "A tool.".to_string(),
        };

        let rendered = context.render();
        assert!(rendered.contains("Languages: Go, Shell"));
        assert!(rendered.contains("  main.go"));
        assert!(rendered.contains("A tool."));
    }

    #[test]
    fn test_render_empty_context_is_empty() {
        assert!(RepoContext::default().render().is_empty());
    }
}
