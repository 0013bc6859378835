//! GitHub API client for stack-sync pull request management.
//!
//! This module provides direct GitHub REST API access without
//! depending on the `gh` CLI tool.

use std::{collections::HashMap, fs, path::PathBuf, process::Command, time::Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use ureq::{Agent, http::Response};

use crate::{
    remote::RepoIdentifier,
    review::{NewReviewRequest, ReviewRequest, ReviewRequestEdit, ReviewRequestHost},
    stats::Stats,
};

// ============== Configuration Types ==============

/// GitHub authentication configuration
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub token: String,
    pub api_base: String,
}

// ============== API Types ==============

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    /// GitHub sends `null` for an empty body.
    #[serde(default)]
    pub body: Option<String>,
    pub html_url: String,
    pub base: PrBranchRef,
    pub head: PrBranchRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrBranchRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: String,
}

impl From<PullRequest> for ReviewRequest {
    fn from(pr: PullRequest) -> Self {
        Self {
            number: pr.number,
            head_sha: pr.head.sha,
            title: pr.title,
            body: pr.body.unwrap_or_default(),
            base_ref: pr.base.ref_name,
            html_url: pr.html_url,
        }
    }
}

/// PR creation request
#[derive(Debug, Serialize)]
pub struct CreatePrRequest<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub head: &'a str,
    pub base: &'a str,
}

/// PR update request
#[derive(Debug, Serialize)]
pub struct UpdatePrRequest<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub base: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

// ============== Error Types ==============

#[derive(Debug)]
pub enum GitHubError {
    /// No auth token configured
    NoToken,
    /// Token is invalid or expired
    Unauthorized,
    /// Rate limited (includes reset timestamp)
    RateLimited { reset_at: u64 },
    /// Network/HTTP error
    Network(String),
    /// API error with message
    Api { status: u16, message: String },
}

impl std::fmt::Display for GitHubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoToken => write!(
                f,
                "No GitHub token configured (set GITHUB_TOKEN or run `gh auth login`)"
            ),
            Self::Unauthorized => write!(f, "GitHub token is invalid or expired"),
            Self::RateLimited { reset_at } => {
                write!(f, "GitHub API rate limited until {}", reset_at)
            }
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::Api { status, message } => {
                write!(f, "GitHub API error ({}): {}", status, message)
            }
        }
    }
}

impl std::error::Error for GitHubError {}

/// Classify a non-2xx response.
fn api_error(
    status: u16,
    rate_limit_remaining: Option<&str>,
    rate_limit_reset: Option<u64>,
    body: &str,
) -> GitHubError {
    if status == 401 {
        return GitHubError::Unauthorized;
    }
    if matches!(status, 403 | 429) && rate_limit_remaining == Some("0") {
        return GitHubError::RateLimited {
            reset_at: rate_limit_reset.unwrap_or_default(),
        };
    }
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|parsed| parsed.message)
        .ok()
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| body.trim().to_string());
    GitHubError::Api { status, message }
}

// ============== Client ==============

/// GitHub API client bound to one repository
pub struct GitHubClient {
    config: GitHubConfig,
    repo: RepoIdentifier,
    agent: Agent,
    stats: Stats,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig, repo: RepoIdentifier, stats: Stats) -> Self {
        // Status codes are classified in `api_error`, not by ureq.
        let agent: Agent = Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            config,
            repo,
            agent,
            stats,
        }
    }

    /// Load config from environment/git config/config file
    pub fn from_env(repo: RepoIdentifier, stats: Stats) -> Result<Self, GitHubError> {
        let token = find_github_token(&repo.host)?;
        let config = GitHubConfig {
            token,
            api_base: api_base(&repo.host),
        };
        Ok(Self::new(config, repo, stats))
    }

    fn pulls_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/pulls",
            self.config.api_base, self.repo.owner, self.repo.repo
        )
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.config.token)
    }

    /// Find open PRs whose head is `branch` in this repository
    pub fn find_open_prs(&self, branch: &str) -> Result<Vec<PullRequest>, GitHubError> {
        let head = format!("{}:{}", self.repo.owner, branch);
        let start = Instant::now();
        let response = self
            .agent
            .get(&self.pulls_url())
            .header("Authorization", &self.auth_header())
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", env!("CARGO_PKG_NAME"))
            .query("state", "open")
            .query("head", &head)
            .call()
            .map_err(|e| GitHubError::Network(e.to_string()));
        self.stats.record("api list", start.elapsed());
        read_response(response?)
    }

    /// Create a new PR
    pub fn create_pr(&self, request: &CreatePrRequest) -> Result<PullRequest, GitHubError> {
        let start = Instant::now();
        let response = self
            .agent
            .post(&self.pulls_url())
            .header("Authorization", &self.auth_header())
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", env!("CARGO_PKG_NAME"))
            .send_json(request)
            .map_err(|e| GitHubError::Network(e.to_string()));
        self.stats.record("api create", start.elapsed());
        read_response(response?)
    }

    /// Update title, body and base of a PR
    pub fn update_pr(
        &self,
        pr_number: u64,
        request: &UpdatePrRequest,
    ) -> Result<PullRequest, GitHubError> {
        let url = format!("{}/{}", self.pulls_url(), pr_number);
        let start = Instant::now();
        let response = self
            .agent
            .patch(&url)
            .header("Authorization", &self.auth_header())
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", env!("CARGO_PKG_NAME"))
            .send_json(request)
            .map_err(|e| GitHubError::Network(e.to_string()));
        self.stats.record("api edit", start.elapsed());
        read_response(response?)
    }
}

fn read_response<T: serde::de::DeserializeOwned>(
    mut response: Response<ureq::Body>,
) -> Result<T, GitHubError> {
    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        return response
            .body_mut()
            .read_json()
            .map_err(|e| GitHubError::Network(e.to_string()));
    }

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let remaining = header("x-ratelimit-remaining");
    let reset = header("x-ratelimit-reset").and_then(|value| value.parse().ok());
    let body = response.body_mut().read_to_string().unwrap_or_default();
    let error = api_error(status, remaining.as_deref(), reset, &body);
    tracing::debug!(%error, "GitHub request failed");
    Err(error)
}

impl ReviewRequestHost for GitHubClient {
    fn list_open(&self, head_branch: &str) -> Result<Vec<ReviewRequest>> {
        let prs = self.find_open_prs(head_branch)?;
        Ok(prs
            .into_iter()
            // The head filter is owner-scoped; keep exact branch matches only.
            .filter(|pr| pr.head.ref_name == head_branch)
            .map(ReviewRequest::from)
            .collect())
    }

    fn create(&self, request: &NewReviewRequest) -> Result<ReviewRequest> {
        let pr = self.create_pr(&CreatePrRequest {
            title: &request.title,
            body: &request.body,
            head: &request.head,
            base: &request.base,
        })?;
        tracing::debug!(number = pr.number, url = %pr.html_url, "Created pull request");
        Ok(pr.into())
    }

    fn edit(&self, number: u64, edit: &ReviewRequestEdit) -> Result<ReviewRequest> {
        let pr = self.update_pr(
            number,
            &UpdatePrRequest {
                title: &edit.title,
                body: &edit.body,
                base: &edit.base,
            },
        )?;
        Ok(pr.into())
    }
}

// ============== Helper Functions ==============

/// REST API root for a GitHub host
pub fn api_base(host: &str) -> String {
    if host == "github.com" {
        "https://api.github.com".to_string()
    } else {
        format!("https://{}/api/v3", host)
    }
}

/// GitHub config file structure
#[derive(Debug, Default, Deserialize)]
struct GitHubConfigFile {
    default_token: Option<String>,
    hosts: Option<HashMap<String, String>>,
}

impl GitHubConfigFile {
    /// Host-specific token first, then the default token
    fn token_for(&self, host: &str) -> Option<String> {
        self.hosts
            .as_ref()
            .and_then(|hosts| hosts.get(host))
            .or(self.default_token.as_ref())
            .filter(|token| !token.is_empty())
            .cloned()
    }
}

/// One host entry of the gh CLI `hosts.yml`
#[derive(Debug, Deserialize)]
struct GhHost {
    oauth_token: Option<String>,
}

fn gh_hosts_token(contents: &str, host: &str) -> Option<String> {
    let hosts: HashMap<String, GhHost> = serde_yaml::from_str(contents).ok()?;
    hosts
        .get(host)?
        .oauth_token
        .clone()
        .filter(|token| !token.is_empty())
}

/// Load GitHub configuration from XDG config file
fn load_github_config_file() -> Option<GitHubConfigFile> {
    let base_dirs = xdg::BaseDirectories::with_prefix(env!("CARGO_PKG_NAME"));
    let config_path = base_dirs.get_config_file("github.yaml")?;
    let contents = fs::read_to_string(&config_path).ok()?;
    serde_yaml::from_str(&contents).ok()
}

fn gh_hosts_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME")
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir).join("gh").join("hosts.yml"));
    }
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config").join("gh").join("hosts.yml"))
}

fn env_token(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|token| !token.is_empty())
}

/// Find GitHub token from various sources
fn find_github_token(host: &str) -> Result<String, GitHubError> {
    // 1. Check GITHUB_TOKEN env var
    if let Some(token) = env_token("GITHUB_TOKEN") {
        tracing::debug!("Using GitHub token from GITHUB_TOKEN env var");
        return Ok(token);
    }

    // 2. Check GH_TOKEN env var (used by gh CLI)
    if let Some(token) = env_token("GH_TOKEN") {
        tracing::debug!("Using GitHub token from GH_TOKEN env var");
        return Ok(token);
    }

    // 3. Check git config github.token
    if let Ok(output) = Command::new("git")
        .args(["config", "--get", "github.token"])
        .output()
        && output.status.success()
    {
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !token.is_empty() {
            tracing::debug!("Using GitHub token from git config");
            return Ok(token);
        }
    }

    // 4. Check XDG config file for token
    if let Some(token) = load_github_config_file().and_then(|config| config.token_for(host)) {
        tracing::debug!("Using GitHub token from config file");
        return Ok(token);
    }

    // 5. Fall back to the gh CLI's own credentials
    if let Some(path) = gh_hosts_path()
        && let Ok(contents) = fs::read_to_string(&path)
        && let Some(token) = gh_hosts_token(&contents, host)
    {
        tracing::debug!("Using GitHub token from {}", path.display());
        return Ok(token);
    }

    Err(GitHubError::NoToken)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PR_JSON: &str = r#"{
        "number": 42,
        "state": "open",
        "title": "Add parser",
        "body": null,
        "html_url": "https://github.com/owner/repo/pull/42",
        "user": {"login": "someone"},
        "head": {"ref": "stack/abc", "sha": "1111111111111111111111111111111111111111"},
        "base": {"ref": "main", "sha": "2222222222222222222222222222222222222222"}
    }"#;

    #[test]
    fn test_pull_request_into_review_request() {
        let pr: PullRequest = serde_json::from_str(PR_JSON).unwrap();
        let request = ReviewRequest::from(pr);
        assert_eq!(request.number, 42);
        assert_eq!(request.head_sha, "1111111111111111111111111111111111111111");
        assert_eq!(request.base_ref, "main");
        assert_eq!(request.title, "Add parser");
        assert_eq!(request.body, "");
    }

    #[test]
    fn test_update_request_payload() {
        let payload = serde_json::to_value(UpdatePrRequest {
            title: "t",
            body: "b",
            base: "stack/abc",
        })
        .unwrap();
        assert_eq!(
            payload,
            serde_json::json!({"title": "t", "body": "b", "base": "stack/abc"})
        );
    }

    #[test]
    fn test_api_base() {
        assert_eq!(api_base("github.com"), "https://api.github.com");
        assert_eq!(
            api_base("github.mycompany.com"),
            "https://github.mycompany.com/api/v3"
        );
    }

    #[test]
    fn test_api_error_classification() {
        assert!(matches!(
            api_error(401, None, None, ""),
            GitHubError::Unauthorized
        ));
        assert!(matches!(
            api_error(403, Some("0"), Some(1700000000), "{}"),
            GitHubError::RateLimited {
                reset_at: 1700000000
            }
        ));
        match api_error(422, Some("4999"), None, r#"{"message":"Validation Failed"}"#) {
            GitHubError::Api { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "Validation Failed");
            }
            other => panic!("unexpected {other:?}"),
        }
        match api_error(502, None, None, "Bad Gateway\n") {
            GitHubError::Api { message, .. } => assert_eq!(message, "Bad Gateway"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_config_file_token_precedence() {
        let config: GitHubConfigFile = serde_yaml::from_str(
            "default_token: fallback\nhosts:\n  github.mycompany.com: enterprise\n",
        )
        .unwrap();
        assert_eq!(
            config.token_for("github.mycompany.com").as_deref(),
            Some("enterprise")
        );
        assert_eq!(config.token_for("github.com").as_deref(), Some("fallback"));
        assert_eq!(GitHubConfigFile::default().token_for("github.com"), None);
    }

    #[test]
    fn test_gh_hosts_token() {
        let contents = "github.com:\n    user: someone\n    oauth_token: gho_abc\n    git_protocol: ssh\n";
        assert_eq!(
            gh_hosts_token(contents, "github.com").as_deref(),
            Some("gho_abc")
        );
        assert_eq!(gh_hosts_token(contents, "example.com"), None);
        assert_eq!(gh_hosts_token("not: [valid", "github.com"), None);
    }
}
