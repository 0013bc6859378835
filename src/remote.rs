//! Locating the hosting-service repository and naming stack branches.

use anyhow::{Context, Result, bail};

use crate::git2_ops::GitRepo;

/// Repository identification (owner/repo extracted from remote URL)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoIdentifier {
    pub owner: String,
    pub repo: String,
    pub host: String,
}

impl RepoIdentifier {
    /// Returns the full repo path as "owner/repo"
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// Parse GitHub remote URL to extract owner/repo
pub fn parse_remote_url(url: &str) -> Result<RepoIdentifier> {
    // Handle various URL formats:
    // - git@github.com:owner/repo.git
    // - https://github.com/owner/repo.git
    // - https://github.com/owner/repo
    // - ssh://git@github.com/owner/repo.git
    // - git://github.com/owner/repo.git

    let url = url.trim();

    // SSH format: git@github.com:owner/repo.git
    if let Some(rest) = url.strip_prefix("git@")
        && let Some((host, path)) = rest.split_once(':')
        && let Some(id) = split_owner_repo(host, path)
    {
        return Ok(id);
    }

    // HTTPS/SSH URL format
    let without_protocol = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .or_else(|| url.strip_prefix("ssh://git@"))
        .or_else(|| url.strip_prefix("ssh://"))
        .or_else(|| url.strip_prefix("git://"));
    if let Some(rest) = without_protocol
        && let Some((host, path)) = rest.split_once('/')
        && let Some(id) = split_owner_repo(host, path)
    {
        return Ok(id);
    }

    bail!(
        "Could not parse GitHub remote URL: {}. Expected format like 'git@github.com:owner/repo.git' or 'https://github.com/owner/repo'",
        url
    )
}

fn split_owner_repo(host: &str, path: &str) -> Option<RepoIdentifier> {
    let path = path.trim_end_matches('/').trim_end_matches(".git");
    let (owner, repo) = path.split_once('/')?;
    if host.is_empty() || owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    // Strip an explicit port from ssh URLs, e.g. github.com:22.
    let host = host.split(':').next().unwrap_or(host);
    Some(RepoIdentifier {
        host: host.to_string(),
        owner: owner.to_string(),
        repo: repo.to_string(),
    })
}

/// Get RepoIdentifier for the given remote of the current repository
pub fn get_repo_identifier(git_repo: &GitRepo, remote: &str) -> Result<RepoIdentifier> {
    let remote_url = git_repo
        .remote_url(remote)
        .with_context(|| format!("Failed to get {remote} remote URL"))?;
    parse_remote_url(&remote_url)
}

/// Maps identities to their deterministic remote branch names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchNamer {
    prefix: String,
}

impl BranchNamer {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// `<prefix>/<identity>`
    pub fn branch(&self, identity: &str) -> String {
        format!("{}/{}", self.prefix, identity)
    }

    /// The remote-tracking ref of an identity's branch, e.g.
    /// `refs/remotes/origin/stack/<identity>`.
    pub fn tracking_ref(&self, remote: &str, identity: &str) -> String {
        format!("refs/remotes/{}/{}", remote, self.branch(identity))
    }
}

impl Default for BranchNamer {
    fn default() -> Self {
        Self::new("stack")
    }
}
