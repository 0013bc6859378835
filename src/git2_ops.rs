//! git2 wrapper for fast read-only repository queries.
//!
//! Everything that mutates the repository goes through the `git` CLI
//! instead (see [`crate::git`]).

use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result, anyhow};
use git2::Repository;

use crate::stats::Stats;

/// Read-only handle on the repository for one invocation.
pub struct GitRepo {
    repo: Repository,
    stats: Stats,
}

impl GitRepo {
    /// Discover the repository containing `path`.
    pub fn discover(path: &Path, stats: Stats) -> Result<Self> {
        let start = Instant::now();
        let repo = Repository::discover(path)
            .with_context(|| format!("No git repository found at {}", path.display()))?;
        stats.record("git2 open", start.elapsed());
        Ok(Self { repo, stats })
    }

    /// The working tree root.
    /// Equivalent to `git rev-parse --show-toplevel`
    pub fn root(&self) -> Result<PathBuf> {
        self.repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow!("Repository has no working directory"))
    }

    /// The configured URL of `remote`.
    /// Equivalent to `git config --get remote.<remote>.url`
    pub fn remote_url(&self, remote: &str) -> Result<String> {
        let start = Instant::now();
        let found = self
            .repo
            .find_remote(remote)
            .with_context(|| format!("Remote '{}' is not configured", remote))?;
        let url = found
            .url()
            .ok_or_else(|| anyhow!("Remote '{}' has no valid URL", remote))?
            .to_string();
        self.stats.record("git2 remote-url", start.elapsed());
        Ok(url)
    }

    /// Check whether a fully qualified ref exists, e.g.
    /// `refs/remotes/origin/stack/abc`.
    pub fn ref_exists(&self, ref_name: &str) -> bool {
        let start = Instant::now();
        let exists = self.repo.find_reference(ref_name).is_ok();
        self.stats.record("git2 ref-exists", start.elapsed());
        exists
    }
}
