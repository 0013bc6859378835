use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::{
    config::Config,
    git::Git,
    git2_ops::GitRepo,
    pool::{Cancellation, WorkerPool},
    remote::BranchNamer,
    stats::Stats,
};

/// Everything one invocation shares: config, git access, the log separator,
/// command statistics and cancellation.
pub struct Session {
    pub config: Config,
    pub git: Git,
    pub repo: GitRepo,
    pub stats: Stats,
    pub cancellation: Cancellation,
    separator: String,
    hook_program: Option<PathBuf>,
}

impl Session {
    pub fn new(config: Config, repo: GitRepo, stats: Stats) -> Result<Self> {
        let root = repo.root()?;
        Ok(Self {
            git: Git::new(root, stats.clone()),
            config,
            repo,
            stats,
            cancellation: Cancellation::default(),
            separator: random_separator(),
            hook_program: None,
        })
    }

    /// Run `program` as the editor while rewriting history instead of the
    /// current executable.
    pub fn with_hook_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.hook_program = Some(program.into());
        self
    }

    /// The executable git calls back into during a rebase.
    pub fn hook_program(&self) -> Result<PathBuf> {
        match &self.hook_program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().context("locating current executable"),
        }
    }

    /// Open the repository containing `dir` with an already-loaded config.
    pub fn open(dir: &Path, config: Config, stats: Stats) -> Result<Self> {
        let repo = GitRepo::discover(dir, stats.clone())?;
        Self::new(config, repo, stats)
    }

    /// Delimiter for `git log` output, random per session so no commit
    /// message can contain it.
    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn namer(&self) -> BranchNamer {
        BranchNamer::new(&self.config.branch_prefix)
    }

    pub fn worker_pool(&self) -> Result<WorkerPool> {
        let pool = WorkerPool::new(self.config.concurrency, self.cancellation.clone())?;
        tracing::debug!(threads = pool.threads(), "Worker pool");
        Ok(pool)
    }
}

fn random_separator() -> String {
    let bytes: [u8; 16] = rand::random();
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("|{hex}|")
}
