//! Loading the local stack and the remote branches that mirror it.
//!
//! Commits are always ordered newest first, the order `git log` emits.

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::{
    identity::{self, IdentityError},
    pool::WorkerPool,
    session::Session,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub hash: String,
    pub message: String,
    /// Value of the `Stack-Commit-ID` trailer, if any.
    pub identity: Option<String>,
}

impl Commit {
    /// Build a commit from raw log output, resolving its identity.
    pub fn parse(hash: &str, message: &str) -> Result<Self, IdentityError> {
        let message = message.trim().to_string();
        let identity = identity::resolve(&message)?;
        Ok(Self {
            hash: hash.trim().to_string(),
            message,
            identity,
        })
    }

    /// First line of the message.
    pub fn title(&self) -> &str {
        self.message.lines().next().unwrap_or_default().trim()
    }

    /// The message after its title, without the identity trailer.
    pub fn description(&self) -> String {
        self.message
            .lines()
            .skip(1)
            .filter(|line| identity::trailer_value(line).is_none())
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    pub fn short_hash(&self) -> &str {
        short_hash(&self.hash)
    }
}

pub fn short_hash(hash: &str) -> &str {
    hash.get(..7).unwrap_or(hash)
}

#[derive(Debug, Clone)]
pub struct LocalStack {
    pub merge_base: String,
    /// Newest first.
    pub commits: Vec<Commit>,
}

impl LocalStack {
    /// Hashes of the commits that have no identity yet, newest first.
    pub fn missing_identities(&self) -> Vec<String> {
        self.commits
            .iter()
            .filter(|commit| commit.identity.is_none())
            .map(|commit| commit.hash.clone())
            .collect()
    }
}

/// The commits on one identity's remote branch.
#[derive(Debug, Clone)]
pub struct RemoteStack {
    pub branch: String,
    /// Newest first.
    pub commits: Vec<Commit>,
}

impl RemoteStack {
    pub fn tip(&self) -> Option<&str> {
        self.commits.first().map(|commit| commit.hash.as_str())
    }
}

/// Remote stacks keyed by identity. A missing key means the branch does not
/// exist upstream.
#[derive(Debug, Clone, Default)]
pub struct RemoteStacks {
    pub stacks: HashMap<String, RemoteStack>,
}

impl RemoteStacks {
    pub fn get(&self, identity: &str) -> Option<&RemoteStack> {
        self.stacks.get(identity)
    }

    pub fn status(&self, commit: &Commit) -> CommitStatus {
        let Some(identity) = &commit.identity else {
            return CommitStatus::Unassigned;
        };
        match self.get(identity).and_then(RemoteStack::tip) {
            None => CommitStatus::New,
            Some(tip) if tip == commit.hash => CommitStatus::Pushed,
            Some(_) => CommitStatus::Modified,
        }
    }
}

/// How a local commit relates to its remote branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// No identity yet.
    Unassigned,
    /// Identity assigned, no remote branch.
    New,
    /// The remote branch points at this exact commit.
    Pushed,
    /// The remote branch points elsewhere.
    Modified,
}

impl std::fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unassigned => write!(f, "unassigned"),
            Self::New => write!(f, "new"),
            Self::Pushed => write!(f, "pushed"),
            Self::Modified => write!(f, "modified"),
        }
    }
}

/// Split `git log` output produced with `--pretty=%H<sep>%B<sep>` into
/// `(hash, message)` pairs.
pub fn parse_log<'a>(output: &'a str, separator: &str) -> Vec<(&'a str, &'a str)> {
    let parts: Vec<&str> = output.split(separator).collect();
    parts
        .chunks_exact(2)
        .map(|pair| (pair[0].trim(), pair[1]))
        .filter(|(hash, _)| !hash.is_empty())
        .collect()
}

/// Load the commits in `range`, resolving identities on the worker pool.
pub fn load_commits(session: &Session, pool: &WorkerPool, range: &str) -> Result<Vec<Commit>> {
    let out = session.git.log(range, session.separator())?;
    let entries = parse_log(out.as_ref(), session.separator());
    pool.map_ordered(&entries, |(hash, message)| {
        Commit::parse(hash, message).with_context(|| format!("commit {hash}"))
    })
}

/// The stack between the upstream ref and the local head.
pub fn load_local_stack(session: &Session, pool: &WorkerPool) -> Result<LocalStack> {
    let config = &session.config;
    let merge_base = session
        .git
        .merge_base(&config.local_head, &config.upstream_ref())
        .context("computing merge base")?;
    tracing::debug!(%merge_base, "Merge base");
    let commits = load_commits(session, pool, &format!("{}..{}", merge_base, config.local_head))?;
    check_unique_identities(&commits)?;
    Ok(LocalStack {
        merge_base,
        commits,
    })
}

/// Each identity names one branch, so no two commits may share one.
fn check_unique_identities(commits: &[Commit]) -> Result<(), IdentityError> {
    let mut seen: HashMap<&str, &Commit> = HashMap::new();
    for commit in commits {
        let Some(identity) = commit.identity.as_deref() else {
            continue;
        };
        if let Some(first) = seen.insert(identity, commit) {
            return Err(IdentityError::Duplicate {
                identity: identity.to_string(),
                first: first.short_hash().to_string(),
                second: commit.short_hash().to_string(),
            });
        }
    }
    Ok(())
}

/// The remote branch contents for every identified local commit.
pub fn load_remote_stacks(
    session: &Session,
    pool: &WorkerPool,
    local: &LocalStack,
) -> Result<RemoteStacks> {
    let remote = &session.config.remote;
    let namer = session.namer();
    let mut stacks = HashMap::new();
    for commit in &local.commits {
        let Some(identity) = &commit.identity else {
            continue;
        };
        let tracking_ref = namer.tracking_ref(remote, identity);
        if !session.repo.ref_exists(&tracking_ref) {
            tracing::debug!(%tracking_ref, "No remote branch");
            continue;
        }
        let commits = load_commits(
            session,
            pool,
            &format!("{}..{}", local.merge_base, tracking_ref),
        )?;
        stacks.insert(
            identity.clone(),
            RemoteStack {
                branch: namer.branch(identity),
                commits,
            },
        );
    }
    Ok(RemoteStacks { stacks })
}
