//! Assigning identities by rewriting history.
//!
//! One interactive rebase per invocation. Git calls back into this binary
//! twice: once as the sequence editor to mark the selected commits for
//! rewording, and once per reworded commit as the message editor to append
//! the identity trailer.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use crate::{git::Git, identity, session::Session, stack::short_hash};

/// Subcommand git invokes as the sequence editor.
pub const SELECT_HOOK: &str = "rebase-edit-todo";
/// Subcommand git invokes as the commit message editor.
pub const EDIT_HOOK: &str = "rebase-add-trailer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    /// Selected commits that never appeared in the rebase todo.
    MissingCommits(Vec<String>),
    /// The message editor ran more often than commits were selected.
    EmptyQueue,
}

impl fmt::Display for RewriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCommits(hashes) => write!(
                f,
                "rebase todo did not contain commits: {}",
                hashes.join(" ")
            ),
            Self::EmptyQueue => write!(f, "no commits left to reword"),
        }
    }
}

impl std::error::Error for RewriteError {}

/// The hashes selected for rewording, one per line, newest first.
///
/// Git replays oldest first, so the message editor consumes from the end.
#[derive(Debug)]
pub struct SelectionFile {
    path: PathBuf,
}

impl SelectionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn read(&self) -> Result<Vec<String>> {
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        Ok(data
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn write(&self, hashes: &[String]) -> Result<()> {
        let mut data = hashes.join("\n");
        data.push('\n');
        fs::write(&self.path, data).with_context(|| format!("writing {}", self.path.display()))
    }

    /// Remove and return the oldest remaining hash.
    pub fn pop_oldest(&self) -> Result<String> {
        let mut hashes = self.read()?;
        let oldest = hashes.pop().ok_or(RewriteError::EmptyQueue)?;
        self.write(&hashes)?;
        Ok(oldest)
    }
}

/// Turn `pick` lines of a rebase todo into `reword` lines for every commit in
/// `hashes`. Todo lines carry abbreviated hashes, so a line matches any full
/// hash it is a prefix of.
pub fn reword_steps(todo: &str, hashes: &[String]) -> Result<String, RewriteError> {
    let mut remaining: Vec<&str> = hashes.iter().map(String::as_str).collect();
    let mut lines = Vec::new();
    for line in todo.split('\n') {
        let mut words = line.split_whitespace();
        let rewritten = match (words.next(), words.next()) {
            (Some(command @ ("pick" | "p")), Some(short)) => {
                let before = remaining.len();
                remaining.retain(|full| !full.starts_with(short));
                (remaining.len() != before)
                    .then(|| line.replacen(command, "reword", 1))
            }
            _ => None,
        };
        lines.push(rewritten.unwrap_or_else(|| line.to_string()));
    }

    if !remaining.is_empty() {
        return Err(RewriteError::MissingCommits(
            remaining.into_iter().map(str::to_string).collect(),
        ));
    }
    Ok(lines.join("\n"))
}

/// A callback invocation from inside the rebase.
#[derive(Debug)]
pub enum RewriteHook {
    /// Mark the selected commits in the todo file for rewording.
    Select { selection: PathBuf, todo: PathBuf },
    /// Append the identity trailer to the message of the commit being
    /// reworded.
    Edit { selection: PathBuf, message: PathBuf },
}

impl RewriteHook {
    pub fn run(&self, git: &Git) -> Result<()> {
        match self {
            Self::Select { selection, todo } => {
                let hashes = SelectionFile::new(selection).read()?;
                let steps = read(todo)?;
                let steps = reword_steps(&steps, &hashes)?;
                fs::write(todo, steps).with_context(|| format!("writing {}", todo.display()))
            }
            Self::Edit { selection, message } => {
                let hash = SelectionFile::new(selection).pop_oldest()?;
                let identity = identity::fallback_identity(&hash);
                tracing::debug!(commit = short_hash(&hash), %identity, "Adding identity");
                let updated = git.set_trailer(&read(message)?, &identity::trailer(&identity))?;
                fs::write(message, updated).with_context(|| format!("writing {}", message.display()))
            }
        }
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Give every commit in `hashes` (newest first) an identity trailer by
/// rebasing onto `merge_base`. On failure the rebase is aborted and the
/// original history restored.
pub fn rewrite_identities(session: &Session, merge_base: &str, hashes: &[String]) -> Result<()> {
    if hashes.is_empty() {
        return Ok(());
    }
    let selection_file =
        NamedTempFile::new().context("Failed to create commit selection file")?;
    let selection = SelectionFile::new(selection_file.path());
    selection.write(hashes)?;

    let exe = shell_quote(&session.hook_program()?.to_string_lossy());
    let path = shell_quote(&selection_file.path().to_string_lossy());
    let sequence_editor = format!("{exe} {SELECT_HOOK} {path}");
    let message_editor = format!("{exe} {EDIT_HOOK} {path}");
    let sequence_config = format!("sequence.editor={sequence_editor}");
    let editor_config = format!("core.editor={message_editor}");

    tracing::info!("Adding identities to {} commit(s)", hashes.len());
    let result = session.git.run_with_env(
        &[
            // Commit hooks have nothing to say about a trailer.
            "-c",
            "core.hooksPath=",
            "-c",
            &sequence_config,
            "-c",
            &editor_config,
            "rebase",
            "-i",
            "--autostash",
            merge_base,
        ],
        &[
            ("GIT_SEQUENCE_EDITOR", sequence_editor.as_str()),
            ("GIT_EDITOR", message_editor.as_str()),
        ],
    );
    if let Err(error) = result {
        session.git.rebase_abort();
        return Err(error.context("Failed to add identities to commits"));
    }
    Ok(())
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
