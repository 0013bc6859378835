//! The review-request directory: which open pull request belongs to which
//! commit identity.

use std::{collections::HashMap, fmt};

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{pool::WorkerPool, remote::BranchNamer, stack::Commit};

/// An open review request as observed on the hosting service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    pub number: u64,
    pub head_sha: String,
    pub title: String,
    pub body: String,
    pub base_ref: String,
    pub html_url: String,
}

/// Fields for a new review request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReviewRequest {
    pub title: String,
    pub head: String,
    pub base: String,
    pub body: String,
}

/// Replacement fields for an existing review request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequestEdit {
    pub title: String,
    pub body: String,
    pub base: String,
}

/// The hosting service seen through the three calls the engine needs.
pub trait ReviewRequestHost: Sync {
    /// Every open review request whose head is exactly `head_branch`.
    fn list_open(&self, head_branch: &str) -> Result<Vec<ReviewRequest>>;

    fn create(&self, request: &NewReviewRequest) -> Result<ReviewRequest>;

    fn edit(&self, number: u64, edit: &ReviewRequestEdit) -> Result<ReviewRequest>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// More than one open review request shares a head branch.
    MultipleOpen { branch: String, numbers: Vec<u64> },
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MultipleOpen { branch, numbers } => {
                let numbers: Vec<String> = numbers.iter().map(|n| format!("#{n}")).collect();
                write!(
                    f,
                    "found {} open pull requests for branch '{}' ({}), expected at most one",
                    numbers.len(),
                    branch,
                    numbers.join(", ")
                )
            }
        }
    }
}

impl std::error::Error for DirectoryError {}

/// Look up the open review request of every identified commit.
///
/// Returns identity → review request; identities without one are absent.
pub fn find_open_review_requests(
    pool: &WorkerPool,
    host: &dyn ReviewRequestHost,
    commits: &[Commit],
    namer: &BranchNamer,
) -> Result<HashMap<String, ReviewRequest>> {
    let identities: Vec<&str> = commits
        .iter()
        .filter_map(|commit| commit.identity.as_deref())
        .collect();

    let progress = ProgressBar::new(identities.len() as u64);
    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} [{pos}/{len}]") {
        progress.set_style(style);
    }
    progress.set_message("Looking up pull requests");

    let found = pool.map_ordered(&identities, |identity| {
        let branch = namer.branch(identity);
        let mut open = host.list_open(&branch)?;
        progress.inc(1);
        match open.len() {
            0 => Ok(None),
            1 => Ok(open.pop().map(|request| (identity.to_string(), request))),
            _ => Err(DirectoryError::MultipleOpen {
                branch,
                numbers: open.iter().map(|request| request.number).collect(),
            }
            .into()),
        }
    });
    progress.finish_and_clear();

    Ok(found?.into_iter().flatten().collect())
}

/// Marker placed next to the review request being described.
pub const CURRENT_MARKER: &str = "⬅";

/// Render the body of the review request for `commit`.
///
/// `siblings` lists `(identity, number)` for every review request of the
/// stack known at render time, newest first.
pub fn render_body(commit: &Commit, siblings: &[(&str, u64)]) -> String {
    let mut body = String::new();
    let description = commit.description();
    if !description.is_empty() {
        body.push_str(&description);
        body.push_str("\n\n---\n\n");
    }
    body.push_str("Stack:\n\n");
    for (identity, number) in siblings {
        body.push_str(&format!("* #{number}"));
        if commit.identity.as_deref() == Some(*identity) {
            body.push(' ');
            body.push_str(CURRENT_MARKER);
        }
        body.push('\n');
    }
    body.push_str(&format!(
        "\nThis stacked pull request is managed by {}.\n",
        env!("CARGO_PKG_NAME")
    ));
    body
}

/// Bodies are compared modulo line endings and trailing whitespace, which the
/// hosting service may rewrite.
pub fn normalize_body(body: &str) -> String {
    body.replace("\r\n", "\n").trim_end().to_string()
}
