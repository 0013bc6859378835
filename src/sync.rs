//! Stack synchronization.
//!
//! Converges the remote side onto the local stack in fixed steps, each
//! finished before the next starts:
//! 1. Identities: give every commit a `Stack-Commit-ID` trailer
//! 2. Observe: load remote branches and open pull requests
//! 3. Branches: force-push every commit whose branch is stale
//! 4. Pull requests: create the missing ones, then edit stale title/body/base
//!
//! Nothing is rolled back on failure; running again converges.

use std::{collections::HashMap, fmt::Display};

use anyhow::{Context, Result, anyhow, bail};
use colored::Colorize;

use crate::{
    identity,
    pool::WorkerPool,
    remote::BranchNamer,
    review::{
        NewReviewRequest,
        ReviewRequest,
        ReviewRequestEdit,
        ReviewRequestHost,
        find_open_review_requests,
        normalize_body,
        render_body,
    },
    rewrite::rewrite_identities,
    session::Session,
    stack::{
        Commit,
        CommitStatus,
        LocalStack,
        RemoteStacks,
        load_local_stack,
        load_remote_stacks,
        short_hash,
    },
};

// ============== Plan Types ==============

/// A commit that needs an identity trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reword {
    pub hash: String,
    pub title: String,
    /// The identity the trailer will carry.
    pub identity: String,
}

/// A branch that must be force-pushed to `hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    pub hash: String,
    pub branch: String,
}

impl Push {
    pub fn refspec(&self) -> String {
        format!("{}:refs/heads/{}", self.hash, self.branch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReview {
    pub identity: String,
    pub request: NewReviewRequest,
}

/// An update to the pull request of `identity`. The number is looked up when
/// the edit is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditReview {
    pub identity: String,
    pub branch: String,
    pub edit: ReviewRequestEdit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewPlan {
    pub creates: Vec<CreateReview>,
    pub edits: Vec<EditReview>,
}

/// Everything one run did, or in dry-run would have done.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub rewords: Vec<Reword>,
    pub pushes: Vec<Push>,
    pub creates: Vec<CreateReview>,
    pub edits: Vec<EditReview>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.rewords.is_empty()
            && self.pushes.is_empty()
            && self.creates.is_empty()
            && self.edits.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Print every mutation without performing it
    pub dry_run: bool,
}

// ============== Planning ==============

/// Commits without an identity, newest first.
pub fn plan_rewords(stack: &LocalStack) -> Vec<Reword> {
    stack
        .commits
        .iter()
        .filter(|commit| commit.identity.is_none())
        .map(|commit| Reword {
            hash: commit.hash.clone(),
            title: commit.title().to_string(),
            identity: identity::fallback_identity(&commit.hash),
        })
        .collect()
}

/// Branches with no pull request yet, or whose pull request head is not the
/// local commit.
pub fn plan_pushes(
    commits: &[Commit],
    review_requests: &HashMap<String, ReviewRequest>,
    namer: &BranchNamer,
) -> Result<Vec<Push>> {
    let mut pushes = Vec::new();
    for commit in commits {
        let identity = require_identity(commit)?;
        let up_to_date = review_requests
            .get(identity)
            .is_some_and(|request| request.head_sha == commit.hash);
        if !up_to_date {
            pushes.push(Push {
                hash: commit.hash.clone(),
                branch: namer.branch(identity),
            });
        }
    }
    Ok(pushes)
}

/// Desired pull request state for every commit, diffed against what exists.
///
/// Each commit targets the branch of the commit directly beneath it; the
/// oldest targets `base`.
pub fn plan_review_requests(
    commits: &[Commit],
    review_requests: &HashMap<String, ReviewRequest>,
    namer: &BranchNamer,
    base: &str,
) -> Result<ReviewPlan> {
    let mut siblings = Vec::new();
    for commit in commits {
        let identity = require_identity(commit)?;
        if let Some(request) = review_requests.get(identity) {
            siblings.push((identity, request.number));
        }
    }

    let mut plan = ReviewPlan::default();
    for (i, commit) in commits.iter().enumerate() {
        let identity = require_identity(commit)?;
        let branch = namer.branch(identity);
        let target = match commits.get(i + 1) {
            Some(beneath) => namer.branch(require_identity(beneath)?),
            None => base.to_string(),
        };
        let title = commit.title().to_string();
        let body = render_body(commit, &siblings);

        match review_requests.get(identity) {
            None => plan.creates.push(CreateReview {
                identity: identity.to_string(),
                request: NewReviewRequest {
                    title,
                    head: branch,
                    base: target,
                    body,
                },
            }),
            Some(existing) => {
                let stale = existing.title != title
                    || existing.base_ref != target
                    || normalize_body(&existing.body) != normalize_body(&body);
                if stale {
                    plan.edits.push(EditReview {
                        identity: identity.to_string(),
                        branch,
                        edit: ReviewRequestEdit {
                            title,
                            body,
                            base: target,
                        },
                    });
                }
            }
        }
    }
    Ok(plan)
}

fn require_identity(commit: &Commit) -> Result<&str> {
    commit
        .identity
        .as_deref()
        .ok_or_else(|| anyhow!("commit {} has no identity", commit.short_hash()))
}

// ============== Applying ==============

fn announce(dry_run: bool, message: impl Display) {
    if dry_run {
        println!("{} {}", "[dry-run]".bright_blue(), message);
    } else {
        println!("{}", message);
    }
}

/// All pushes in one `git push -f`.
pub fn apply_pushes(session: &Session, pushes: &[Push], dry_run: bool) -> Result<()> {
    if pushes.is_empty() {
        return Ok(());
    }
    for push in pushes {
        announce(
            dry_run,
            format!(
                "Pushing {} to {}",
                short_hash(&push.hash).yellow(),
                push.branch.green()
            ),
        );
    }
    if dry_run {
        return Ok(());
    }
    let refspecs: Vec<String> = pushes.iter().map(Push::refspec).collect();
    session
        .git
        .force_push(&session.config.remote, &refspecs)
        .context("Failed to push stack branches")
}

/// Create pull requests concurrently and merge them into `review_requests`.
pub fn apply_creates(
    pool: &WorkerPool,
    host: &dyn ReviewRequestHost,
    creates: &[CreateReview],
    review_requests: &mut HashMap<String, ReviewRequest>,
    dry_run: bool,
) -> Result<()> {
    for create in creates {
        announce(
            dry_run,
            format!(
                "Creating pull request for {} (base: {})",
                create.request.head.yellow(),
                create.request.base.green()
            ),
        );
    }
    if dry_run {
        return Ok(());
    }

    let created = pool.map_ordered(creates, |create| {
        host.create(&create.request)
            .with_context(|| format!("creating pull request for {}", create.request.head))
    })?;
    for (create, request) in creates.iter().zip(created) {
        println!(
            "  {} {}",
            format!("#{}", request.number).green(),
            request.html_url
        );
        review_requests.insert(create.identity.clone(), request);
    }
    Ok(())
}

/// Apply edits concurrently. Every edited identity must already have a pull
/// request; in dry-run, ones created by this run do not exist yet and are
/// only reported.
pub fn apply_edits(
    pool: &WorkerPool,
    host: &dyn ReviewRequestHost,
    edits: &[EditReview],
    review_requests: &HashMap<String, ReviewRequest>,
    dry_run: bool,
) -> Result<()> {
    let mut resolved = Vec::new();
    for edit in edits {
        let Some(existing) = review_requests.get(&edit.identity) else {
            if dry_run {
                announce(
                    true,
                    format!("Updating the new pull request for {}", edit.branch.yellow()),
                );
                continue;
            }
            bail!(
                "bug: no pull request for {} while applying edits",
                edit.branch
            );
        };
        announce(
            dry_run,
            format!(
                "Updating pull request {} for {}",
                format!("#{}", existing.number).green(),
                edit.branch.yellow()
            ),
        );
        resolved.push((existing.number, edit));
    }
    if dry_run {
        return Ok(());
    }

    pool.map_ordered(&resolved, |(number, edit)| {
        host.edit(*number, &edit.edit)
            .with_context(|| format!("updating pull request #{number}"))
    })?;
    Ok(())
}

// ============== Printing ==============

fn colored_status(status: CommitStatus) -> colored::ColoredString {
    let text = format!("{:<10}", status.to_string());
    match status {
        CommitStatus::Unassigned => text.dimmed(),
        CommitStatus::New => text.cyan(),
        CommitStatus::Pushed => text.green(),
        CommitStatus::Modified => text.yellow(),
    }
}

/// One line per commit, newest first.
pub fn print_stack_status(stack: &LocalStack, remote: &RemoteStacks) {
    for commit in &stack.commits {
        let upstream = commit
            .identity
            .as_deref()
            .and_then(|identity| remote.get(identity))
            .map(|upstream| {
                format!(" ({}, {} commit(s))", upstream.branch, upstream.commits.len())
                    .dimmed()
                    .to_string()
            })
            .unwrap_or_default();
        println!(
            "  {} {} {}{}",
            commit.short_hash().yellow(),
            colored_status(remote.status(commit)),
            commit.title(),
            upstream
        );
    }
}

// ============== Entry Points ==============

/// Converge remote branches and pull requests onto the local stack.
pub fn sync(
    session: &Session,
    host: &dyn ReviewRequestHost,
    options: SyncOptions,
) -> Result<SyncPlan> {
    let dry_run = options.dry_run;
    let pool = session.worker_pool()?;
    let namer = session.namer();
    let mut plan = SyncPlan::default();

    // Step 1: identities
    let mut local = load_local_stack(session, &pool)?;
    if local.commits.is_empty() {
        println!(
            "No commits between {} and {}",
            session.config.upstream_ref().green(),
            session.config.local_head.yellow()
        );
        return Ok(plan);
    }
    plan.rewords = plan_rewords(&local);
    if !plan.rewords.is_empty() {
        for reword in &plan.rewords {
            announce(
                dry_run,
                format!(
                    "Adding identity to {} {}",
                    short_hash(&reword.hash).yellow(),
                    reword.title
                ),
            );
        }
        if dry_run {
            for (commit, reword) in local
                .commits
                .iter_mut()
                .filter(|commit| commit.identity.is_none())
                .zip(&plan.rewords)
            {
                commit.identity = Some(reword.identity.clone());
            }
        } else {
            let hashes: Vec<String> = plan.rewords.iter().map(|r| r.hash.clone()).collect();
            rewrite_identities(session, &local.merge_base, &hashes)?;
            local = load_local_stack(session, &pool)?;
            if let Some(hash) = local.missing_identities().first() {
                bail!("commit {} still has no identity after rewriting", short_hash(hash));
            }
        }
    }

    // Step 2: observe
    let remote = load_remote_stacks(session, &pool, &local)?;
    println!("Stack on {}:", session.config.upstream_ref().green());
    print_stack_status(&local, &remote);

    let mut review_requests = find_open_review_requests(&pool, host, &local.commits, &namer)?;
    tracing::debug!(found = review_requests.len(), "Open pull requests");

    // Step 3: branches
    plan.pushes = plan_pushes(&local.commits, &review_requests, &namer)?;
    apply_pushes(session, &plan.pushes, dry_run)?;

    // Step 4: pull requests
    let base = &session.config.base;
    let initial = plan_review_requests(&local.commits, &review_requests, &namer, base)?;
    plan.creates = initial.creates;
    apply_creates(&pool, host, &plan.creates, &mut review_requests, dry_run)?;

    // Bodies list every sibling, so recompute now that the new numbers are
    // known.
    let recomputed = plan_review_requests(&local.commits, &review_requests, &namer, base)?;
    plan.edits = recomputed.edits;
    apply_edits(&pool, host, &plan.edits, &review_requests, dry_run)?;

    if plan.is_empty() {
        println!("{}", "Everything is in sync!".green());
    } else if dry_run {
        println!("{}", "Dry run mode: no changes applied.".bright_blue().bold());
    }
    Ok(plan)
}

/// Print the local stack and how each commit relates to its remote branch.
pub fn status(session: &Session, fetch: bool) -> Result<()> {
    if fetch {
        session
            .git
            .fetch(&session.config.remote)
            .with_context(|| format!("Failed to fetch {}", session.config.remote))?;
    }
    let pool = session.worker_pool()?;
    let local = load_local_stack(session, &pool)?;
    if local.commits.is_empty() {
        println!(
            "No commits between {} and {}",
            session.config.upstream_ref().green(),
            session.config.local_head.yellow()
        );
        return Ok(());
    }
    let remote = load_remote_stacks(session, &pool, &local)?;
    println!("Stack on {}:", session.config.upstream_ref().green());
    print_stack_status(&local, &remote);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::{
        config::Config,
        git::{
            Git,
            test_support::{commit, remote_and_local, sh},
        },
        pool::Cancellation,
        review::test_support::{MemoryHost, request},
        stats::Stats,
    };

    fn session(dir: &Path) -> Session {
        Session::open(dir, Config::default(), Stats::default()).unwrap()
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(4, Cancellation::default()).unwrap()
    }

    fn stack_commit(hash: &str, identity: &str) -> Commit {
        Commit {
            hash: hash.to_string(),
            message: format!("Title {identity}\n\nAbout {identity}.\n\nStack-Commit-ID: {identity}"),
            identity: Some(identity.to_string()),
        }
    }

    /// Like GitHub, report each request's head as the branch tip in `remote`.
    fn refresh_heads(host: &MemoryHost, remote: &Path) {
        let heads: Vec<String> = host.with(|s| s.requests.iter().map(|(h, _)| h.clone()).collect());
        for head in heads {
            let sha = sh(remote, "git", &["rev-parse", &format!("refs/heads/{head}")]);
            host.set_head(&head, &sha);
        }
    }

    fn remote_dir(local: &Path) -> PathBuf {
        local.parent().unwrap().join("remote")
    }

    fn remote_tip(local: &Path, branch: &str) -> Option<String> {
        let remote = Git::new(remote_dir(local), Stats::default());
        remote
            .run(&["rev-parse", "--verify", "-q", &format!("refs/heads/{branch}")])
            .ok()
            .map(|out| out.as_ref().to_string())
    }

    #[test]
    fn test_base_chain_and_bodies() {
        let commits = vec![stack_commit("h2", "b"), stack_commit("h1", "a")];
        let namer = BranchNamer::default();

        let plan = plan_review_requests(&commits, &HashMap::new(), &namer, "main").unwrap();
        assert!(plan.edits.is_empty());
        let requests: Vec<_> = plan.creates.iter().map(|c| &c.request).collect();
        assert_eq!(requests[0].head, "stack/b");
        assert_eq!(requests[0].base, "stack/a");
        assert_eq!(requests[0].title, "Title b");
        assert_eq!(requests[1].head, "stack/a");
        assert_eq!(requests[1].base, "main");

        let mut existing = HashMap::new();
        existing.insert("a".to_string(), request(11, "h1"));
        existing.insert("b".to_string(), request(12, "h2"));
        let plan = plan_review_requests(&commits, &existing, &namer, "main").unwrap();
        assert!(plan.creates.is_empty());
        assert_eq!(plan.edits.len(), 2);
        assert!(plan.edits[0].edit.body.contains("* #12 ⬅\n* #11\n"));
        assert!(plan.edits[1].edit.body.contains("* #12\n* #11 ⬅\n"));
    }

    #[test]
    fn test_matching_request_is_not_edited() {
        let commits = vec![stack_commit("h1", "a")];
        let namer = BranchNamer::default();
        let mut existing = HashMap::new();
        let mut current = request(5, "h1");
        current.title = "Title a".to_string();
        current.base_ref = "main".to_string();
        current.body = render_body(&commits[0], &[("a", 5)]).replace('\n', "\r\n");
        existing.insert("a".to_string(), current);

        let plan = plan_review_requests(&commits, &existing, &namer, "main").unwrap();
        assert_eq!(plan, ReviewPlan::default());
        assert!(plan_pushes(&commits, &existing, &namer).unwrap().is_empty());
    }

    #[test]
    fn test_push_when_missing_or_stale() {
        let commits = vec![stack_commit("h2", "b"), stack_commit("h1", "a")];
        let namer = BranchNamer::default();
        let mut existing = HashMap::new();
        existing.insert("a".to_string(), request(1, "old"));

        let pushes = plan_pushes(&commits, &existing, &namer).unwrap();
        assert_eq!(
            pushes,
            vec![
                Push {
                    hash: "h2".to_string(),
                    branch: "stack/b".to_string(),
                },
                Push {
                    hash: "h1".to_string(),
                    branch: "stack/a".to_string(),
                },
            ]
        );
        assert_eq!(pushes[0].refspec(), "h2:refs/heads/stack/b");
    }

    #[test]
    fn test_missing_identity_is_an_error() {
        let mut commit = stack_commit("h1", "a");
        commit.identity = None;
        let err = plan_pushes(&[commit], &HashMap::new(), &BranchNamer::default()).unwrap_err();
        assert!(err.to_string().contains("has no identity"));
    }

    #[test]
    fn test_blank_trailer_is_reworded() {
        let blank = Commit::parse("h2", "Title\n\nStack-Commit-ID:   ").unwrap();
        let stack = LocalStack {
            merge_base: "base".to_string(),
            commits: vec![blank, stack_commit("h1", "a")],
        };
        let rewords = plan_rewords(&stack);
        assert_eq!(rewords.len(), 1);
        assert_eq!(rewords[0].hash, "h2");
        assert_eq!(rewords[0].identity, identity::fallback_identity("h2"));
    }

    #[test]
    fn test_edit_without_request_is_a_bug_outside_dry_run() {
        let host = MemoryHost::default();
        let edits = vec![EditReview {
            identity: "a".to_string(),
            branch: "stack/a".to_string(),
            edit: ReviewRequestEdit {
                title: "t".to_string(),
                body: "b".to_string(),
                base: "main".to_string(),
            },
        }];

        apply_edits(&pool(), &host, &edits, &HashMap::new(), true).unwrap();
        let err = apply_edits(&pool(), &host, &edits, &HashMap::new(), false).unwrap_err();
        assert!(err.to_string().starts_with("bug:"));
        assert!(host.with(|s| s.edits.is_empty()));
    }

    #[test]
    fn test_two_commit_stack_end_to_end() {
        let root = tempfile::tempdir().unwrap();
        let local = remote_and_local(root.path(), &[("C", Some("c")), ("D", Some("d"))]);
        let hash_c = sh(&local, "git", &["rev-parse", "HEAD~1"]);
        let hash_d = sh(&local, "git", &["rev-parse", "HEAD"]);
        let host = MemoryHost::default();

        let plan = sync(&session(&local), &host, SyncOptions::default()).unwrap();
        assert!(plan.rewords.is_empty());
        assert_eq!(plan.pushes.len(), 2);
        assert_eq!(plan.creates.len(), 2);
        assert_eq!(remote_tip(&local, "stack/c"), Some(hash_c.clone()));
        assert_eq!(remote_tip(&local, "stack/d"), Some(hash_d.clone()));

        let requests = host.with(|s| s.requests.clone());
        let (_, d) = requests.iter().find(|(head, _)| head == "stack/d").unwrap();
        let (_, c) = requests.iter().find(|(head, _)| head == "stack/c").unwrap();
        assert_eq!(d.base_ref, "stack/c");
        assert_eq!(c.base_ref, "main");
        assert_eq!(d.title, "D");
        assert!(d.body.starts_with("This is commit: D\n\n---\n\nStack:\n\n"));
        // After the recompute both bodies list both requests.
        let list = format!("* #{} ⬅\n* #{}\n", d.number, c.number);
        assert!(d.body.contains(&list), "{}", d.body);
        assert!(c.body.contains(&format!("* #{}\n* #{} ⬅\n", d.number, c.number)));

        // A second run with nothing changed is a no-op.
        refresh_heads(&host, &remote_dir(&local));
        host.reset_counters();
        let plan = sync(&session(&local), &host, SyncOptions::default()).unwrap();
        assert!(plan.is_empty(), "{plan:?}");
        assert!(host.with(|s| s.creates.is_empty() && s.edits.is_empty()));
        assert_eq!(remote_tip(&local, "stack/d"), Some(hash_d));
    }

    #[test]
    fn test_edited_title_updates_only_that_request() {
        let root = tempfile::tempdir().unwrap();
        let local = remote_and_local(root.path(), &[("C", Some("c")), ("D", Some("d"))]);
        let hash_c = sh(&local, "git", &["rev-parse", "HEAD~1"]);
        let host = MemoryHost::default();
        sync(&session(&local), &host, SyncOptions::default()).unwrap();
        refresh_heads(&host, &remote_dir(&local));
        host.reset_counters();

        sh(
            &local,
            "git",
            &["commit", "-q", "--amend", "-m", "D renamed\n\nThis is commit: D\n\nStack-Commit-ID: d"],
        );
        let hash_d = sh(&local, "git", &["rev-parse", "HEAD"]);

        let plan = sync(&session(&local), &host, SyncOptions::default()).unwrap();
        assert_eq!(
            plan.pushes,
            vec![Push {
                hash: hash_d.clone(),
                branch: "stack/d".to_string(),
            }]
        );
        assert!(plan.creates.is_empty());
        assert_eq!(plan.edits.len(), 1);
        assert_eq!(plan.edits[0].branch, "stack/d");
        assert_eq!(plan.edits[0].edit.title, "D renamed");
        assert_eq!(remote_tip(&local, "stack/d"), Some(hash_d));
        assert_eq!(remote_tip(&local, "stack/c"), Some(hash_c));
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let local = remote_and_local(root.path(), &[("C", Some("c")), ("D", None)]);
        let head = sh(&local, "git", &["rev-parse", "HEAD"]);
        let host = MemoryHost::default();

        let plan = sync(&session(&local), &host, SyncOptions { dry_run: true }).unwrap();
        assert_eq!(plan.rewords.len(), 1);
        assert_eq!(plan.rewords[0].identity, identity::fallback_identity(&head));
        assert_eq!(plan.pushes.len(), 2);
        assert_eq!(plan.creates.len(), 2);
        assert_eq!(
            plan.creates[0].request.head,
            format!("stack/{}", identity::fallback_identity(&head))
        );

        assert_eq!(sh(&local, "git", &["rev-parse", "HEAD"]), head);
        assert_eq!(remote_tip(&local, "stack/c"), None);
        assert!(host.with(|s| s.creates.is_empty() && s.edits.is_empty()));
    }

    #[test]
    fn test_empty_stack() {
        let root = tempfile::tempdir().unwrap();
        let local = remote_and_local(root.path(), &[]);
        let host = MemoryHost::default();
        let plan = sync(&session(&local), &host, SyncOptions::default()).unwrap();
        assert!(plan.is_empty());
        assert_eq!(host.with(|s| s.lookups), 0);

        commit(&local, "C", None);
        status(&session(&local), true).unwrap();
    }
}
