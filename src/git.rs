use std::{
    fmt,
    io::Write,
    path::PathBuf,
    process::{Command, Stdio},
    time::Instant,
};

use anyhow::{Context, Result, anyhow};

use crate::stats::Stats;

#[derive(Debug)]
pub struct GitOutput {
    pub(crate) stdout: String,
}

impl GitOutput {
    pub fn output_or(self, message: impl AsRef<str>) -> Result<String> {
        if self.stdout.is_empty() {
            Err(anyhow!("{}", message.as_ref()))
        } else {
            Ok(self.stdout)
        }
    }
}

impl AsRef<str> for GitOutput {
    fn as_ref(&self) -> &str {
        &self.stdout
    }
}

/// A git invocation that exited unsuccessfully.
#[derive(Debug)]
pub struct GitError {
    /// The full command line, e.g. `git push -f origin ...`
    pub command: String,
    /// Exit status as reported by the OS
    pub status: String,
    /// Captured stdout followed by stderr
    pub output: String,
}

impl fmt::Display for GitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let output = self.output.trim();
        if output.is_empty() {
            write!(f, "{} failed ({})", self.command, self.status)
        } else {
            write!(f, "{} failed ({}): {}", self.command, self.status, output)
        }
    }
}

impl std::error::Error for GitError {}

/// Runs git in a fixed working directory.
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
    stats: Stats,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>, stats: Stats) -> Self {
        Self {
            dir: dir.into(),
            stats,
        }
    }

    pub fn run(&self, args: &[&str]) -> Result<GitOutput> {
        self.exec(args, None, &[])
    }

    /// Run with `input` written to the child's stdin.
    pub fn run_with_input(&self, args: &[&str], input: &str) -> Result<GitOutput> {
        self.exec(args, Some(input), &[])
    }

    /// Run with extra environment variables set for the child.
    pub fn run_with_env(&self, args: &[&str], env: &[(&str, &str)]) -> Result<GitOutput> {
        self.exec(args, None, env)
    }

    fn exec(&self, args: &[&str], input: Option<&str>, env: &[(&str, &str)]) -> Result<GitOutput> {
        let command = command_line(args);
        tracing::debug!("Running `{}`", command);
        let start = Instant::now();

        let mut child = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .envs(env.iter().copied())
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("running {command}"))?;

        if let Some(input) = input {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("no stdin for {command}"))?;
            stdin
                .write_all(input.as_bytes())
                .with_context(|| format!("writing stdin of {command}"))?;
        }

        let out = child
            .wait_with_output()
            .with_context(|| format!("waiting for {command}"))?;
        self.stats.record_git(args, start.elapsed());

        if !out.status.success() {
            let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
            output.push_str(&String::from_utf8_lossy(&out.stderr));
            return Err(GitError {
                command,
                status: out.status.to_string(),
                output,
            }
            .into());
        }
        Ok(GitOutput {
            stdout: String::from_utf8_lossy(&out.stdout).trim().to_string(),
        })
    }

    /// `git merge-base <a> <b>`
    pub fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        self.run(&["merge-base", a, b])?
            .output_or(format!("no merge base between {a} and {b}"))
    }

    /// `git log` over `range`, each entry rendered as
    /// `<hash><separator><message><separator>`.
    pub fn log(&self, range: &str, separator: &str) -> Result<GitOutput> {
        let pretty = format!("--pretty=%H{separator}%B{separator}");
        self.run(&["log", &pretty, range])
    }

    /// Force-push every refspec in one `git push -f` invocation.
    pub fn force_push(&self, remote: &str, refspecs: &[String]) -> Result<()> {
        let mut args = vec!["push", "-f", remote];
        args.extend(refspecs.iter().map(String::as_str));
        self.run(&args)?;
        Ok(())
    }

    /// Set (or replace) a trailer on `message` via `git interpret-trailers`.
    pub fn set_trailer(&self, message: &str, trailer: &str) -> Result<String> {
        let out = self.run_with_input(
            &["interpret-trailers", "--if-exists", "replace", "--trailer", trailer],
            message,
        )?;
        Ok(format!("{}\n", out.as_ref()))
    }

    pub fn fetch(&self, remote: &str) -> Result<()> {
        self.run(&["fetch", "--prune", remote])?;
        Ok(())
    }

    /// Abort an in-progress rebase. Failures are ignored; there may be
    /// nothing to abort.
    pub fn rebase_abort(&self) {
        if let Err(error) = self.run(&["rebase", "--abort"]) {
            tracing::debug!(%error, "git rebase --abort");
        }
    }
}

fn command_line(args: &[&str]) -> String {
    format!("git {}", args.join(" "))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{path::Path, process::Command};

    /// Run a setup command in `dir` with a fixed author, panicking on failure.
    pub fn sh(dir: &Path, program: &str, args: &[&str]) -> String {
        let out = Command::new(program)
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "Stack Tester")
            .env("GIT_AUTHOR_EMAIL", "tester@example.com")
            .env("GIT_COMMITTER_NAME", "Stack Tester")
            .env("GIT_COMMITTER_EMAIL", "tester@example.com")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "{program} {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    /// Create a commit adding an empty file named `name`, optionally carrying
    /// an identity trailer.
    pub fn commit(dir: &Path, name: &str, identity: Option<&str>) {
        let mut message = format!("{name}\n\nThis is commit: {name}");
        if let Some(identity) = identity {
            message.push_str(&format!("\n\nStack-Commit-ID: {identity}"));
        }
        std::fs::write(dir.join(name), name).unwrap();
        sh(dir, "git", &["add", name]);
        sh(dir, "git", &["commit", "--no-verify", "-q", "-m", &message]);
    }

    /// A `remote` repository with commits A, B and a clone `local` with
    /// `local_commits` added on top.
    pub fn remote_and_local(root: &Path, local_commits: &[(&str, Option<&str>)]) -> std::path::PathBuf {
        let remote = root.join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        sh(&remote, "git", &["init", "-q"]);
        sh(&remote, "git", &["symbolic-ref", "HEAD", "refs/heads/main"]);
        commit(&remote, "A", None);
        commit(&remote, "B", None);

        sh(root, "git", &["clone", "-q", "./remote", "local"]);
        let local = root.join("local");
        for (name, identity) in local_commits {
            commit(&local, name, *identity);
        }
        local
    }
}
