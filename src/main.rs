use std::{env, io, path::PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, reload, util::SubscriberInitExt};

use stack_sync::{
    config::{Config, ConfigLayer},
    git::Git,
    git2_ops::GitRepo,
    github::GitHubClient,
    remote::get_repo_identifier,
    rewrite::RewriteHook,
    session::Session,
    stats::Stats,
    sync::{self, SyncOptions},
};

#[derive(Parser)]
#[command(author, version, about, arg_required_else_help = true)]
struct Args {
    #[arg(long, short, global = true, help = "Enable verbose output")]
    verbose: bool,

    /// Read configuration from this file instead of the user and repository
    /// config files.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print git and GitHub API call statistics on exit.
    #[arg(long, global = true)]
    stats: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push every commit of the stack to its own branch and open or update
    /// one pull request per commit.
    Push {
        /// Remote to push branches to.
        #[arg(long, short)]
        remote: Option<String>,
        /// Branch the bottom of the stack targets.
        #[arg(long, short)]
        base: Option<String>,
        /// Show what would change without changing anything.
        #[arg(long, short = 'n')]
        dry_run: bool,
        /// Local ref at the top of the stack.
        #[arg(long)]
        head: Option<String>,
    },
    /// Show each commit of the stack and the state of its remote branch.
    Status {
        #[arg(long, short)]
        remote: Option<String>,
        #[arg(long, short)]
        base: Option<String>,
        /// Fetch the remote first.
        #[arg(long)]
        fetch: bool,
    },
    /// Print shell completions.
    Completion { shell: Shell },
    /// Sequence editor used while rewriting history.
    #[command(hide = true)]
    RebaseEditTodo { selection: PathBuf, todo: PathBuf },
    /// Message editor used while rewriting history.
    #[command(hide = true)]
    RebaseAddTrailer { selection: PathBuf, message: PathBuf },
}

type LogHandle = reload::Handle<EnvFilter, Registry>;

fn main() {
    if let Err(e) = inner_main() {
        tracing::error!(error = ?e);
        std::process::exit(1);
    }
    std::process::exit(0);
}

fn env_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn init_tracing(verbose: bool) -> Result<LogHandle> {
    let (filter, handle) = reload::Layer::new(env_filter(verbose));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false),
        )
        .try_init()
        .context("initializing logging")?;
    Ok(handle)
}

fn inner_main() -> Result<()> {
    let args = Args::parse();
    let log = init_tracing(args.verbose)?;
    let stats = Stats::default();

    let result = run(args.command, args.config, args.verbose, &log, &stats);
    if args.stats {
        stats.print_summary();
    }
    result
}

fn run(
    command: Commands,
    config_file: Option<PathBuf>,
    verbose: bool,
    log: &LogHandle,
    stats: &Stats,
) -> Result<()> {
    match command {
        Commands::Push {
            remote,
            base,
            dry_run,
            head,
        } => {
            let flags = ConfigLayer {
                remote,
                base,
                local_head: head,
                ..flag_layer(verbose)
            };
            let session = open_session(config_file, flags, log, stats)?;
            let repo_id = get_repo_identifier(&session.repo, &session.config.remote)?;
            tracing::debug!("GitHub repository {}", repo_id.full_name());
            let client = GitHubClient::from_env(repo_id, session.stats.clone())?;
            sync::sync(&session, &client, SyncOptions { dry_run })?;
            Ok(())
        }
        Commands::Status {
            remote,
            base,
            fetch,
        } => {
            let flags = ConfigLayer {
                remote,
                base,
                ..flag_layer(verbose)
            };
            let session = open_session(config_file, flags, log, stats)?;
            sync::status(&session, fetch)
        }
        Commands::Completion { shell } => {
            let mut command = Args::command();
            clap_complete::generate(shell, &mut command, env!("CARGO_PKG_NAME"), &mut io::stdout());
            Ok(())
        }
        Commands::RebaseEditTodo { selection, todo } => {
            RewriteHook::Select { selection, todo }.run(&hook_git(stats)?)
        }
        Commands::RebaseAddTrailer { selection, message } => {
            RewriteHook::Edit { selection, message }.run(&hook_git(stats)?)
        }
    }
}

/// `--verbose` only ever turns verbosity on; unset defers to config files.
fn flag_layer(verbose: bool) -> ConfigLayer {
    ConfigLayer {
        verbose: verbose.then_some(true),
        ..Default::default()
    }
}

fn open_session(
    config_file: Option<PathBuf>,
    flags: ConfigLayer,
    log: &LogHandle,
    stats: &Stats,
) -> Result<Session> {
    let cwd = env::current_dir()?;
    let repo = GitRepo::discover(&cwd, stats.clone())?;
    let root = repo.root()?;
    let config = Config::load(Some(&root), config_file.as_deref(), flags)?;
    if config.verbose {
        log.modify(|filter| *filter = env_filter(true))
            .context("raising log level")?;
    }
    tracing::debug!("Repository root: {}", root.display());
    Session::new(config, repo, stats.clone())
}

/// Hooks run inside the rebase, in the repository's working tree.
fn hook_git(stats: &Stats) -> Result<Git> {
    Ok(Git::new(env::current_dir()?, stats.clone()))
}
