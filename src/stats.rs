use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use colored::Colorize;

/// Statistics for a single type of external command
#[derive(Debug, Default, Clone)]
pub struct CommandStats {
    pub count: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
}

impl CommandStats {
    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total_duration += duration;
        if duration > self.max_duration {
            self.max_duration = duration;
        }
    }

    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.count as u32
        }
    }
}

/// Aggregated statistics for git invocations and GitHub API calls
#[derive(Debug, Default, Clone)]
pub struct CommandTable {
    /// Stats keyed by command label (e.g., "git log", "api list")
    pub by_command: HashMap<String, CommandStats>,
    /// Overall stats
    pub total: CommandStats,
}

impl CommandTable {
    pub fn record(&mut self, command: &str, duration: Duration) {
        self.total.record(duration);
        self.by_command
            .entry(command.to_string())
            .or_default()
            .record(duration);
    }
}

/// Per-session statistics handle.
///
/// Cloned into every component that runs external commands. Worker threads
/// record concurrently, so the table lives behind a mutex.
#[derive(Debug, Default, Clone)]
pub struct Stats(Arc<Mutex<CommandTable>>);

impl Stats {
    /// Record a git command execution. `-c key=value` overrides are skipped so
    /// the subcommand name is what gets counted.
    pub fn record_git(&self, args: &[&str], duration: Duration) {
        let mut iter = args.iter();
        let mut command: &str = "unknown";
        while let Some(arg) = iter.next() {
            if *arg == "-c" {
                iter.next();
                continue;
            }
            command = *arg;
            break;
        }
        self.record(&format!("git {command}"), duration);
    }

    pub fn record(&self, label: &str, duration: Duration) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(label, duration);
    }

    /// Get a snapshot of current stats
    pub fn snapshot(&self) -> CommandTable {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Print a timing summary to stderr
    pub fn print_summary(&self) {
        let stats = self.snapshot();

        if stats.total.count == 0 {
            return;
        }

        eprintln!();
        eprintln!("{}", "=== Command Performance Summary ===".yellow().bold());
        eprintln!();

        // Sort commands by total time (descending)
        let mut commands: Vec<_> = stats.by_command.iter().collect();
        commands.sort_by(|a, b| b.1.total_duration.cmp(&a.1.total_duration));

        eprintln!(
            "{:<24} {:>8} {:>12} {:>12} {:>12}",
            "Command", "Count", "Total", "Avg", "Max"
        );
        eprintln!("{}", "-".repeat(68));

        for (cmd, cmd_stats) in commands {
            eprintln!(
                "{:<24} {:>8} {:>12.2?} {:>12.2?} {:>12.2?}",
                cmd,
                cmd_stats.count,
                cmd_stats.total_duration,
                cmd_stats.avg_duration(),
                cmd_stats.max_duration
            );
        }

        eprintln!("{}", "-".repeat(68));
        eprintln!(
            "{:<24} {:>8} {:>12.2?} {:>12.2?} {:>12.2?}",
            "TOTAL".bold(),
            stats.total.count,
            stats.total.total_duration,
            stats.total.avg_duration(),
            stats.total.max_duration
        );
        eprintln!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_git_skips_config_overrides() {
        let stats = Stats::default();
        stats.record_git(
            &["-c", "core.hooksPath=", "rebase", "-i"],
            Duration::from_millis(5),
        );
        stats.record_git(&["log", "HEAD"], Duration::from_millis(1));
        stats.record_git(&["log", "HEAD"], Duration::from_millis(3));

        let table = stats.snapshot();
        assert_eq!(table.total.count, 3);
        assert_eq!(table.by_command["git rebase"].count, 1);
        let log = &table.by_command["git log"];
        assert_eq!(log.count, 2);
        assert_eq!(log.max_duration, Duration::from_millis(3));
        assert_eq!(log.avg_duration(), Duration::from_millis(2));
    }
}
