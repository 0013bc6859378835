//! Layered configuration.
//!
//! Defaults, then the user config file
//! (`$XDG_CONFIG_HOME/stack-sync/config.yaml`), then `.stack-sync.yml` at the
//! repository root, then command-line flags. An explicit `--config` file
//! replaces both file layers.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pool::MAX_IN_FLIGHT;

/// Name of the per-repository config file.
pub const REPO_CONFIG_FILE: &str = ".stack-sync.yml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    /// Git remote to push branches to.
    pub remote: String,
    /// Branch on the remote that the bottom of the stack targets.
    pub base: String,
    /// Local ref at the top of the stack.
    pub local_head: String,
    /// Namespace for stack branches: `<branch_prefix>/<identity>`.
    pub branch_prefix: String,
    /// Worker count for GitHub fan-out, at most [`MAX_IN_FLIGHT`].
    pub concurrency: usize,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            base: "main".to_string(),
            local_head: "HEAD".to_string(),
            branch_prefix: "stack".to_string(),
            concurrency: MAX_IN_FLIGHT,
            verbose: false,
        }
    }
}

/// One partial layer of configuration. Unset fields fall through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub remote: Option<String>,
    pub base: Option<String>,
    pub local_head: Option<String>,
    pub branch_prefix: Option<String>,
    pub concurrency: Option<usize>,
    pub verbose: Option<bool>,
}

impl Config {
    pub fn apply(&mut self, layer: ConfigLayer) {
        if let Some(remote) = layer.remote {
            self.remote = remote;
        }
        if let Some(base) = layer.base {
            self.base = base;
        }
        if let Some(local_head) = layer.local_head {
            self.local_head = local_head;
        }
        if let Some(branch_prefix) = layer.branch_prefix {
            self.branch_prefix = branch_prefix;
        }
        if let Some(concurrency) = layer.concurrency {
            self.concurrency = concurrency.clamp(1, MAX_IN_FLIGHT);
        }
        if let Some(verbose) = layer.verbose {
            self.verbose = verbose;
        }
    }

    /// `<remote>/<base>`, the upstream ref the stack sits on.
    pub fn upstream_ref(&self) -> String {
        format!("{}/{}", self.remote, self.base)
    }

    /// Build the effective config for a repository rooted at `repo_root`.
    pub fn load(
        repo_root: Option<&Path>,
        explicit: Option<&Path>,
        flags: ConfigLayer,
    ) -> Result<Self> {
        let mut config = Config::default();
        match explicit {
            Some(path) => {
                let layer = read_layer(path)?.with_context(|| {
                    format!("Config file {} does not exist", path.display())
                })?;
                config.apply(layer);
            }
            None => {
                let mut paths: Vec<PathBuf> = user_config_path().into_iter().collect();
                paths.extend(repo_root.map(|root| root.join(REPO_CONFIG_FILE)));
                for path in paths {
                    if let Some(layer) = read_layer(&path)? {
                        tracing::debug!("Loaded config file {}", path.display());
                        config.apply(layer);
                    }
                }
            }
        }
        config.apply(flags);
        tracing::debug!(?config, "Effective config");
        Ok(config)
    }
}

/// Read one layer. A missing file is `Ok(None)`.
pub fn read_layer(path: &Path) -> Result<Option<ConfigLayer>> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(error).with_context(|| format!("reading {}", path.display()));
        }
    };
    if data.trim().is_empty() {
        return Ok(Some(ConfigLayer::default()));
    }
    let layer = serde_yaml::from_str(&data)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(Some(layer))
}

fn user_config_path() -> Option<PathBuf> {
    let base_dirs = xdg::BaseDirectories::with_prefix(env!("CARGO_PKG_NAME"));
    base_dirs.get_config_file("config.yaml")
}
