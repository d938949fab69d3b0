use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GitwardenError, Result};

/// Env var that forces in-process execution regardless of the config file.
pub const IN_PROCESS_ENV: &str = "GITWARDEN_IN_PROCESS";

/// Returns the global config directory path: `~/.config/gitwarden/`
pub fn dirs_global() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".config").join("gitwarden")
}

/// Runtime configuration for the command pipeline and its worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitwardenConfig {
    /// The external version-control binary. Default: `git` (PATH lookup).
    #[serde(default = "default_git_path")]
    pub git_path: String,

    /// Program launched for each sandbox host. Defaults to the running executable.
    #[serde(default)]
    pub host_program: Option<PathBuf>,

    /// Capacity given to fresh workers and to replacements of workers that fell behind.
    #[serde(default = "default_baseline_capacity")]
    pub baseline_capacity: usize,

    /// Upper bound for adaptive capacity growth.
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,

    /// Average spawn latency (ms) above which a sandbox reports itself slow.
    #[serde(default = "default_slow_spawn_threshold")]
    pub slow_spawn_threshold_ms: u64,

    /// Skip the worker pool and always run commands as local subprocesses.
    #[serde(default)]
    pub in_process: bool,

    /// gpg the signing wrapper runs when git config sets no `gpg.program`.
    #[serde(default = "default_signing_program")]
    pub signing_program: String,

    /// `DISPLAY` value forced on credentialed invocations when none is set.
    #[serde(default = "default_display_placeholder")]
    pub display_placeholder: String,

    /// How long the askpass/credential helpers wait for an answer.
    #[serde(default = "default_prompt_timeout")]
    pub prompt_timeout_secs: u64,
}

fn default_git_path() -> String {
    "git".into()
}
fn default_baseline_capacity() -> usize {
    10
}
fn default_max_capacity() -> usize {
    100
}
fn default_slow_spawn_threshold() -> u64 {
    20
}
fn default_signing_program() -> String {
    "gpg".into()
}
fn default_display_placeholder() -> String {
    "gitwarden-placeholder".into()
}
fn default_prompt_timeout() -> u64 {
    120
}

impl Default for GitwardenConfig {
    fn default() -> Self {
        Self {
            git_path: default_git_path(),
            host_program: None,
            baseline_capacity: 10,
            max_capacity: 100,
            slow_spawn_threshold_ms: 20,
            in_process: false,
            signing_program: default_signing_program(),
            display_placeholder: default_display_placeholder(),
            prompt_timeout_secs: 120,
        }
    }
}

impl GitwardenConfig {
    /// Load config from a YAML file. Returns default if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| GitwardenError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load `~/.config/gitwarden/config.yml` and apply env overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&dirs_global().join("config.yml"))?;
        if env_flag(IN_PROCESS_ENV) {
            config.in_process = true;
        }
        Ok(config)
    }

    /// The sandbox host program, falling back to the current executable.
    pub fn resolve_host_program(&self) -> Result<PathBuf> {
        match &self.host_program {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref().map(str::trim),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = GitwardenConfig::load_from(&tmp.path().join("nope.yml")).unwrap();
        assert_eq!(config.git_path, "git");
        assert_eq!(config.baseline_capacity, 10);
        assert_eq!(config.max_capacity, 100);
        assert!(!config.in_process);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yml");
        std::fs::write(&path, "git_path: /usr/local/bin/git\nin_process: true\n").unwrap();

        let config = GitwardenConfig::load_from(&path).unwrap();
        assert_eq!(config.git_path, "/usr/local/bin/git");
        assert!(config.in_process);
        assert_eq!(config.slow_spawn_threshold_ms, 20);
        assert_eq!(config.signing_program, "gpg");
    }

    #[test]
    fn malformed_file_reports_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yml");
        std::fs::write(&path, "baseline_capacity: [not a number\n").unwrap();

        let err = GitwardenConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, GitwardenError::ConfigParse { .. }));
        assert!(err.to_string().contains("config.yml"));
    }
}
