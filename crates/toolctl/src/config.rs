//! `.toolctl.toml` support, mirroring the teacher's `.shipper.toml` loader:
//! a workspace-relative config file with nested tables, merged with CLI
//! overrides at the call site rather than baked into this type.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

fn default_step_timeout_seconds() -> u64 {
    600
}

fn default_max_parallel_steps() -> usize {
    1
}

fn default_deep_ttl_seconds() -> u64 {
    300
}

fn default_max_depth() -> u32 {
    toolctl_types::chain::EscalationChain::DEFAULT_MAX_DEPTH
}

fn default_catalog_dir() -> PathBuf {
    PathBuf::from("recipes")
}

/// `[executor]`: per-step timeout, the sudo password env var to read at
/// execution time (never the password itself — nothing in this config is
/// ever a secret), and the parallel-step cap this crate does not yet use
/// beyond the shared PM-family mutex in `executor.rs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_step_timeout_seconds")]
    pub step_timeout_seconds: u64,
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    #[serde(default)]
    pub sudo_password_env: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            step_timeout_seconds: default_step_timeout_seconds(),
            max_parallel_steps: default_max_parallel_steps(),
            sudo_password_env: None,
        }
    }
}

/// `[probe]`: overrides the deep-tier cache TTL. The cache is keyed by
/// category but shares one TTL across categories (see `probe::deep_ttl`),
/// so there is one knob here rather than one per `ProbeCategory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_deep_ttl_seconds")]
    pub deep_ttl_seconds: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig { deep_ttl_seconds: default_deep_ttl_seconds() }
    }
}

/// `[chains]`: where chain and plan-state records live, and the escalation
/// depth cap (spec.md §4.9's `EscalationChain::max_depth`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainsConfig {
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

impl Default for ChainsConfig {
    fn default() -> Self {
        ChainsConfig { state_dir: None, max_depth: default_max_depth() }
    }
}

/// `[recipes]`: where the catalog lives on disk (`RecipeStore::load`'s
/// directory argument).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipesConfig {
    #[serde(default = "default_catalog_dir")]
    pub catalog_dir: PathBuf,
}

impl Default for RecipesConfig {
    fn default() -> Self {
        RecipesConfig { catalog_dir: default_catalog_dir() }
    }
}

/// Configuration loaded from `.toolctl.toml`. Every field has a built-in
/// default, so a missing file or a partially-filled file both produce a
/// usable `Config`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub chains: ChainsConfig,
    #[serde(default)]
    pub recipes: RecipesConfig,
}

/// CLI-flag overrides for merging over config-file values. `None`/`false`
/// means "the user did not pass this flag" (teacher's `CliOverrides`
/// convention in `shipper-cli`).
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub step_timeout_seconds: Option<u64>,
    pub max_parallel_steps: Option<usize>,
    pub sudo_password_env: Option<String>,
    pub deep_ttl_seconds: Option<u64>,
    pub state_dir: Option<PathBuf>,
    pub max_depth: Option<u32>,
    pub catalog_dir: Option<PathBuf>,
}

impl Config {
    /// Looks for `.toolctl.toml` under `workspace_root`. Returns the
    /// built-in default config, not an error, when the file is absent.
    pub fn load_from_workspace(workspace_root: &Path) -> Result<Config> {
        let path = workspace_root.join(".toolctl.toml");
        if !path.exists() {
            return Ok(Config::default());
        }
        Config::load_from_file(&path)
    }

    pub fn load_from_file(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.step_timeout_seconds == 0 {
            bail!("executor.step_timeout_seconds must be greater than 0");
        }
        if self.executor.max_parallel_steps == 0 {
            bail!("executor.max_parallel_steps must be greater than 0");
        }
        if self.probe.deep_ttl_seconds == 0 {
            bail!("probe.deep_ttl_seconds must be greater than 0");
        }
        if self.chains.max_depth == 0 {
            bail!("chains.max_depth must be greater than 0");
        }
        Ok(())
    }

    /// CLI value wins, then the config file, then the built-in default
    /// already baked into `self` by `serde(default)`.
    pub fn step_timeout(&self, cli: &CliOverrides) -> Duration {
        Duration::from_secs(cli.step_timeout_seconds.unwrap_or(self.executor.step_timeout_seconds))
    }

    pub fn max_parallel_steps(&self, cli: &CliOverrides) -> usize {
        cli.max_parallel_steps.unwrap_or(self.executor.max_parallel_steps)
    }

    pub fn sudo_password_env(&self, cli: &CliOverrides) -> Option<String> {
        cli.sudo_password_env.clone().or_else(|| self.executor.sudo_password_env.clone())
    }

    pub fn deep_ttl(&self, cli: &CliOverrides) -> Duration {
        Duration::from_secs(cli.deep_ttl_seconds.unwrap_or(self.probe.deep_ttl_seconds))
    }

    pub fn state_dir(&self, cli: &CliOverrides) -> PathBuf {
        cli.state_dir
            .clone()
            .or_else(|| self.chains.state_dir.clone())
            .unwrap_or_else(default_state_dir)
    }

    pub fn max_depth(&self, cli: &CliOverrides) -> u32 {
        cli.max_depth.unwrap_or(self.chains.max_depth)
    }

    pub fn catalog_dir(&self, cli: &CliOverrides) -> PathBuf {
        cli.catalog_dir.clone().unwrap_or_else(|| self.recipes.catalog_dir.clone())
    }

    /// Applies the merged deep-probe TTL to the process-wide cache used by
    /// `probe::probe_deep`. Called once at startup by an embedder.
    pub fn apply_probe_ttl(&self, cli: &CliOverrides) {
        crate::probe::set_deep_ttl_override(self.deep_ttl(cli));
    }
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("toolctl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_built_in_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from_workspace(dir.path()).expect("load");
        assert_eq!(config.executor.step_timeout_seconds, 600);
        assert_eq!(config.chains.max_depth, 3);
    }

    #[test]
    fn partial_file_fills_missing_tables_from_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(".toolctl.toml"), "[executor]\nstep_timeout_seconds = 120\n")
            .expect("write");
        let config = Config::load_from_workspace(dir.path()).expect("load");
        assert_eq!(config.executor.step_timeout_seconds, 120);
        assert_eq!(config.probe.deep_ttl_seconds, 300);
    }

    #[test]
    fn cli_override_wins_over_file_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(".toolctl.toml"), "[chains]\nmax_depth = 5\n").expect("write");
        let config = Config::load_from_workspace(dir.path()).expect("load");
        let cli = CliOverrides { max_depth: Some(9), ..Default::default() };
        assert_eq!(config.max_depth(&cli), 9);

        let cli_unset = CliOverrides::default();
        assert_eq!(config.max_depth(&cli_unset), 5);
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let mut config = Config::default();
        config.executor.step_timeout_seconds = 0;
        assert!(config.validate().is_err());
    }
}
