use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "WEEKI_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of agent executions running at once, across all tasks.
    pub max_agents: usize,
    /// Per-execution deadline in seconds.
    pub agent_timeout_secs: u64,
    /// How many times a retryable sub-task failure is retried.
    pub retry_limit: u32,
    /// Stop scheduling new sub-tasks of a task after its first permanent failure.
    pub fail_fast: bool,
    /// Simulated work time of the bundled agents, in milliseconds.
    pub agent_delay_ms: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_agents: 10,
            agent_timeout_secs: 300,
            retry_limit: 3,
            fail_fast: false,
            agent_delay_ms: 1000,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn weeki_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".weeki"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::weeki_dir()?.join("weeki.toml"))
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn agent_delay(&self) -> Duration {
        Duration::from_millis(self.agent_delay_ms)
    }

    /// Load `~/.weeki/weeki.toml`, then apply `WEEKI_*` environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            max_agents = config.max_agents,
            agent_timeout_secs = config.agent_timeout_secs,
            retry_limit = config.retry_limit,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                debug!(dir = %dir.display(), "creating config directory");
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Apply `WEEKI_*` overrides from a key/value source.
    ///
    /// Unrelated keys are ignored; a recognised key with an unparsable value
    /// is a validation error.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "MAX_AGENTS" => self.max_agents = parse_var(&key, &value)?,
                "AGENT_TIMEOUT" => self.agent_timeout_secs = parse_var(&key, &value)?,
                "RETRY_LIMIT" => self.retry_limit = parse_var(&key, &value)?,
                "AGENT_DELAY_MS" => self.agent_delay_ms = parse_var(&key, &value)?,
                "FAIL_FAST" => {
                    self.fail_fast = value == "1" || value.eq_ignore_ascii_case("true")
                }
                "LOG_LEVEL" => self.log_level = value.to_lowercase(),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_agents == 0 {
            return Err(Error::Validation(
                "max_agents must be at least 1".to_string(),
            ));
        }
        if self.agent_timeout_secs == 0 {
            return Err(Error::Validation(
                "agent_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Validation(format!("{key} has invalid value '{value}'")))
}
