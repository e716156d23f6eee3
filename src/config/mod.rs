//! Configuration system (layered: defaults < config file < environment).

use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use serde::Deserialize;

use crate::error::TurnloopError;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "TURNLOOP_CONFIG";

/// Runtime limits for turns, tools and remote toolsets.
///
/// ```
/// use std::time::Duration;
/// use turnloop::config::RuntimeConfig;
///
/// let config = RuntimeConfig::builder()
///     .max_iterations(3)
///     .tool_timeout(Duration::from_secs(5))
///     .build();
/// assert_eq!(config.max_iterations, 3);
/// assert_eq!(config.model_timeout, Duration::from_secs(120));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct RuntimeConfig {
    /// Maximum number of tool dispatch phases per turn.
    #[builder(default = 10)]
    pub max_iterations: usize,
    /// Budget for a single tool invocation (local or remote).
    #[builder(default = Duration::from_secs(30))]
    pub tool_timeout: Duration,
    /// Budget for a single model backend call.
    #[builder(default = Duration::from_secs(120))]
    pub model_timeout: Duration,
    /// Budget for a whole turn.
    #[builder(default = Duration::from_secs(600))]
    pub turn_timeout: Duration,
    /// Budget for spawning, initializing and discovering a remote toolset.
    #[builder(default = Duration::from_secs(20))]
    pub handshake_timeout: Duration,
    /// How long a remote toolset process may take to exit after stdin closes.
    #[builder(default = Duration::from_secs(2))]
    pub teardown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// On-disk representation; every field is optional and overrides defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    max_iterations: Option<usize>,
    tool_timeout_ms: Option<u64>,
    model_timeout_ms: Option<u64>,
    turn_timeout_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    teardown_grace_ms: Option<u64>,
}

impl RuntimeConfig {
    /// Resolve the full layered configuration.
    ///
    /// Loads `.env` if present, reads the config file named by
    /// `TURNLOOP_CONFIG` (or the platform default if it exists), then
    /// applies `TURNLOOP_*` environment overrides.
    pub fn load() -> Result<Self, TurnloopError> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error

        let mut config = Self::default();
        let explicit = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        match explicit {
            Some(path) => config = config.merge_file(&path)?,
            None => {
                if let Some(path) = default_config_path().filter(|p| p.exists()) {
                    config = config.merge_file(&path)?;
                }
            }
        }
        config.merge_env(|key| std::env::var(key).ok())
    }

    /// Parse a TOML document on top of the built-in defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, TurnloopError> {
        Self::default().merge_toml(raw)
    }

    fn merge_file(self, path: &Path) -> Result<Self, TurnloopError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TurnloopError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        self.merge_toml(&raw)
    }

    fn merge_toml(mut self, raw: &str) -> Result<Self, TurnloopError> {
        let file: ConfigFile = toml::from_str(raw)
            .map_err(|e| TurnloopError::Configuration(format!("invalid config file: {e}")))?;

        if let Some(value) = file.max_iterations {
            self.max_iterations = value;
        }
        if let Some(ms) = file.tool_timeout_ms {
            self.tool_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.model_timeout_ms {
            self.model_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.turn_timeout_ms {
            self.turn_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.handshake_timeout_ms {
            self.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.teardown_grace_ms {
            self.teardown_grace = Duration::from_millis(ms);
        }
        self.validate()?;
        Ok(self)
    }

    /// Apply `TURNLOOP_*` overrides from a variable lookup.
    pub fn merge_env(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, TurnloopError> {
        if let Some(value) = parse_env(&lookup, "TURNLOOP_MAX_ITERATIONS")? {
            self.max_iterations = value as usize;
        }
        let durations: [(&str, &mut Duration); 5] = [
            ("TURNLOOP_TOOL_TIMEOUT_MS", &mut self.tool_timeout),
            ("TURNLOOP_MODEL_TIMEOUT_MS", &mut self.model_timeout),
            ("TURNLOOP_TURN_TIMEOUT_MS", &mut self.turn_timeout),
            ("TURNLOOP_HANDSHAKE_TIMEOUT_MS", &mut self.handshake_timeout),
            ("TURNLOOP_TEARDOWN_GRACE_MS", &mut self.teardown_grace),
        ];
        for (key, slot) in durations {
            if let Some(ms) = parse_env(&lookup, key)? {
                *slot = Duration::from_millis(ms);
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<(), TurnloopError> {
        if self.max_iterations == 0 {
            return Err(TurnloopError::Configuration(
                "max_iterations must be at least 1".into(),
            ));
        }
        let zero = [
            ("tool_timeout", self.tool_timeout),
            ("model_timeout", self.model_timeout),
            ("turn_timeout", self.turn_timeout),
            ("handshake_timeout", self.handshake_timeout),
        ]
        .into_iter()
        .find(|(_, value)| value.is_zero());
        if let Some((name, _)) = zero {
            return Err(TurnloopError::Configuration(format!(
                "{name} must be greater than zero"
            )));
        }
        Ok(())
    }
}

fn parse_env(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, TurnloopError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| TurnloopError::Configuration(format!("{key} must be an integer, got '{raw}'")))
}

/// Platform config location, e.g. `~/.config/turnloop/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "turnloop")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
