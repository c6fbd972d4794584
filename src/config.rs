use crate::error::{RaincheckError, Result};
use crate::models::WateringSource;
use dialoguer::{Input, Password};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

pub const DEFAULT_CONTROLLER_URL: &str = "https://api.rach.io/1/public";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub controller: ControllerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    #[serde(default, deserialize_with = "empty_if_null")]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Remaining-call count under which every response logs a warning.
    #[serde(default = "default_low_remaining_warning")]
    pub low_remaining_warning: i64,
}

/// `api_key: ${UNSET}` substitutes to a bare `api_key:`, which YAML reads as null.
fn empty_if_null<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn default_base_url() -> String {
    DEFAULT_CONTROLLER_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_low_remaining_warning() -> i64 {
    100
}

impl ControllerConfig {
    pub fn has_credential(&self) -> bool {
        let key = self.api_key.trim();
        !key.is_empty() && !key.contains("${")
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            low_remaining_warning: default_low_remaining_warning(),
        }
    }
}

impl std::fmt::Debug for ControllerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("low_remaining_warning", &self.low_remaining_warning)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    /// Lookback window for trend conditions.
    #[serde(default = "default_history_days")]
    pub history_days: i64,
    #[serde(default = "default_watering_source")]
    pub watering_source: WateringSource,
}

fn default_interval_minutes() -> u64 {
    15
}

fn default_history_days() -> i64 {
    7
}

fn default_watering_source() -> WateringSource {
    WateringSource::Automation
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            history_days: default_history_days(),
            watering_source: default_watering_source(),
        }
    }
}

impl Config {
    pub fn load(config_override: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_override {
            Some(p) => p,
            None => Self::find_config_path()?,
        };

        if !config_path.exists() {
            return Err(RaincheckError::Config(format!(
                "Config file not found at {:?}. Run `raincheck init` to set up.",
                config_path
            )));
        }

        let config_str = std::fs::read_to_string(&config_path)
            .map_err(|e| RaincheckError::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&config_str)
    }

    /// Parse YAML after `${VAR}` substitution.
    pub fn parse(content: &str) -> Result<Self> {
        let content = Self::substitute_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| RaincheckError::Config(format!("Failed to parse config: {}", e)))?;

        if config.controller.timeout_secs == 0 {
            return Err(RaincheckError::Config(
                "controller.timeout_secs must be greater than zero".into(),
            ));
        }
        if config.engine.interval_minutes == 0 {
            return Err(RaincheckError::Config(
                "engine.interval_minutes must be greater than zero".into(),
            ));
        }

        Ok(config)
    }

    /// Search for config.yaml in standard locations.
    /// Returns the path of the first found config, or the XDG default path if none found.
    fn find_config_path() -> Result<PathBuf> {
        let local_config = PathBuf::from("config/config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let xdg_config = config_dir.join("raincheck").join("config.yaml");
            if xdg_config.exists() {
                return Ok(xdg_config);
            }
        }

        Self::default_config_path()
    }

    /// Default path for writing new config files (~/.config/raincheck/config.yaml).
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| RaincheckError::Config("Cannot determine config directory".into()))?
            .join("raincheck");
        Ok(config_dir.join("config.yaml"))
    }

    /// Run interactive setup prompts and write config to disk.
    /// Returns the loaded Config and the path it was written to.
    pub fn setup_interactive() -> Result<(Self, PathBuf)> {
        println!();
        println!("Let's set up raincheck.");
        println!();

        println!("Irrigation controller");
        let api_key: String = Password::new()
            .with_prompt("  API key (use ${VAR} to read from the environment)")
            .allow_empty_password(true)
            .interact()
            .map_err(|e| RaincheckError::Config(format!("Input error: {}", e)))?;

        let base_url: String = Input::new()
            .with_prompt("  API base URL")
            .default(DEFAULT_CONTROLLER_URL.into())
            .interact_text()
            .map_err(|e| RaincheckError::Config(format!("Input error: {}", e)))?;

        let timeout_secs: u64 = Input::new()
            .with_prompt("  Request timeout (seconds)")
            .default(default_timeout_secs())
            .interact_text()
            .map_err(|e| RaincheckError::Config(format!("Input error: {}", e)))?;

        println!();

        println!("Rule engine");
        let interval_minutes: u64 = Input::new()
            .with_prompt("  Evaluation interval (minutes)")
            .default(default_interval_minutes())
            .interact_text()
            .map_err(|e| RaincheckError::Config(format!("Input error: {}", e)))?;

        println!();

        let config = Config {
            controller: ControllerConfig {
                api_key,
                base_url,
                timeout_secs: timeout_secs.max(1),
                low_remaining_warning: default_low_remaining_warning(),
            },
            engine: EngineConfig {
                interval_minutes: interval_minutes.max(1),
                ..EngineConfig::default()
            },
        };

        let config_path = Self::default_config_path()?;
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let yaml = serde_yaml::to_string(&config)
            .map_err(|e| RaincheckError::Config(format!("Failed to serialize config: {}", e)))?;

        let content = format!(
            "# raincheck configuration\n# Generated by `raincheck init`\n# Environment variable substitution (${{VAR}}) is supported.\n\n{}",
            yaml
        );
        std::fs::write(&config_path, content)?;

        println!("Configuration saved to {}", config_path.display());
        println!();

        Ok((config, config_path))
    }

    fn substitute_env_vars(content: &str) -> Result<String> {
        let mut result = content.to_string();

        let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
            .map_err(|e| RaincheckError::Config(format!("Bad substitution pattern: {}", e)))?;

        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let placeholder = &cap[0];
            let value = std::env::var(var_name).unwrap_or_else(|_| {
                tracing::warn!(var = var_name, "Config references an unset environment variable");
                String::new()
            });
            result = result.replace(placeholder, &value);
        }

        Ok(result)
    }

    pub fn data_dir(data_dir_override: Option<&PathBuf>) -> Result<PathBuf> {
        if let Some(dir) = data_dir_override {
            std::fs::create_dir_all(dir)?;
            return Ok(dir.clone());
        }

        if let Ok(dir) = std::env::var("RAINCHECK_DATA_DIR") {
            let p = PathBuf::from(dir);
            std::fs::create_dir_all(&p)?;
            return Ok(p);
        }

        let data_dir = dirs::data_dir()
            .ok_or_else(|| RaincheckError::Config("Cannot determine data directory".into()))?
            .join("raincheck");

        std::fs::create_dir_all(&data_dir)?;
        Ok(data_dir)
    }

    pub fn db_path(data_dir_override: Option<&PathBuf>) -> Result<PathBuf> {
        Ok(Self::data_dir(data_dir_override)?.join("raincheck.db"))
    }
}
