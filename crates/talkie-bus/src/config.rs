use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use talkie_types::config::TalkieConfig;

/// Returns the Talkie home directory (~/.talkie/), or ./.talkie when no home
/// directory can be determined.
pub fn talkie_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".talkie")
}

/// Returns the path to the config file (~/.talkie/config.toml)
pub fn config_path() -> PathBuf {
    talkie_home().join("config.toml")
}

/// Returns the settings database path, honouring `[storage] settings_db`.
pub fn settings_db_path(config: &TalkieConfig) -> PathBuf {
    match &config.storage.settings_db {
        Some(path) => PathBuf::from(path),
        None => talkie_home().join("settings.db"),
    }
}

/// Load config from ~/.talkie/config.toml, creating the default if it doesn't exist.
pub fn load_config() -> Result<TalkieConfig> {
    load_config_from(&config_path())
}

pub fn load_config_from(path: &Path) -> Result<TalkieConfig> {
    if !path.exists() {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let default = TalkieConfig::default();
        save_config_to(&default, path)?;
        return Ok(default);
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: TalkieConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;
    Ok(config)
}

/// Save config to disk, overwriting the existing file.
pub fn save_config(config: &TalkieConfig) -> Result<()> {
    save_config_to(config, &config_path())
}

pub fn save_config_to(config: &TalkieConfig, path: &Path) -> Result<()> {
    let toml_str = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, toml_str)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}
