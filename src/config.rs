use crate::types::UpdraftSettings;
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;

pub const APP_NAME: &str = "updraft";
pub const CONFIG_FILE_NAME: &str = "config.json";

pub fn get_config_file_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("UPDRAFT_CONFIG_PATH") {
        return Ok(PathBuf::from(path));
    }
    let path = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(APP_NAME)
        .join(CONFIG_FILE_NAME);
    tracing::debug!("Config file path: {}", path.display());
    Ok(path)
}

/// Settings exactly as stored on disk, defaults when the file is absent.
pub fn load_stored_settings() -> Result<UpdraftSettings> {
    let config_path = get_config_file_path()?;

    if !config_path.exists() {
        return Ok(UpdraftSettings::default());
    }
    let content = fs::read_to_string(&config_path)
        .with_context(|| format!("Could not read config file at {}", config_path.display()))?;
    serde_json::from_str(&content).with_context(|| "Could not parse config file as JSON")
}

/// Stored settings with environment overrides applied on top.
pub fn load_settings() -> Result<UpdraftSettings> {
    let mut settings = load_stored_settings()?;

    if let Ok(secs) = std::env::var("UPDRAFT_TIMEOUT_SECS") {
        if let Ok(secs) = secs.parse::<u64>() {
            settings.network_timeout_secs = secs;
        }
    }

    if let Ok(root) = std::env::var("UPDRAFT_WORKSPACE_ROOT") {
        settings.workspace_root = Some(root);
    }

    if let Ok(endpoints) = std::env::var("UPDRAFT_ENDPOINTS") {
        settings.endpoints = split_list(&endpoints);
    }

    Ok(settings)
}

pub fn save_settings(settings: &UpdraftSettings) -> Result<()> {
    let config_path = get_config_file_path()?;
    let config_dir = config_path
        .parent()
        .ok_or_else(|| anyhow!("Invalid config path"))?;

    fs::create_dir_all(config_dir)?;

    let content = serde_json::to_string_pretty(settings)?;
    let temp_path = config_path.with_extension("tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, &config_path)?;

    Ok(())
}

pub fn normalize_key(key: &str) -> String {
    key.replace('-', "_")
        .chars()
        .map(|c| {
            if c.is_ascii_uppercase() {
                format!("_{}", c.to_lowercase())
            } else {
                c.to_string()
            }
        })
        .collect::<String>()
        .to_lowercase()
}

pub fn setting_keys() -> Vec<String> {
    match serde_json::to_value(UpdraftSettings::default()) {
        Ok(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

pub fn get_setting(settings: &UpdraftSettings, key: &str) -> Result<Value> {
    let key = normalize_key(key);
    let value = serde_json::to_value(settings)?;
    value
        .get(&key)
        .cloned()
        .ok_or_else(|| unknown_key(&key))
}

/// Set one setting from its textual form, interpreting the text according to
/// the type the setting already has.
pub fn set_setting(settings: &mut UpdraftSettings, key: &str, raw: &str) -> Result<()> {
    let key = normalize_key(key);
    let mut value = serde_json::to_value(&*settings)?;
    let map = value
        .as_object_mut()
        .ok_or_else(|| anyhow!("Settings did not serialize to an object"))?;
    let current = map.get(&key).ok_or_else(|| unknown_key(&key))?;

    let parsed = match current {
        Value::Array(_) => Value::from(split_list(raw)),
        Value::Bool(_) => Value::Bool(raw.eq_ignore_ascii_case("true") || raw == "1"),
        Value::Number(_) => {
            let n = raw
                .parse::<u64>()
                .with_context(|| format!("Invalid value for '{}': expected a number", key))?;
            Value::from(n)
        }
        Value::Null if raw.is_empty() => Value::Null,
        _ => Value::String(raw.to_string()),
    };
    map.insert(key.clone(), parsed);

    *settings = serde_json::from_value(value)
        .with_context(|| format!("Invalid value for '{}'", key))?;
    Ok(())
}

pub fn unset_setting(settings: &mut UpdraftSettings, key: &str) -> Result<()> {
    let key = normalize_key(key);
    let defaults = serde_json::to_value(UpdraftSettings::default())?;
    let default_value = defaults.get(&key).cloned().ok_or_else(|| unknown_key(&key))?;

    let mut value = serde_json::to_value(&*settings)?;
    if let Some(map) = value.as_object_mut() {
        map.insert(key, default_value);
    }
    *settings = serde_json::from_value(value)?;
    Ok(())
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn unknown_key(key: &str) -> anyhow::Error {
    anyhow!(
        "'{}' is not a valid configuration setting. Valid settings: {}",
        key,
        setting_keys().join(", ")
    )
}
