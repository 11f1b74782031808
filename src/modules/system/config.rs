use std::fs;
use std::path::PathBuf;

use crate::models::AppConfig;

const CONFIG_FILE: &str = "config.json";

// The working directory holds everything the proxy persists: the config
// file, both sqlite stores, and the log directory.
pub fn get_data_dir() -> Result<PathBuf, String> {
    let dir = match std::env::var("PASSERELLE_DATA_DIR") {
        Ok(custom) if !custom.trim().is_empty() => PathBuf::from(custom),
        _ => PathBuf::from("passerelle-data"),
    };

    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| format!("failed_to_create_data_dir: {}", e))?;
    }

    Ok(dir)
}

pub fn load_app_config() -> Result<AppConfig, String> {
    let data_dir = get_data_dir()?;
    let config_path = data_dir.join(CONFIG_FILE);

    if !config_path.exists() {
        let config = AppConfig::new();
        let _ = save_app_config(&config);
        return Ok(config);
    }

    let content = fs::read_to_string(&config_path)
        .map_err(|e| format!("failed_to_read_config_file: {}", e))?;

    serde_json::from_str(&content).map_err(|e| format!("failed_to_parse_config_file: {}", e))
}

pub fn save_app_config(config: &AppConfig) -> Result<(), String> {
    let data_dir = get_data_dir()?;
    let config_path = data_dir.join(CONFIG_FILE);

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("failed_to_serialize_config: {}", e))?;

    fs::write(&config_path, content).map_err(|e| format!("failed_to_save_config: {}", e))
}
