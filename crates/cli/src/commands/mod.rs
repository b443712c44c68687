pub mod config_cmd;
pub mod memory;
pub mod run;
pub mod serve;

use taskpilot_config::AppConfig;

/// Load the effective configuration.
///
/// Session memory is persisted under the config directory unless a path is
/// configured, so separate CLI invocations share it.
pub fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if config.memory.path.is_none() {
        config.memory.path = Some(AppConfig::config_dir().join("memory.jsonl"));
    }
    Ok(config)
}
