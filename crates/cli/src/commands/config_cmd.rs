//! `taskpilot config` — Print the effective configuration.

use taskpilot_config::AppConfig;

use super::load_config;

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config()?;
    if config.model.api_key.is_some() {
        config.model.api_key = Some("***".into());
    }
    println!("# {}", AppConfig::config_dir().join("config.toml").display());
    println!("{}", config.to_toml());
    Ok(())
}
