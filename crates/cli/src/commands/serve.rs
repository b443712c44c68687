//! `taskpilot serve` — Start the HTTP API server.

use std::path::PathBuf;

use super::load_config;

pub async fn run(
    port_override: Option<u16>,
    host_override: Option<String>,
    base_workspace: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config()?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }
    if let Some(host) = host_override {
        config.gateway.host = host;
    }
    if base_workspace.is_some() {
        config.gateway.base_workspace = base_workspace;
    }
    config.validate()?;

    let model = taskpilot_providers::build_from_config(&config.model)?;

    println!("TaskPilot Gateway");
    println!("   Listening: http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:     {} ({})", config.model.coder_model, config.model.base_url);
    println!(
        "   Workspace: {}",
        config.gateway.resolved_base_workspace().display()
    );

    taskpilot_gateway::start(config, model).await?;

    Ok(())
}
