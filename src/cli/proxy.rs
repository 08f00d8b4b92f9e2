use anyhow::Result;
use std::path::Path;

use crate::server::settings::Settings;

/// Start the proxy with the configuration at `config`
pub async fn run_proxy(config: &Path) -> Result<()> {
    let settings = Settings::load(config)?;
    crate::server::run_server(settings).await
}

/// Load and compile the configuration, reporting the outcome
pub fn check_config(config: &Path) -> Result<()> {
    println!("Checking configuration {}...", config.display());
    match Settings::load(config) {
        Ok(settings) => {
            println!("✓ Configuration is valid");
            println!("  Listen address: {}", settings.addr);
            for (source, rule) in &settings.rule {
                println!(
                    "  {} -> {} ({})",
                    settings
                        .registry_host(source)
                        .unwrap_or_else(|| source.clone()),
                    settings
                        .registry_host(&rule.mirror_registry)
                        .unwrap_or_else(|| rule.mirror_registry.clone()),
                    rule.path_tpl
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
