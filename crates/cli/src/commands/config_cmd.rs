//! `weft config`: Configuration management commands.

use weft_config::AppConfig;

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   ok  Config parsed and validated");

            let warnings = advisories(&config);
            if !warnings.is_empty() {
                println!();
                for w in &warnings {
                    println!("   warning: {w}");
                }
            }

            println!();
            println!("   Provider:   {}", config.default_provider);
            println!("   Model:      {}", config.default_model);
            println!("   Gateway:    {}:{}", config.gateway.host, config.gateway.port);
            println!(
                "   Store:      {} (debounce {} ms)",
                config.persistence.backend, config.persistence.debounce_ms
            );
            println!("   Max turns:  {}", config.agent.max_turns);
            println!(
                "   Plan gate:  {}",
                if config.agent.plan_approval { config.agent.plan_marker.as_str() } else { "off" }
            );
            println!("   Delegated:  {} tool(s)", config.tools.delegated.len());
        }
        Err(e) => {
            println!("   error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

/// Settings that load fine but will likely misbehave at runtime.
fn advisories(config: &AppConfig) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if !config.has_api_key() && config.default_provider != "ollama" {
        warnings.push("No API key set (set WEFT_API_KEY, OPENROUTER_API_KEY or OPENAI_API_KEY)");
    }
    if config.gateway.host == "0.0.0.0" {
        warnings.push("Gateway binds all interfaces and has no authentication");
    }
    if config.stream.preempt_wait_ms < config.persistence.debounce_ms {
        warnings.push("stream.preempt_wait_ms is shorter than the persistence debounce");
    }
    warnings
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config.redacted())?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", AppConfig::config_path().display());
    Ok(())
}

pub async fn init(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = AppConfig::config_path();
    if path.exists() && !force {
        println!("Config already exists at {} (use --force to overwrite)", path.display());
        return Ok(());
    }
    std::fs::create_dir_all(AppConfig::config_dir())?;
    std::fs::write(&path, AppConfig::default_toml())?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
