use super::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&contents).with_context(|| format!("Invalid config file: {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("Failed to parse config")?;

    // Perform environment variable substitution
    let config = substitute_env_vars(config)?;

    validate_config(&config)?;

    Ok(config)
}

/// Resolve a whole-value `${VAR}` reference. Other strings pass through.
fn resolve_env(value: &str) -> Result<String> {
    match value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        Some(var_name) => std::env::var(var_name)
            .with_context(|| format!("Environment variable {} is not set", var_name)),
        None => Ok(value.to_string()),
    }
}

fn substitute_env_vars(mut config: Config) -> Result<Config> {
    config.storage.path = resolve_env(&config.storage.path)?;
    config.gateway.host = resolve_env(&config.gateway.host)?;

    if let Some(path) = &config.pricing.path {
        config.pricing.path = Some(resolve_env(path)?);
    }

    Ok(config)
}

fn validate_config(config: &Config) -> Result<()> {
    if config.gateway.port == 0 {
        anyhow::bail!("gateway.port must be non-zero");
    }

    if config.storage.path.trim().is_empty() {
        anyhow::bail!("storage.path must be specified");
    }

    if !LOG_FORMATS.contains(&config.logging.format.as_str()) {
        anyhow::bail!(
            "Invalid logging format: {} (expected one of {})",
            config.logging.format,
            LOG_FORMATS.join(", ")
        );
    }

    let cache = &config.cache;
    if cache.response_ttl_secs == 0 || cache.report_ttl_secs == 0 || cache.token_ttl_secs == 0 {
        anyhow::bail!("cache TTLs must be positive");
    }
    if cache.max_entries == 0 {
        anyhow::bail!("cache.max_entries must be positive");
    }

    if config.webhooks.timeout_secs == 0 {
        anyhow::bail!("webhooks.timeout_secs must be positive");
    }

    Ok(())
}
