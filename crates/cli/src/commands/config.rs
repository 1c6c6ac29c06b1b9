//! `config`

use crate::config::{Config, KEYS};
use crate::output::{self, print_success, OutputFormat};
use anyhow::{bail, Context, Result};
use std::path::Path;

/// Show the effective configuration, one key, or set a key
pub fn config(format: OutputFormat, home: &Path, key: Option<&str>, value: Option<&str>) -> Result<()> {
    match (key, value) {
        (None, _) => {
            let masked = Config::load(home)?.masked();
            match format {
                OutputFormat::Json => output::print_json(&masked),
                OutputFormat::Default => {
                    let content = toml::to_string_pretty(&masked).context("Failed to render config")?;
                    if content.trim().is_empty() {
                        println!("# no settings, keys: {}", KEYS.join(", "));
                    } else {
                        print!("{}", content);
                    }
                }
            }
        }
        (Some(key), None) => {
            let masked = Config::load(home)?.masked();
            let value = match key {
                "clinic.region" => masked.clinic.region.clone(),
                "clinic.token" => masked.clinic.token.clone(),
                "clinic.endpoint" => Some(masked.endpoint()),
                "clinic.cert" => masked.clinic.cert.as_ref().map(|p| p.display().to_string()),
                "collect.mirror" => masked.collect.mirror.clone(),
                other => bail!("Unknown config key '{}', expected one of {}", other, KEYS.join(", ")),
            };
            match format {
                OutputFormat::Json => output::print_json(&serde_json::json!({ key: value })),
                OutputFormat::Default => println!("{}", value.unwrap_or_default()),
            }
        }
        (Some(key), Some(value)) => {
            // Only the file is rewritten so environment overrides are never persisted
            let mut config = Config::load_file(home)?;
            config.set(key, value)?;
            config.save(home)?;
            match format {
                OutputFormat::Json => output::print_json(&serde_json::json!({ "updated": key })),
                OutputFormat::Default => print_success(&format!("Updated {}", key)),
            }
        }
    }
    Ok(())
}
