//! Local configuration in `~/.diag/diag.toml`
//!
//! File values are overlaid by `DIAG_*` environment variables, e.g.
//! `DIAG_CLINIC__TOKEN` or `DIAG_COLLECT__MIRROR`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "diag.toml";

/// Default service endpoints per region
const ENDPOINT_US: &str = "https://clinic.pingcap.com";
const ENDPOINT_CN: &str = "https://clinic.pingcap.com.cn";

/// Keys accepted by `diag config <key> <value>`
pub const KEYS: [&str; 5] = [
    "clinic.region",
    "clinic.token",
    "clinic.endpoint",
    "clinic.cert",
    "collect.mirror",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Recipient public key or certificate used when packaging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectConfig {
    /// Base URL helper binaries are fetched from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<String>,
}

/// CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub clinic: ClinicConfig,
    #[serde(default)]
    pub collect: CollectConfig,
}

/// `$DIAG_HOME`, or `~/.diag`
pub fn home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("DIAG_HOME") {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    let home = dirs_next::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".diag"))
}

impl Config {
    /// Load the file in `home` (if any) with environment overrides applied
    pub fn load(home: &Path) -> Result<Self> {
        let path = home.join(CONFIG_FILE);
        let settings = config::Config::builder()
            .add_source(config::File::from(path.clone()).required(false))
            .add_source(
                config::Environment::with_prefix("DIAG")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read {}", path.display()))?;
        settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Load only what is stored on disk, without environment overrides
    pub fn load_file(home: &Path) -> Result<Self> {
        let path = home.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub fn save(&self, home: &Path) -> Result<()> {
        std::fs::create_dir_all(home).context("Failed to create config directory")?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(home.join(CONFIG_FILE), content).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a dotted key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        let opt = (!value.is_empty()).then(|| value.to_string());
        match key {
            "clinic.region" => {
                let region = value.to_ascii_uppercase();
                if region != "US" && region != "CN" {
                    bail!("Unknown region '{}', expected US or CN", value);
                }
                self.clinic.region = Some(region);
            }
            "clinic.token" => self.clinic.token = opt,
            "clinic.endpoint" => self.clinic.endpoint = opt,
            "clinic.cert" => self.clinic.cert = opt.map(PathBuf::from),
            "collect.mirror" => self.collect.mirror = opt,
            other => bail!("Unknown config key '{}', expected one of {}", other, KEYS.join(", ")),
        }
        Ok(())
    }

    /// Upload endpoint: explicit setting, else the region default
    pub fn endpoint(&self) -> String {
        if let Some(endpoint) = self.clinic.endpoint.as_deref().filter(|e| !e.is_empty()) {
            return endpoint.to_string();
        }
        match self.clinic.region.as_deref() {
            Some(r) if r.eq_ignore_ascii_case("CN") => ENDPOINT_CN.to_string(),
            _ => ENDPOINT_US.to_string(),
        }
    }

    pub fn token(&self) -> &str {
        self.clinic.token.as_deref().unwrap_or_default()
    }

    /// Copy safe to print
    pub fn masked(&self) -> Self {
        let mut out = self.clone();
        out.clinic.token = out.clinic.token.as_deref().map(mask);
        out
    }
}

/// Keep the first and last four characters of a secret
pub fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 8), tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.set("clinic.region", "cn").unwrap();
        config.set("clinic.token", "abcd1234efgh5678").unwrap();
        config.set("collect.mirror", "https://mirror.example.com").unwrap();
        config.save(dir.path()).unwrap();

        let loaded = Config::load_file(dir.path()).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.endpoint(), ENDPOINT_CN);
        assert_eq!(loaded.token(), "abcd1234efgh5678");
    }

    #[test]
    fn test_unknown_key_and_region_rejected() {
        let mut config = Config::default();
        assert!(config.set("clinic.colour", "x").is_err());
        assert!(config.set("clinic.region", "EU").is_err());
    }

    #[test]
    fn test_explicit_endpoint_wins() {
        let mut config = Config::default();
        assert_eq!(config.endpoint(), ENDPOINT_US);
        config.set("clinic.region", "CN").unwrap();
        config.set("clinic.endpoint", "http://localhost:8080").unwrap();
        assert_eq!(config.endpoint(), "http://localhost:8080");
    }

    #[test]
    fn test_token_is_masked() {
        assert_eq!(mask("abcd1234efgh5678"), "abcd********5678");
        assert_eq!(mask("short"), "*****");

        let mut config = Config::default();
        config.set("clinic.token", "abcd1234efgh5678").unwrap();
        assert_eq!(config.masked().token(), "abcd********5678");
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Config::load_file(dir.path()).unwrap(), Config::default());
    }
}
