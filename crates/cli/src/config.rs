//! Configuration management for the CLI

use crate::output::OutputFormat;
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_API_URL: &str = "http://localhost:8080";

/// CLI configuration, read from `~/.config/fgctl/config.json`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Agent API endpoint URL
    pub api_url: Option<String>,
    /// Default model directory for train/score
    pub model_dir: Option<PathBuf>,
    /// Default output format
    pub default_format: Option<String>,
}

impl Config {
    /// Load configuration from the default location; missing file means defaults
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        serde_json::from_str(&content).context("Failed to parse config file")
    }

    /// API URL from the flag/env, then the file, then the default
    pub fn api_url(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    pub fn format(&self, flag: Option<OutputFormat>) -> Result<OutputFormat> {
        if let Some(format) = flag {
            return Ok(format);
        }
        match &self.default_format {
            Some(name) => OutputFormat::from_str(name, true)
                .map_err(|e| anyhow::anyhow!("Invalid default_format in config: {}", e)),
            None => Ok(OutputFormat::default()),
        }
    }

    pub fn model_dir(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.model_dir.clone())
            .unwrap_or_else(|| PathBuf::from("./etc/models"))
    }

    /// Get the configuration file path
    fn config_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".config").join("fgctl").join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();

        assert_eq!(config.api_url(None), DEFAULT_API_URL);
        assert_eq!(config.format(None).unwrap(), OutputFormat::Table);
    }

    #[test]
    fn test_flag_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"api_url": "http://guard:9000", "default_format": "json", "model_dir": "/srv/models"}"#,
        )
        .unwrap();
        let config = Config::load_from(&path).unwrap();

        assert_eq!(config.api_url(None), "http://guard:9000");
        assert_eq!(config.api_url(Some("http://other".into())), "http://other");
        assert_eq!(config.format(None).unwrap(), OutputFormat::Json);
        assert_eq!(config.format(Some(OutputFormat::Table)).unwrap(), OutputFormat::Table);
        assert_eq!(config.model_dir(None), PathBuf::from("/srv/models"));
    }

    #[test]
    fn test_invalid_format_rejected() {
        let config = Config {
            default_format: Some("yaml".into()),
            ..Default::default()
        };
        assert!(config.format(None).is_err());
    }
}
