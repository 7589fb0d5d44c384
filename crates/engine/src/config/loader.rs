use std::path::{Path, PathBuf};

use promptloop_common::config::SystemConfig;

use super::validation;

/// Load and validate configuration from a TOML file.
///
/// Fails loudly with clear error messages if anything is misconfigured.
pub fn load_config(path: &Path) -> Result<SystemConfig, ConfigError> {
    tracing::info!(path = %path.display(), "Loading configuration");

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config = parse_toml(&content).map_err(|detail| ConfigError::Parse {
        path: path.to_path_buf(),
        detail,
    })?;

    validation::validate(&config)?;

    tracing::info!(
        providers = config.llm.providers.len(),
        "Configuration loaded successfully"
    );

    Ok(config)
}

/// Parse and validate configuration from an in-memory TOML document.
pub fn parse_config(content: &str) -> Result<SystemConfig, ConfigError> {
    let config = parse_toml(content).map_err(|detail| ConfigError::Parse {
        path: PathBuf::from("<inline>"),
        detail,
    })?;

    validation::validate(&config)?;
    Ok(config)
}

fn parse_toml(content: &str) -> Result<SystemConfig, String> {
    toml::from_str(content).map_err(|e| e.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {detail}", .path.display())]
    Parse { path: PathBuf, detail: String },

    #[error("Validation failed: {0}")]
    Validation(String),
}
