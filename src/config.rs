// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout for the configuration file that Oxherd uses to simplify
//! the process of serialization and deserialization. File I/O is left to the
//! caller to figure out.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::PathBuf,
    str::FromStr,
};

/// Tool configuration layout.
///
/// Everything is optional: a missing configuration file behaves exactly like
/// an empty one. The configuration only tunes where the tool looks for
/// things, never what it does with them.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ToolConfig {
    /// Override for the per-user cache root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// Override for the artifact store root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,

    /// Settings for the external evaluator.
    #[serde(default)]
    pub evaluator: EvaluatorSettings,
}

/// Settings for the external evaluator.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct EvaluatorSettings {
    /// Extra options passed through to every evaluator invocation.
    #[serde(default)]
    pub options: Vec<String>,
}

impl ToolConfig {
    /// Load the configuration from its default location.
    ///
    /// Reads `$XDG_CONFIG_HOME/oxherd/config.toml` when it exists, otherwise
    /// falls back to the default configuration.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if the file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if its contents are malformed.
    pub fn load_default() -> Result<Self> {
        let Some(path) = dirs::config_dir().map(|dir| dir.join("oxherd").join("config.toml"))
        else {
            return Ok(Self::default());
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        std::fs::read_to_string(&path)
            .map_err(|err| ConfigError::Read {
                source: err,
                path: path.clone(),
            })?
            .parse()
    }
}

impl FromStr for ToolConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: ToolConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on path override fields.
        config.cache_dir = expand_path(config.cache_dir)?;
        config.store_dir = expand_path(config.store_dir)?;

        Ok(config)
    }
}

impl Display for ToolConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand_path(path: Option<PathBuf>) -> Result<Option<PathBuf>> {
    match path {
        Some(path) => {
            let expanded = shellexpand::full(path.to_string_lossy().as_ref())
                .map_err(ConfigError::ShellExpansion)?
                .into_owned();
            Ok(Some(PathBuf::from(expanded)))
        }
        None => Ok(None),
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration at {path:?}")]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
