use serde::{Deserialize, Serialize};
use crate::error::{AppError, Result};

/// A credential given inline, through an environment variable, or in a file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SecretSource {
    Plain(String),
    FromEnv {
        #[serde(rename = "fromEnv")]
        from_env: String,
    },
    FromFile {
        #[serde(rename = "fromFile")]
        from_file: String,
    },
}

impl SecretSource {
    pub fn resolve(&self) -> Result<String> {
        let value = match self {
            SecretSource::Plain(value) => value.clone(),
            SecretSource::FromEnv { from_env } => std::env::var(from_env)
                .map_err(|_| AppError::SecretNotFound(format!("environment variable {}", from_env)))?,
            SecretSource::FromFile { from_file } => std::fs::read_to_string(from_file)
                .map(|s| s.trim().to_string())
                .map_err(|_| AppError::SecretNotFound(format!("file {}", from_file)))?,
        };

        if value.is_empty() {
            return Err(AppError::SecretNotFound(self.describe()));
        }

        Ok(value)
    }

    /// Where the secret comes from, without its value.
    pub fn describe(&self) -> String {
        match self {
            SecretSource::Plain(_) => "inline value".to_string(),
            SecretSource::FromEnv { from_env } => format!("environment variable {}", from_env),
            SecretSource::FromFile { from_file } => format!("file {}", from_file),
        }
    }
}
