pub mod secret;

use serde::{Deserialize, Serialize};
use crate::error::{AppError, Result};
use crate::pipeline::processors::ProcessorConfig;
use crate::pipeline::sinks::SinkConfig;
use crate::sources::SourceConfig;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
    pub sink: SinkConfig,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_shutdown_grace_period_ms")]
    pub shutdown_grace_period_ms: u64,
}

fn default_parallelism() -> usize {
    1
}

fn default_shutdown_grace_period_ms() -> u64 {
    5000
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read configuration {}: {}", path, e)))?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let config_path = std::env::var("CONFIGURATION_PATH")
            .unwrap_or_else(|_| "config/config.json".to_string());
        Self::from_file(&config_path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(AppError::Config("parallelism must be at least 1".to_string()));
        }
        if self.shutdown_grace_period_ms == 0 {
            return Err(AppError::Config("shutdownGracePeriodMs must be positive".to_string()));
        }
        if let SourceConfig::Webhook(webhook) = &self.source {
            webhook.validate()?;
        }
        if let SinkConfig::Mongo(mongo) = &self.sink {
            mongo.bulk_settings()?;
        }
        Ok(())
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn get_port() -> u16 {
        std::env::var("HTTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3000)
    }
}
