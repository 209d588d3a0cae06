pub mod filter;
pub mod mapper;

use crate::error::Result;
use crate::pipeline::message::Message;
use serde::{Deserialize, Serialize};

/// Processor configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ProcessorConfig {
    #[serde(rename = "filter")]
    Filter {
        #[serde(rename = "celExpression")]
        cel_expression: String,
    },
    #[serde(rename = "mapper")]
    Mapper {
        #[serde(rename = "outputFields")]
        output_fields: serde_json::Value,
    },
}

/// A stage of the transform chain.
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    /// Process a message, returning Some(message) if it should continue, None if filtered out
    async fn process(&self, message: Message) -> Result<Option<Message>>;
}

/// Builds the transform chain in configuration order.
pub fn create_processors(configs: &[ProcessorConfig]) -> Result<Vec<Box<dyn Processor>>> {
    let mut processors: Vec<Box<dyn Processor>> = Vec::with_capacity(configs.len());

    for processor_config in configs {
        match processor_config {
            ProcessorConfig::Filter { cel_expression } => {
                processors.push(Box::new(filter::FilterProcessor::new(cel_expression)?));
            }
            ProcessorConfig::Mapper { output_fields } => {
                processors.push(Box::new(mapper::MapperProcessor::new(output_fields.clone())?));
            }
        }
    }

    Ok(processors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_processor_config_parsing() {
        let configs: Vec<ProcessorConfig> = serde_json::from_value(json!([
            {"type": "filter", "celExpression": "level == 'error'"},
            {"type": "mapper", "outputFields": {"text": "{{ message }}"}}
        ]))
        .unwrap();

        let processors = create_processors(&configs).unwrap();
        assert_eq!(processors.len(), 2);
    }

    #[test]
    fn test_invalid_expression_is_a_config_error() {
        let configs = vec![ProcessorConfig::Filter {
            cel_expression: "level ==".to_string(),
        }];

        assert!(matches!(
            create_processors(&configs),
            Err(crate::error::AppError::Config(_))
        ));
    }
}
