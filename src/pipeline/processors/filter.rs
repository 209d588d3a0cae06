use crate::error::{AppError, Result};
use crate::pipeline::message::Message;
use super::Processor;
use cel_interpreter::{Context, Program};
use serde_json::Value;

/// Filter processor that evaluates CEL expressions
pub struct FilterProcessor {
    program: Program,
}

impl FilterProcessor {
    pub fn new(cel_expression: &str) -> Result<Self> {
        let program = Program::compile(cel_expression)
            .map_err(|e| AppError::Config(format!("Failed to compile CEL expression: {}", e)))?;

        Ok(Self { program })
    }

    /// Exposes `fields`, `index` and every top-level field by name. A field
    /// named like one of the two shadows it.
    fn context_for(message: &Message) -> Result<Context<'static>> {
        let mut context = Context::default();
        let mut bind = |name: &str, value: Value| {
            context
                .add_variable(name, value)
                .map_err(|e| AppError::Processing(format!("Failed to bind `{}` in filter context: {}", name, e)))
        };

        bind("fields", message.to_value())?;
        bind("index", Value::String(message.index.clone().unwrap_or_default()))?;
        for (key, value) in &message.fields {
            bind(key, value.clone())?;
        }

        Ok(context)
    }
}

#[async_trait::async_trait]
impl Processor for FilterProcessor {
    async fn process(&self, message: Message) -> Result<Option<Message>> {
        let context = Self::context_for(&message)?;

        let result = self.program.execute(&context)
            .map_err(|e| AppError::Processing(format!("Failed to evaluate CEL expression: {}", e)))?;

        match &result {
            cel_interpreter::Value::Bool(true) => Ok(Some(message)),
            cel_interpreter::Value::Bool(false) => Ok(None),
            _ => Err(AppError::Processing(
                format!("CEL expression did not evaluate to boolean, got: {:?}", result)
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_filter_passes() {
        let filter = FilterProcessor::new("level == 'error'").unwrap();
        let message = Message::from_value(json!({"level": "error", "text": "boom"}));

        let result = filter.process(message).await.unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn test_filter_blocks() {
        let filter = FilterProcessor::new("level == 'error'").unwrap();
        let message = Message::from_value(json!({"level": "debug"}));

        let result = filter.process(message).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_filter_on_index() {
        let filter = FilterProcessor::new("index == 'audit'").unwrap();
        let message = Message::from_value(json!({"level": "info"})).with_index("audit");

        assert!(filter.process(message).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_non_boolean_result_is_an_error() {
        let filter = FilterProcessor::new("level").unwrap();
        let message = Message::from_value(json!({"level": "info"}));

        assert!(filter.process(message).await.is_err());
    }
}
