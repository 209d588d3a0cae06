use crate::error::{AppError, Result};
use crate::pipeline::message::Message;
use super::Processor;
use handlebars::Handlebars;
use serde_json::{Map, Value};

/// Mapper processor that rewrites message fields using Handlebars templates
pub struct MapperProcessor {
    handlebars: Handlebars<'static>,
    template: Map<String, Value>,
}

impl MapperProcessor {
    pub fn new(template: Value) -> Result<Self> {
        let template = match template {
            Value::Object(map) => map,
            other => {
                return Err(AppError::Config(format!(
                    "Mapper output fields must be a JSON object, got: {}",
                    other
                )))
            }
        };

        Ok(Self {
            handlebars: Handlebars::new(),
            template,
        })
    }

    /// Recursively render a template value
    fn render_value(&self, value: &Value, context: &Value) -> Result<Value> {
        match value {
            Value::String(s) => {
                let trimmed = s.trim();

                // A lone "{{ path }}" keeps the JSON type of whatever it points at
                if trimmed.starts_with("{{")
                    && trimmed.ends_with("}}")
                    && trimmed.matches("{{").count() == 1
                {
                    let inner = trimmed[2..trimmed.len() - 2].trim();

                    if inner == "@this" {
                        return Ok(context.clone());
                    }

                    if let Some(raw_value) = extract_value_from_path(inner, context) {
                        return Ok(raw_value.clone());
                    }
                }

                let rendered = self.handlebars.render_template(s, context)
                    .map_err(|e| AppError::Processing(format!("Template rendering failed: {}", e)))?;

                Ok(Value::String(rendered))
            }
            Value::Object(map) => {
                if let (Some(value_template), Some(cast_to)) = (map.get("value"), map.get("castTo")) {
                    let cast_to = cast_to.as_str()
                        .ok_or_else(|| AppError::Processing("castTo must be a string".to_string()))?;

                    let rendered_value = self.render_value(value_template, context)?;
                    return cast_value(&rendered_value, cast_to);
                }

                let mut result = Map::new();
                for (key, val) in map {
                    result.insert(key.clone(), self.render_value(val, context)?);
                }
                Ok(Value::Object(result))
            }
            Value::Array(arr) => arr
                .iter()
                .map(|val| self.render_value(val, context))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            _ => Ok(value.clone()),
        }
    }
}

/// Extract a value from a path like "foo.bar.0.baz"
fn extract_value_from_path<'a>(path: &str, context: &'a Value) -> Option<&'a Value> {
    let mut current = context;

    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(arr) => arr.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

fn cast_value(value: &Value, cast_to: &str) -> Result<Value> {
    match cast_to.to_lowercase().as_str() {
        "string" => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            Value::Null => Ok(Value::String(String::new())),
            _ => Err(AppError::Processing(
                format!("Cannot cast complex type to string: {:?}", value)
            )),
        },
        "number" => match value {
            Value::Number(n) => Ok(Value::Number(n.clone())),
            Value::String(s) => {
                if let Ok(i) = s.parse::<i64>() {
                    Ok(serde_json::json!(i))
                } else if let Ok(f) = s.parse::<f64>() {
                    Ok(serde_json::json!(f))
                } else {
                    Err(AppError::Processing(format!("Cannot parse '{}' as number", s)))
                }
            }
            Value::Bool(b) => Ok(serde_json::json!(if *b { 1 } else { 0 })),
            _ => Err(AppError::Processing(
                format!("Cannot cast type to number: {:?}", value)
            )),
        },
        _ => Err(AppError::Processing(format!(
            "Unsupported cast type: '{}'. Supported types are: string, number",
            cast_to
        ))),
    }
}

#[async_trait::async_trait]
impl Processor for MapperProcessor {
    async fn process(&self, mut message: Message) -> Result<Option<Message>> {
        let context = message.to_value();

        let mut fields = Map::with_capacity(self.template.len());
        for (key, template) in &self.template {
            fields.insert(key.clone(), self.render_value(template, &context)?);
        }
        message.fields = fields;

        Ok(Some(message))
    }
}
