use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

/// Key under which non-object payloads are stored.
pub const MESSAGE_FIELD: &str = "message";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A unit of data travelling from a source, through the processors, into a sink.
///
/// Ownership moves with each stage; processors consume a message and hand back
/// either a (possibly rewritten) message or nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub fields: Map<String, Value>,
    /// Destination index overriding the sink default.
    pub index: Option<String>,
}

impl Message {
    pub fn new(fields: Map<String, Value>) -> Self {
        let id = Self::generate_id(&fields);

        Self {
            id,
            fields,
            index: None,
        }
    }

    /// Objects become the message fields, anything else is stored under `message`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self::new(fields),
            other => {
                let mut fields = Map::new();
                fields.insert(MESSAGE_FIELD.to_string(), other);
                Self::new(fields)
            }
        }
    }

    /// Parses a JSON object line, falling back to the raw text.
    pub fn from_line(line: &str) -> Self {
        match serde_json::from_str::<Value>(line) {
            Ok(value @ Value::Object(_)) => Self::from_value(value),
            _ => Self::from_value(Value::String(line.to_string())),
        }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(key.into(), value)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    fn generate_id(fields: &Map<String, Value>) -> String {
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();

        hasher.update(std::process::id().to_be_bytes());
        hasher.update(sequence.to_be_bytes());
        for (key, value) in fields {
            hasher.update(key.as_bytes());
            hasher.update(b":");
            hasher.update(value.to_string().as_bytes());
            hasher.update(b";");
        }

        hex::encode(hasher.finalize())
    }
}
