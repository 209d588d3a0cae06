use crate::error::{AppError, Result};
use crate::pipeline::message::Message;
use chrono::{DateTime, Utc};
use mongodb::bson::{self, Bson, Document};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const DEFAULT_INDEX_PREFIX: &str = "logflow";

/// Handling of fields that are not in the configured known-field list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeStrategy {
    #[default]
    Accept,
    Drop,
}

/// Where messages without an index of their own are stored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationIndex {
    Fixed(String),
    /// One index per UTC day: `prefix-YYYY.MM.DD`.
    Daily(String),
}

impl Default for DestinationIndex {
    fn default() -> Self {
        DestinationIndex::Daily(DEFAULT_INDEX_PREFIX.to_string())
    }
}

impl DestinationIndex {
    pub fn name_at(&self, at: DateTime<Utc>) -> String {
        match self {
            DestinationIndex::Fixed(name) => name.clone(),
            DestinationIndex::Daily(prefix) => format!("{}-{}", prefix, at.format("%Y.%m.%d")),
        }
    }
}

/// Turns messages into store documents.
#[derive(Debug, Clone)]
pub struct DocumentMapper {
    default_index: DestinationIndex,
    document_type: String,
    known_fields: Option<HashSet<String>>,
    type_strategy: TypeStrategy,
}

impl DocumentMapper {
    pub fn new(
        default_index: DestinationIndex,
        document_type: impl Into<String>,
        known_fields: Option<Vec<String>>,
        type_strategy: TypeStrategy,
    ) -> Self {
        Self {
            default_index,
            document_type: document_type.into(),
            known_fields: known_fields.map(|fields| fields.into_iter().collect()),
            type_strategy,
        }
    }

    pub fn index_for(&self, message: &Message, at: DateTime<Utc>) -> String {
        message
            .index
            .clone()
            .unwrap_or_else(|| self.default_index.name_at(at))
    }

    pub fn to_document(&self, message: &Message) -> Result<Document> {
        let mut document = Document::new();

        for (key, value) in &message.fields {
            if !self.keeps(key) {
                continue;
            }
            let converted = bson::to_bson(value)
                .map_err(|e| AppError::Processing(format!("Failed to convert field {} to BSON: {}", key, e)))?;
            document.insert(key.clone(), converted);
        }

        document.insert("_id", Bson::String(message.id.clone()));
        document.insert("_type", Bson::String(self.document_type.clone()));

        Ok(document)
    }

    fn keeps(&self, key: &str) -> bool {
        match (&self.known_fields, self.type_strategy) {
            (_, TypeStrategy::Accept) | (None, _) => true,
            (Some(known), TypeStrategy::Drop) => known.contains(key),
        }
    }
}
