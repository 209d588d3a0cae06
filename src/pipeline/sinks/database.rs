use crate::config::secret::SecretSource;
use crate::error::{AppError, Result};
use crate::pipeline::message::Message;
use super::bulk::{BulkSettings, BulkWriter, FailurePolicy, DEFAULT_FLUSH_INTERVAL, DEFAULT_FLUSH_TIMEOUT};
use super::document::{DestinationIndex, DocumentMapper, TypeStrategy};
use chrono::Utc;
use mongodb::bson::{doc, Document};
use mongodb::error::ErrorKind;
use mongodb::options::ClientOptions;
use mongodb::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 27017;

/// MongoDB bulk sink configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MongoSinkConfig {
    /// Full connection string; takes precedence over `hosts`.
    #[serde(default)]
    pub url: Option<SecretSource>,

    /// `host` or `host:port` entries.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Replica set name.
    #[serde(default)]
    pub cluster_name: Option<String>,

    /// Application name reported to the server.
    #[serde(default)]
    pub node_name: Option<String>,

    /// Extra connection string options.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub default_index: DestinationIndex,

    #[serde(default = "default_document_type")]
    pub document_type: String,

    #[serde(default)]
    pub type_strategy: TypeStrategy,

    #[serde(default)]
    pub known_fields: Option<Vec<String>>,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_database() -> String {
    "logflow".to_string()
}

fn default_document_type() -> String {
    "logflow".to_string()
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL.as_millis() as u64
}

fn default_batch_size() -> usize {
    1000
}

fn default_flush_timeout_ms() -> u64 {
    DEFAULT_FLUSH_TIMEOUT.as_millis() as u64
}

const UNKNOWN_HOST: &str = "unknown host";

/// `logflow-<pid>@<hostname>`
pub fn default_node_name() -> String {
    let host_name = [system_host_name(), std::env::var("HOSTNAME").ok()]
        .into_iter()
        .flatten()
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_HOST.to_string());

    format!("logflow-{}@{}", std::process::id(), host_name)
}

#[cfg(unix)]
fn system_host_name() -> Option<String> {
    match nix::unistd::gethostname() {
        Ok(name) => name.into_string().ok(),
        Err(e) => {
            tracing::warn!("Failed to resolve host name: {}", e);
            None
        }
    }
}

#[cfg(not(unix))]
fn system_host_name() -> Option<String> {
    None
}

/// Normalizes `host[:port]` to `host:port`.
pub fn parse_host(host: &str) -> Result<String> {
    let invalid = || AppError::InvalidHost(host.to_string());
    let trimmed = host.trim();

    if trimmed.is_empty() || trimmed.contains('/') || trimmed.contains(char::is_whitespace) {
        return Err(invalid());
    }

    let (name, port) = match trimmed.strip_prefix('[') {
        // [ipv6]:port
        Some(rest) => {
            let (address, after) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match after {
                "" => None,
                _ => Some(after.strip_prefix(':').ok_or_else(invalid)?),
            };
            if address.is_empty() {
                return Err(invalid());
            }
            (format!("[{}]", address), port)
        }
        None => match trimmed.split_once(':') {
            Some((name, port)) => (name.to_string(), Some(port)),
            None => (trimmed.to_string(), None),
        },
    };

    if name.is_empty() {
        return Err(invalid());
    }

    let port = match port {
        Some(port) => port.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(invalid)?,
        None => DEFAULT_PORT,
    };

    Ok(format!("{}:{}", name, port))
}

impl MongoSinkConfig {
    pub fn bulk_settings(&self) -> Result<BulkSettings> {
        Ok(BulkSettings::new(Duration::from_millis(self.flush_interval_ms), self.batch_size)?
            .with_flush_timeout(Duration::from_millis(self.flush_timeout_ms))?
            .with_failure_policy(self.failure_policy.clone()))
    }

    pub fn connection_string(&self) -> Result<String> {
        let mut base = match &self.url {
            Some(url) => {
                let url = url.resolve()?;
                if !url.starts_with("mongodb://") && !url.starts_with("mongodb+srv://") {
                    return Err(AppError::Config(
                        "Invalid MongoDB URL: must start with mongodb:// or mongodb+srv://".to_string(),
                    ));
                }
                url
            }
            None => {
                let hosts = if self.hosts.is_empty() {
                    vec![format!("localhost:{}", DEFAULT_PORT)]
                } else {
                    self.hosts.iter().map(|h| parse_host(h)).collect::<Result<Vec<_>>>()?
                };
                format!("mongodb://{}/", hosts.join(","))
            }
        };

        let mut options: Vec<(String, String)> = Vec::new();
        if let Some(cluster_name) = &self.cluster_name {
            options.push(("replicaSet".to_string(), cluster_name.clone()));
        }
        options.push((
            "appName".to_string(),
            self.node_name.clone().unwrap_or_else(default_node_name),
        ));
        options.extend(self.settings.iter().map(|(k, v)| (k.clone(), v.clone())));

        for (key, value) in &options {
            if key.is_empty() || [key, value].iter().any(|s| s.contains(['&', '=', '?', '#'])) {
                return Err(AppError::Config(format!("Invalid connection setting: {}={}", key, value)));
            }
        }

        if !base.contains('?') {
            let after_scheme = base.split_once("://").map(|(_, rest)| rest).unwrap_or("");
            if !after_scheme.contains('/') {
                base.push('/');
            }
            base.push('?');
        } else if !base.ends_with('?') && !base.ends_with('&') {
            base.push('&');
        }

        let query = options
            .iter()
            .map(|(k, v)| format!("{}={}", k, v.replace(' ', "%20")))
            .collect::<Vec<_>>()
            .join("&");

        Ok(base + &query)
    }
}

/// Writes batches into MongoDB collections, one collection per index.
pub struct MongoBulkWriter {
    client: Client,
    database: String,
    mapper: DocumentMapper,
}

impl MongoBulkWriter {
    /// Connects and pings the server; fails if it cannot be reached.
    pub async fn connect(config: &MongoSinkConfig) -> Result<Self> {
        let uri = config.connection_string()?;

        let options = ClientOptions::parse(uri.as_str())
            .await
            .map_err(|e| AppError::Config(format!("Invalid MongoDB connection options: {}", e)))?;

        let client = Client::with_options(options)
            .map_err(|e| AppError::Connection(format!("Failed to create MongoDB client: {}", e)))?;

        client
            .database(&config.database)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| AppError::Connection(format!("Failed to connect to MongoDB: {}", e)))?;

        tracing::info!(
            "Connected to MongoDB database {} with type strategy {:?} and known fields {:?}",
            config.database,
            config.type_strategy,
            config.known_fields.as_deref().unwrap_or_default()
        );

        Ok(Self {
            client,
            database: config.database.clone(),
            mapper: DocumentMapper::new(
                config.default_index.clone(),
                config.document_type.clone(),
                config.known_fields.clone(),
                config.type_strategy,
            ),
        })
    }
}

/// Write error code for a document whose `_id` is already stored.
const DUPLICATE_KEY: i32 = 11000;

/// Positions of an unordered insert the store did not keep. A duplicate key
/// means an earlier attempt already stored that document.
fn rejected_positions(write_errors: impl IntoIterator<Item = (usize, i32)>) -> HashSet<usize> {
    write_errors
        .into_iter()
        .filter(|(_, code)| *code != DUPLICATE_KEY)
        .map(|(index, _)| index)
        .collect()
}

#[async_trait::async_trait]
impl BulkWriter for MongoBulkWriter {
    async fn bulk_write(&self, batch: &[Message]) -> Result<()> {
        let now = Utc::now();

        let mut by_collection: BTreeMap<String, (Vec<String>, Vec<Document>)> = BTreeMap::new();
        for message in batch {
            let (ids, documents) = by_collection
                .entry(self.mapper.index_for(message, now))
                .or_default();
            documents.push(self.mapper.to_document(message)?);
            ids.push(message.id.clone());
        }

        let database = self.client.database(&self.database);
        let mut delivered = Vec::with_capacity(batch.len());
        let mut failures = Vec::new();

        for (collection, (ids, documents)) in by_collection {
            let count = documents.len();
            let outcome = database
                .collection::<Document>(&collection)
                .insert_many(documents)
                .ordered(false)
                .await;

            let e = match outcome {
                Ok(_) => {
                    tracing::debug!("Inserted {} documents into {}", count, collection);
                    delivered.extend(ids);
                    continue;
                }
                Err(e) => e,
            };

            // Without per-document results nothing in this collection counts as stored.
            let rejected = match e.kind.as_ref() {
                ErrorKind::InsertMany(failure) if failure.write_concern_error.is_none() => Some(rejected_positions(
                    failure.write_errors.iter().flatten().map(|w| (w.index, w.code)),
                )),
                _ => None,
            };

            match rejected {
                Some(rejected) if rejected.is_empty() => {
                    tracing::debug!("{} documents for {} were already stored", count, collection);
                    delivered.extend(ids);
                }
                Some(rejected) => {
                    delivered.extend(
                        ids.into_iter()
                            .enumerate()
                            .filter(|(position, _)| !rejected.contains(position))
                            .map(|(_, id)| id),
                    );
                    failures.push(format!("{} of {} documents rejected by {}: {}", rejected.len(), count, collection, e));
                }
                None => failures.push(format!("Bulk insert into {} failed: {}", collection, e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else if delivered.is_empty() {
            Err(AppError::Database(failures.join("; ")))
        } else {
            Err(AppError::PartialWrite {
                delivered,
                cause: failures.join("; "),
            })
        }
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}
