//! MongoClient and its configuration.

use crate::concern::{Acknowledgment, ReadConcern, ReadConcernLevel, WriteConcern};
use crate::connection::Binding;
use crate::db::Database;
use crate::error::{MongoError, Result};
use crate::operation::CommandOperation;
use crate::session::ClientSession;
use bson::doc;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Options for a client.
///
/// Options can be built in code, parsed from the query string of a
/// connection string, or deserialized from a JSON configuration file using
/// the connection-string key names.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientOptions {
    /// Retry writes once after a transient failure.
    pub retry_writes: bool,
    /// Retry reads once after a transient failure.
    pub retry_reads: bool,
    /// Read concern level for reads that do not set their own.
    pub read_concern_level: Option<ReadConcernLevel>,
    /// Requested acknowledgement of writes.
    pub w: Option<Acknowledgment>,
    /// Whether writes wait for the journal commit.
    pub journal: Option<bool>,
    /// How long writes wait for acknowledgement, in milliseconds.
    #[serde(rename = "wtimeoutMS")]
    pub wtimeout_ms: Option<u64>,
    /// Application name for server logs.
    pub app_name: Option<String>,
    /// Default `maxTimeMS` of get-mores on await-data cursors.
    #[serde(rename = "maxAwaitTimeMS")]
    pub max_await_time_ms: Option<u64>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retry_writes: true,
            retry_reads: true,
            read_concern_level: None,
            w: None,
            journal: None,
            wtimeout_ms: None,
            app_name: None,
            max_await_time_ms: None,
        }
    }
}

impl ClientOptions {
    /// Create a new ClientOptions with defaults.
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::default()
    }

    /// Parse options from a connection string.
    ///
    /// Unknown keys are ignored. A known key with a malformed value is an
    /// error.
    pub fn parse(uri: &str) -> Result<Self> {
        let mut options = ClientOptions::default();

        let Some((_, query)) = uri.split_once('?') else {
            return Ok(options);
        };
        for param in query.split('&').filter(|p| !p.is_empty()) {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key {
                "retryWrites" => options.retry_writes = parse_value(key, value)?,
                "retryReads" => options.retry_reads = parse_value(key, value)?,
                "readConcernLevel" => {
                    options.read_concern_level = Some(ReadConcernLevel::parse(value)?);
                }
                "w" => options.w = Some(Acknowledgment::from(value)),
                "journal" => options.journal = Some(parse_value(key, value)?),
                "wtimeoutMS" => options.wtimeout_ms = Some(parse_value(key, value)?),
                "appName" => options.app_name = Some(value.to_string()),
                "maxAwaitTimeMS" => options.max_await_time_ms = Some(parse_value(key, value)?),
                _ => {}
            }
        }

        Ok(options)
    }

    /// Deserialize options from a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The read concern reads use unless they set their own.
    pub fn read_concern(&self) -> ReadConcern {
        ReadConcern {
            level: self.read_concern_level,
        }
    }

    /// The write concern writes use unless they set their own.
    pub fn write_concern(&self) -> WriteConcern {
        WriteConcern {
            w: self.w.clone(),
            journal: self.journal,
            w_timeout_ms: self.wtimeout_ms,
        }
    }

    /// Default await time of tailable await-data cursors.
    pub fn max_await_time(&self) -> Option<Duration> {
        self.max_await_time_ms.map(Duration::from_millis)
    }
}

fn parse_value<V: FromStr>(key: &str, value: &str) -> Result<V> {
    value
        .parse()
        .map_err(|_| MongoError::invalid_argument(format!("invalid value for {key}: {value}")))
}

/// Builder for ClientOptions.
#[derive(Debug, Clone, Default)]
pub struct ClientOptionsBuilder {
    options: ClientOptions,
}

impl ClientOptionsBuilder {
    /// Enable or disable retryable writes.
    pub fn retry_writes(mut self, retry: bool) -> Self {
        self.options.retry_writes = retry;
        self
    }

    /// Enable or disable retryable reads.
    pub fn retry_reads(mut self, retry: bool) -> Self {
        self.options.retry_reads = retry;
        self
    }

    /// Set the default read concern level.
    pub fn read_concern_level(mut self, level: ReadConcernLevel) -> Self {
        self.options.read_concern_level = Some(level);
        self
    }

    /// Set the default write acknowledgement.
    pub fn w(mut self, w: impl Into<Acknowledgment>) -> Self {
        self.options.w = Some(w.into());
        self
    }

    /// Wait for the journal commit on writes.
    pub fn journal(mut self, journal: bool) -> Self {
        self.options.journal = Some(journal);
        self
    }

    /// Set the write acknowledgement timeout.
    pub fn wtimeout_ms(mut self, timeout: u64) -> Self {
        self.options.wtimeout_ms = Some(timeout);
        self
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.options.app_name = Some(name.into());
        self
    }

    /// Set the default await time of await-data cursors.
    pub fn max_await_time_ms(mut self, millis: u64) -> Self {
        self.options.max_await_time_ms = Some(millis);
        self
    }

    /// Build the options.
    pub fn build(self) -> ClientOptions {
        self.options
    }
}

struct ClientInner {
    binding: Arc<dyn Binding>,
    options: ClientOptions,
}

/// A MongoDB client.
///
/// The client runs every operation through a [`Binding`], which selects a
/// server and hands out connections. Cloning is cheap and shares the
/// binding.
///
/// # Example
///
/// ```ignore
/// use mongo_do_ops::{MongoClient, ClientOptions, memory::MemoryDeployment};
///
/// let deployment = MemoryDeployment::new();
/// let client = MongoClient::with_binding(Arc::new(deployment), ClientOptions::default());
/// let users = client.database("mydb").collection_with_doc("users");
/// users.insert_one(doc! { "name": "John" }).await?;
/// ```
#[derive(Clone)]
pub struct MongoClient {
    inner: Arc<ClientInner>,
}

impl MongoClient {
    /// Create a client that runs its operations through `binding`.
    pub fn with_binding(binding: Arc<dyn Binding>, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner { binding, options }),
        }
    }

    /// Get a database handle.
    pub fn database(&self, name: &str) -> Database {
        Database::new(name.to_string(), self.clone())
    }

    /// Get the client options.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// The binding operations run through.
    pub fn binding(&self) -> &dyn Binding {
        self.inner.binding.as_ref()
    }

    /// Start a client session.
    ///
    /// Causally consistent sessions send the latest operation time they have
    /// seen with every read.
    pub fn start_session(&self, causally_consistent: bool) -> ClientSession {
        ClientSession::new(causally_consistent)
    }

    /// Ping the server to check connectivity.
    pub async fn ping(&self) -> Result<()> {
        CommandOperation::new("admin", doc! { "ping": 1 })
            .execute(self.binding(), None)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for MongoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoClient")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

/// Alias for MongoClient for compatibility.
pub type Client = MongoClient;
