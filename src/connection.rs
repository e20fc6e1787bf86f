//! Interfaces to the connection layer.
//!
//! Server selection, pooling, authentication and the wire codec live behind
//! these traits. The execution core only ever asks a [`Binding`] for a
//! [`ConnectionSource`] (a lease on a selected server), asks that source for
//! a [`Connection`] and sends command documents over it.
//!
//! Leases are `Arc` handles: acquiring one is cloning or creating an `Arc`,
//! releasing it is dropping the handle.

use crate::error::Result;
use async_trait::async_trait;
use bson::Document;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Host and port of a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    /// Host name.
    pub host: String,
    /// Port.
    pub port: u16,
}

impl ServerAddress {
    /// Create a new server address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new("localhost", 27017)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The role a server plays in its deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerType {
    /// A single server that is not part of a replica set.
    Standalone,
    /// The primary of a replica set.
    ReplicaSetPrimary,
    /// A sharded cluster router.
    Mongos,
    /// A server behind a load balancer.
    LoadBalancer,
}

/// What the connection layer learned about a server during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescription {
    /// The server's address.
    pub address: ServerAddress,
    /// The server's role.
    pub server_type: ServerType,
    /// The highest wire protocol version the server speaks.
    pub max_wire_version: i32,
    /// Largest document the server accepts, in bytes.
    pub max_document_size: usize,
    /// Largest wire message the server accepts, in bytes.
    pub max_message_size: usize,
    /// Largest number of write requests per write command.
    pub max_write_batch_size: usize,
}

impl ConnectionDescription {
    /// Wire version of the first server release that supports retryable
    /// writes.
    pub const RETRYABLE_WRITES_WIRE_VERSION: i32 = 6;

    /// Create a description with the server defaults.
    pub fn new(address: ServerAddress, server_type: ServerType) -> Self {
        Self {
            address,
            server_type,
            max_wire_version: 17,
            max_document_size: 16 * 1024 * 1024,
            max_message_size: 48_000_000,
            max_write_batch_size: 100_000,
        }
    }

    /// Whether the server can deduplicate writes by transaction number.
    pub fn supports_retryable_writes(&self) -> bool {
        self.server_type != ServerType::Standalone
            && self.max_wire_version >= Self::RETRYABLE_WRITES_WIRE_VERSION
    }
}

/// A checked-out connection to one server.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Description of the server this connection is established to.
    fn description(&self) -> &ConnectionDescription;

    /// Send a command to `database` and wait for the reply.
    ///
    /// Replies with `ok: 0` are returned as documents; only transport
    /// failures are errors.
    async fn command(&self, database: &str, command: Document) -> Result<Document>;
}

/// A lease on a selected server, from which connections can be checked out.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Description of the selected server.
    fn server_description(&self) -> &ConnectionDescription;

    /// Check out a connection to the selected server.
    async fn connection(&self) -> Result<Arc<dyn Connection>>;
}

/// Selects servers for operations.
#[async_trait]
pub trait Binding: Send + Sync {
    /// Select a server and lease it.
    async fn connection_source(&self) -> Result<Arc<dyn ConnectionSource>>;
}
