//! # mongo-do-ops
//!
//! The operation execution core of the mongo-do SDK.
//!
//! This crate turns MongoDB commands into results: it runs operations
//! against a pluggable connection layer, retries them once after transient
//! failures, and iterates query results through batch cursors that release
//! their server-side and client-side resources exactly once.
//!
//! ## Features
//!
//! - Blocking ([`BatchCursor`]) and async ([`AsyncBatchCursor`]) batch
//!   cursors sharing one state machine, plus a document-at-a-time [`Cursor`]
//! - Limit and batch-size handling, tailable and await-data cursors
//! - Retryable reads and writes with transaction numbers
//! - Ordered and unordered bulk writes
//! - An in-process deployment ([`memory::MemoryDeployment`]) with fail
//!   points, for tests
//!
//! ## Quick Start
//!
//! ```ignore
//! use mongo_do_ops::{ClientOptions, MongoClient, bson::doc, memory::MemoryDeployment};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> mongo_do_ops::Result<()> {
//!     let deployment = MemoryDeployment::new();
//!     let client = MongoClient::with_binding(Arc::new(deployment), ClientOptions::default());
//!
//!     let users = client.database("mydb").collection_with_doc("users");
//!     users.insert_one(doc! { "name": "John" }).await?;
//!
//!     let cursor = users.find(doc! { "name": "John" }).await?;
//!     let results = cursor.collect().await?;
//!     assert_eq!(results.len(), 1);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod collection;
pub(crate) mod command;
pub mod concern;
pub mod connection;
pub mod cursor;
pub mod db;
pub mod error;
pub mod memory;
pub mod operation;
pub(crate) mod retry;
pub(crate) mod runtime;
pub mod session;

// Re-export main types
pub use client::{Client, ClientOptions, ClientOptionsBuilder, MongoClient};
pub use collection::{
    Collection, DeleteResult, FindOptions, FindOptionsBuilder, InsertManyResult, InsertOneResult,
    UpdateOptions, UpdateOptionsBuilder, UpdateResult,
};
pub use concern::{Acknowledgment, ReadConcern, ReadConcernLevel, WriteConcern};
pub use connection::{Binding, Connection, ConnectionDescription, ConnectionSource, ServerAddress, ServerType};
pub use cursor::{AsyncBatchCursor, BatchCursor, Cursor, CursorSettings, InterruptHandle, Namespace, ServerCursor};
pub use db::{CreateCollectionOptions, CreateCollectionOptionsBuilder, Database};
pub use error::{ErrorKind, FailureStage, MongoError, Result};
pub use operation::{BulkWriteResult, CursorType, WriteConcernError, WriteRequest};
pub use session::ClientSession;

// Re-export bson for convenience
pub use bson;
pub use bson::doc;

/// Prelude module for common imports.
pub mod prelude {
    pub use super::client::{Client, ClientOptions, MongoClient};
    pub use super::collection::{
        Collection, DeleteResult, FindOptions, InsertManyResult, InsertOneResult, UpdateOptions,
        UpdateResult,
    };
    pub use super::cursor::{AsyncBatchCursor, BatchCursor, Cursor};
    pub use super::db::Database;
    pub use super::error::{ErrorKind, MongoError, Result};
    pub use super::operation::{CursorType, WriteRequest};
    pub use bson::{doc, Document};
    pub use serde::{Deserialize, Serialize};
}

/// Get the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
