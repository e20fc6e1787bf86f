//! The `listCollections` command.

use super::{execute_retryable_read, RetryableOperation};
use crate::command::{execute_command, CommandDocument};
use crate::connection::{Binding, Connection, ConnectionSource};
use crate::cursor::{AsyncBatchCursor, BatchCursor, CursorCore, CursorSettings, Namespace};
use crate::error::Result;
use crate::runtime;
use crate::session::ClientSession;
use async_trait::async_trait;
use bson::{Bson, Document};
use std::sync::Arc;

/// Lists the collections of a database as `{name, type, options, ...}`
/// documents.
#[derive(Debug, Clone)]
pub struct ListCollectionsOperation {
    database: String,
    filter: Option<Document>,
    name_only: bool,
    batch_size: i32,
    comment: Option<Bson>,
    retry_reads: bool,
}

impl ListCollectionsOperation {
    /// List the collections of `database`.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            filter: None,
            name_only: false,
            batch_size: 0,
            comment: None,
            retry_reads: true,
        }
    }

    /// Only list collections matching `filter`.
    pub fn filter(mut self, filter: Document) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Ask only for names and types.
    pub fn name_only(mut self, name_only: bool) -> Self {
        self.name_only = name_only;
        self
    }

    /// Set the batch size.
    pub fn batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the comment.
    pub fn comment(mut self, comment: impl Into<Bson>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Enable or disable retrying once on a transient error.
    pub fn retry_reads(mut self, retry_reads: bool) -> Self {
        self.retry_reads = retry_reads;
        self
    }

    /// The `listCollections` command this operation sends.
    pub fn command(&self) -> Document {
        let mut cursor = Document::new();
        if self.batch_size != 0 {
            cursor.insert("batchSize", self.batch_size.saturating_abs());
        }
        CommandDocument::new("listCollections", 1)
            .put_if_not_empty("filter", self.filter.as_ref())
            .put_if_true("nameOnly", self.name_only)
            .put("cursor", cursor)
            .put_if_some("comment", self.comment.clone())
            .into_document()
    }

    /// Run the command and return a cursor over the collection documents.
    pub async fn execute(
        &self,
        binding: &dyn Binding,
        session: Option<&ClientSession>,
    ) -> Result<AsyncBatchCursor<Document>> {
        let core = execute_retryable_read(self, binding, session, self.retry_reads).await?;
        Ok(AsyncBatchCursor::from_core(Arc::new(core)))
    }

    /// Run the command, blocking the calling thread.
    pub fn execute_blocking(
        &self,
        binding: &dyn Binding,
        session: Option<&ClientSession>,
    ) -> Result<BatchCursor<Document>> {
        let core = runtime::block_on(execute_retryable_read(self, binding, session, self.retry_reads))??;
        Ok(BatchCursor::from_core(Arc::new(core)))
    }
}

#[async_trait]
impl RetryableOperation for ListCollectionsOperation {
    type Output = CursorCore<Document>;

    fn name(&self) -> &str {
        "listCollections"
    }

    async fn execute_attempt(
        &self,
        source: Arc<dyn ConnectionSource>,
        connection: Arc<dyn Connection>,
        session: Option<&ClientSession>,
        _txn_number: Option<i64>,
    ) -> Result<CursorCore<Document>> {
        let reply = execute_command(connection.as_ref(), &self.database, self.command(), session, None).await?;
        let settings = CursorSettings::new(Namespace::new(self.database.as_str(), "$cmd.listCollections"))
            .batch_size(self.batch_size)
            .comment(self.comment.clone());
        CursorCore::open(&reply, settings, source, connection, session.cloned()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_command() {
        let op = ListCollectionsOperation::new("db")
            .filter(doc! { "name": "users" })
            .name_only(true)
            .batch_size(10);
        assert_eq!(
            op.command(),
            doc! {
                "listCollections": 1,
                "filter": { "name": "users" },
                "nameOnly": true,
                "cursor": { "batchSize": 10 },
            }
        );
    }
}
