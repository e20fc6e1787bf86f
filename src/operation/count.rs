//! The `count` command.

use super::{execute_retryable_read, RetryableOperation};
use crate::command::{execute_command, get_int, CommandDocument};
use crate::concern::{append_read_concern, ReadConcern};
use crate::connection::{Binding, Connection, ConnectionSource};
use crate::cursor::Namespace;
use crate::error::{MongoError, Result};
use crate::session::ClientSession;
use async_trait::async_trait;
use bson::{Bson, Document};
use std::sync::Arc;
use std::time::Duration;

/// Counts the documents of a collection matching a query.
#[derive(Debug, Clone)]
pub struct CountOperation {
    namespace: Namespace,
    query: Option<Document>,
    skip: i64,
    limit: i64,
    max_time: Option<Duration>,
    hint: Option<Bson>,
    collation: Option<Document>,
    comment: Option<Bson>,
    read_concern: ReadConcern,
    retry_reads: bool,
}

impl CountOperation {
    /// Count every document of `namespace`.
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            query: None,
            skip: 0,
            limit: 0,
            max_time: None,
            hint: None,
            collation: None,
            comment: None,
            read_concern: ReadConcern::default(),
            retry_reads: true,
        }
    }

    pub fn query(mut self, query: Document) -> Self {
        self.query = Some(query);
        self
    }

    pub fn skip(mut self, skip: i64) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    pub fn hint(mut self, hint: impl Into<Bson>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn collation(mut self, collation: Document) -> Self {
        self.collation = Some(collation);
        self
    }

    pub fn comment(mut self, comment: impl Into<Bson>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn read_concern(mut self, read_concern: ReadConcern) -> Self {
        self.read_concern = read_concern;
        self
    }

    pub fn retry_reads(mut self, retry_reads: bool) -> Self {
        self.retry_reads = retry_reads;
        self
    }

    /// The `count` command this operation sends.
    pub fn command(&self, session: Option<&ClientSession>) -> Document {
        CommandDocument::new("count", self.namespace.coll.as_str())
            .put_if_not_empty("query", self.query.as_ref())
            .put_if_nonzero("skip", self.skip)
            .put_if_nonzero("limit", self.limit)
            .put_max_time("maxTimeMS", self.max_time)
            .put_if_not_empty("collation", self.collation.as_ref())
            .put_if_some("comment", self.comment.clone())
            .with(|command| append_read_concern(command, &self.read_concern, session))
            .put_if_some("hint", self.hint.clone())
            .into_document()
    }

    /// Run the count.
    pub async fn execute(&self, binding: &dyn Binding, session: Option<&ClientSession>) -> Result<u64> {
        execute_retryable_read(self, binding, session, self.retry_reads).await
    }
}

#[async_trait]
impl RetryableOperation for CountOperation {
    type Output = u64;

    fn name(&self) -> &str {
        "count"
    }

    async fn execute_attempt(
        &self,
        _source: Arc<dyn ConnectionSource>,
        connection: Arc<dyn Connection>,
        session: Option<&ClientSession>,
        _txn_number: Option<i64>,
    ) -> Result<u64> {
        let reply = execute_command(
            connection.as_ref(),
            &self.namespace.db,
            self.command(session),
            session,
            None,
        )
        .await?;
        get_int(&reply, "n")
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| MongoError::Deserialization("count reply has no n".into()))
    }
}
