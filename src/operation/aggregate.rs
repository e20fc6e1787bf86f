//! The `aggregate` command.

use super::{execute_retryable_read, RetryableOperation};
use crate::command::{execute_command, CommandDocument};
use crate::concern::{append_read_concern, ReadConcern};
use crate::connection::{Binding, Connection, ConnectionSource};
use crate::cursor::{AsyncBatchCursor, BatchCursor, CursorCore, CursorSettings, Namespace};
use crate::error::Result;
use crate::runtime;
use crate::session::ClientSession;
use async_trait::async_trait;
use bson::{Bson, Document};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Runs an aggregation pipeline over a collection.
#[derive(Debug, Clone)]
pub struct AggregateOperation<T> {
    namespace: Namespace,
    pipeline: Vec<Document>,
    batch_size: i32,
    max_time: Option<Duration>,
    max_await_time: Option<Duration>,
    allow_disk_use: Option<bool>,
    collation: Option<Document>,
    comment: Option<Bson>,
    read_concern: ReadConcern,
    hint: Option<Bson>,
    retry_reads: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AggregateOperation<T> {
    /// Aggregate `namespace` through `pipeline`.
    pub fn new(namespace: Namespace, pipeline: impl IntoIterator<Item = Document>) -> Self {
        Self {
            namespace,
            pipeline: pipeline.into_iter().collect(),
            batch_size: 0,
            max_time: None,
            max_await_time: None,
            allow_disk_use: None,
            collation: None,
            comment: None,
            read_concern: ReadConcern::default(),
            hint: None,
            retry_reads: true,
            _marker: PhantomData,
        }
    }

    /// Set the batch size; negative means a single batch.
    pub fn batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the server-side time limit.
    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    /// Set the await time of get-more requests.
    pub fn max_await_time(mut self, max_await_time: Duration) -> Self {
        self.max_await_time = Some(max_await_time);
        self
    }

    /// Allow the server to use temporary files.
    pub fn allow_disk_use(mut self, allow: bool) -> Self {
        self.allow_disk_use = Some(allow);
        self
    }

    /// Set the collation.
    pub fn collation(mut self, collation: Document) -> Self {
        self.collation = Some(collation);
        self
    }

    /// Set the comment.
    pub fn comment(mut self, comment: impl Into<Bson>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Set the read concern.
    pub fn read_concern(mut self, read_concern: ReadConcern) -> Self {
        self.read_concern = read_concern;
        self
    }

    /// Set the index hint.
    pub fn hint(mut self, hint: impl Into<Bson>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Enable or disable retrying once on a transient error.
    pub fn retry_reads(mut self, retry_reads: bool) -> Self {
        self.retry_reads = retry_reads;
        self
    }

    /// The `aggregate` command this operation sends, without session fields.
    pub fn command(&self, session: Option<&ClientSession>) -> Document {
        let mut cursor = Document::new();
        if self.batch_size != 0 {
            cursor.insert("batchSize", self.batch_size.saturating_abs());
        }

        CommandDocument::new("aggregate", self.namespace.coll.as_str())
            .put("pipeline", self.pipeline.clone())
            .put_if_some("allowDiskUse", self.allow_disk_use)
            .put("cursor", cursor)
            .put_max_time("maxTimeMS", self.max_time)
            .put_if_not_empty("collation", self.collation.as_ref())
            .put_if_some("comment", self.comment.clone())
            .with(|command| append_read_concern(command, &self.read_concern, session))
            .put_if_some("hint", self.hint.clone())
            .into_document()
    }
}

impl<T> AggregateOperation<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Run the pipeline and return a cursor over its results.
    pub async fn execute(
        &self,
        binding: &dyn Binding,
        session: Option<&ClientSession>,
    ) -> Result<AsyncBatchCursor<T>> {
        let core = self.open(binding, session).await?;
        Ok(AsyncBatchCursor::from_core(core))
    }

    /// Run the pipeline, blocking the calling thread.
    pub fn execute_blocking(
        &self,
        binding: &dyn Binding,
        session: Option<&ClientSession>,
    ) -> Result<BatchCursor<T>> {
        let core = runtime::block_on(self.open(binding, session))??;
        Ok(BatchCursor::from_core(core))
    }

    async fn open(
        &self,
        binding: &dyn Binding,
        session: Option<&ClientSession>,
    ) -> Result<Arc<CursorCore<T>>> {
        let core = execute_retryable_read(self, binding, session, self.retry_reads).await?;
        Ok(Arc::new(core))
    }
}

#[async_trait]
impl<T> RetryableOperation for AggregateOperation<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = CursorCore<T>;

    fn name(&self) -> &str {
        "aggregate"
    }

    async fn execute_attempt(
        &self,
        source: Arc<dyn ConnectionSource>,
        connection: Arc<dyn Connection>,
        session: Option<&ClientSession>,
        _txn_number: Option<i64>,
    ) -> Result<CursorCore<T>> {
        let reply = execute_command(
            connection.as_ref(),
            &self.namespace.db,
            self.command(session),
            session,
            None,
        )
        .await?;
        let settings = CursorSettings::new(self.namespace.clone())
            .batch_size(self.batch_size)
            .max_await_time(self.max_await_time)
            .comment(self.comment.clone());
        CursorCore::open(&reply, settings, source, connection, session.cloned()).await
    }
}
