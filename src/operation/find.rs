//! The `find` command.

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

/// Whether a cursor follows new documents in a capped collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CursorType {
    /// Closes once the results are exhausted.
    #[default]
    NonTailable,
    /// Stays open at the end of a capped collection.
    Tailable,
    /// Tailable, and get-more waits for new documents on the server.
    TailableAwait,
}

/// Finds documents in a collection.
///
/// Limit and batch size follow the sign convention of the wire protocol: a
/// negative value of either means "return a single batch and close the
/// cursor". Only magnitudes are sent to the server.
///
/// # Example
///
/// ```ignore
/// let cursor = FindOperation::<Document>::new(Namespace::new("db", "coll"))
///     .filter(doc! { "x": { "$gt": 1 } })
///     .limit(5)
///     .batch_size(2)
///     .execute(&binding, None)
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct FindOperation<T> {
    namespace: Namespace,
    filter: Option<Document>,
    sort: Option<Document>,
    projection: Option<Document>,
    skip: i64,
    limit: i32,
    batch_size: i32,
    cursor_type: CursorType,
    max_time: Option<Duration>,
    max_await_time: Option<Duration>,
    no_cursor_timeout: bool,
    allow_partial_results: bool,
    allow_disk_use: Option<bool>,
    collation: Option<Document>,
    comment: Option<Bson>,
    read_concern: ReadConcern,
    hint: Option<Bson>,
    retry_reads: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FindOperation<T> {
    /// Find every document of `namespace`.
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            filter: None,
            sort: None,
            projection: None,
            skip: 0,
            limit: 0,
            batch_size: 0,
            cursor_type: CursorType::NonTailable,
            max_time: None,
            max_await_time: None,
            no_cursor_timeout: false,
            allow_partial_results: false,
            allow_disk_use: None,
            collation: None,
            comment: None,
            read_concern: ReadConcern::default(),
            hint: None,
            retry_reads: true,
            _marker: PhantomData,
        }
    }

    /// Set the query filter.
    pub fn filter(mut self, filter: Document) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set the sort order.
    pub fn sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Set the projection.
    pub fn projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Set the number of documents to skip.
    pub fn skip(mut self, skip: i64) -> Self {
        self.skip = skip;
        self
    }

    /// Set the limit.
    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = limit;
        self
    }

    /// Set the batch size.
    pub fn batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the cursor type.
    pub fn cursor_type(mut self, cursor_type: CursorType) -> Self {
        self.cursor_type = cursor_type;
        self
    }

    /// Set the server-side time limit of the query.
    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    /// Set how long a get-more on a tailable await cursor waits for data.
    pub fn max_await_time(mut self, max_await_time: Duration) -> Self {
        self.max_await_time = Some(max_await_time);
        self
    }

    /// Keep the server cursor from timing out.
    pub fn no_cursor_timeout(mut self, no_cursor_timeout: bool) -> Self {
        self.no_cursor_timeout = no_cursor_timeout;
        self
    }

    /// Accept partial results from a sharded cluster with unavailable shards.
    pub fn allow_partial_results(mut self, allow: bool) -> Self {
        self.allow_partial_results = allow;
        self
    }

    /// Allow the server to use temporary files for large sorts.
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

    /// Enable or disable retrying the query once on a transient error.
    pub fn retry_reads(mut self, retry_reads: bool) -> Self {
        self.retry_reads = retry_reads;
        self
    }

    /// The `find` command this operation sends, without session fields.
    pub fn command(&self, session: Option<&ClientSession>) -> Document {
        let mut limit = self.limit.saturating_abs();
        let mut batch_size = 0;
        if self.limit >= 0 {
            if self.batch_size < 0 && self.batch_size.saturating_abs() < limit {
                limit = self.batch_size.saturating_abs();
            } else {
                batch_size = self.batch_size.saturating_abs();
            }
        }

        let tailable = self.cursor_type != CursorType::NonTailable;
        let await_data = self.cursor_type == CursorType::TailableAwait;

        CommandDocument::new("find", self.namespace.coll.as_str())
            .put_if_not_empty("filter", self.filter.as_ref())
            .put_if_not_empty("sort", self.sort.as_ref())
            .put_if_not_empty("projection", self.projection.as_ref())
            .put_if_nonzero("skip", self.skip)
            .put_if_nonzero("limit", limit)
            .put_if_nonzero("batchSize", batch_size)
            .put_if_true("tailable", tailable)
            .put_if_true("awaitData", await_data)
            .put_max_time("maxTimeMS", self.max_time)
            .put_if_true("noCursorTimeout", self.no_cursor_timeout)
            .put_if_true("allowPartialResults", self.allow_partial_results)
            .put_if_some("allowDiskUse", self.allow_disk_use)
            .put_if_not_empty("collation", self.collation.as_ref())
            .put_if_some("comment", self.comment.clone())
            .with(|command| append_read_concern(command, &self.read_concern, session))
            .put_if_some("hint", self.hint.clone())
            .into_document()
    }

    fn cursor_settings(&self) -> CursorSettings {
        let max_await_time = match self.cursor_type {
            CursorType::TailableAwait => self.max_await_time,
            _ => None,
        };
        CursorSettings::new(self.namespace.clone())
            .batch_size(self.batch_size)
            .limit(self.limit)
            .max_await_time(max_await_time)
            .comment(self.comment.clone())
    }
}

impl<T> FindOperation<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Run the query and return a cursor over its results.
    pub async fn execute(
        &self,
        binding: &dyn Binding,
        session: Option<&ClientSession>,
    ) -> Result<AsyncBatchCursor<T>> {
        let core = self.open(binding, session).await?;
        Ok(AsyncBatchCursor::from_core(core))
    }

    /// Run the query, blocking the calling thread.
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
impl<T> RetryableOperation for FindOperation<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = CursorCore<T>;

    fn name(&self) -> &str {
        "find"
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
        CursorCore::open(&reply, self.cursor_settings(), source, connection, session.cloned()).await
    }
}
