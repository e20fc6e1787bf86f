//! Collection struct with CRUD operations.

use crate::client::MongoClient;
use crate::cursor::{Cursor, Namespace};
use crate::error::{MongoError, Result};
use crate::operation::{
    AggregateOperation, BulkWriteResult, CommandOperation, CountOperation, CursorType, FindOperation,
    MixedBulkWriteOperation, WriteRequest,
};
use crate::session::ClientSession;
use bson::{doc, Bson, Document};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;

/// Result of an insert_one operation.
#[derive(Debug, Clone)]
pub struct InsertOneResult {
    /// The ID of the inserted document.
    pub inserted_id: Bson,
}

/// Result of an insert_many operation.
#[derive(Debug, Clone)]
pub struct InsertManyResult {
    /// Map of index to inserted ID.
    pub inserted_ids: HashMap<usize, Bson>,
}

/// Result of an update operation.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    /// Number of documents matched.
    pub matched_count: u64,
    /// Number of documents modified.
    pub modified_count: u64,
    /// The ID of the upserted document, if any.
    pub upserted_id: Option<Bson>,
}

/// Result of a delete operation.
#[derive(Debug, Clone)]
pub struct DeleteResult {
    /// Number of documents deleted.
    pub deleted_count: u64,
}

/// Options for find operations.
///
/// `limit` and `batch_size` keep the sign convention of the wire protocol: a
/// negative value returns a single batch and closes the cursor.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Maximum number of documents to return.
    pub limit: Option<i32>,
    /// Number of documents to skip.
    pub skip: Option<u64>,
    /// Sort order.
    pub sort: Option<Document>,
    /// Projection (fields to include/exclude).
    pub projection: Option<Document>,
    /// Batch size for cursor.
    pub batch_size: Option<i32>,
    /// Tailable or await-data cursor.
    pub cursor_type: Option<CursorType>,
    /// Server-side time limit of the query.
    pub max_time: Option<Duration>,
    /// How long a get-more on an await-data cursor waits for new documents.
    pub max_await_time: Option<Duration>,
    /// Comment attached to the query and its get-mores.
    pub comment: Option<Bson>,
}

impl FindOptions {
    /// Create new find options.
    pub fn builder() -> FindOptionsBuilder {
        FindOptionsBuilder::default()
    }
}

/// Builder for FindOptions.
#[derive(Debug, Clone, Default)]
pub struct FindOptionsBuilder {
    options: FindOptions,
}

impl FindOptionsBuilder {
    /// Set the limit.
    pub fn limit(mut self, limit: i32) -> Self {
        self.options.limit = Some(limit);
        self
    }

    /// Set the skip.
    pub fn skip(mut self, skip: u64) -> Self {
        self.options.skip = Some(skip);
        self
    }

    /// Set the sort order.
    pub fn sort(mut self, sort: Document) -> Self {
        self.options.sort = Some(sort);
        self
    }

    /// Set the projection.
    pub fn projection(mut self, projection: Document) -> Self {
        self.options.projection = Some(projection);
        self
    }

    /// Set the batch size.
    pub fn batch_size(mut self, batch_size: i32) -> Self {
        self.options.batch_size = Some(batch_size);
        self
    }

    /// Set the cursor type.
    pub fn cursor_type(mut self, cursor_type: CursorType) -> Self {
        self.options.cursor_type = Some(cursor_type);
        self
    }

    /// Set the server-side time limit.
    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.options.max_time = Some(max_time);
        self
    }

    /// Set the await time of get-mores on await-data cursors.
    pub fn max_await_time(mut self, max_await_time: Duration) -> Self {
        self.options.max_await_time = Some(max_await_time);
        self
    }

    /// Set the comment.
    pub fn comment(mut self, comment: impl Into<Bson>) -> Self {
        self.options.comment = Some(comment.into());
        self
    }

    /// Build the options.
    pub fn build(self) -> FindOptions {
        self.options
    }
}

/// Options for update operations.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Whether to insert if no documents match.
    pub upsert: Option<bool>,
    /// Array filters for updating nested arrays.
    pub array_filters: Option<Vec<Document>>,
}

impl UpdateOptions {
    /// Create a builder.
    pub fn builder() -> UpdateOptionsBuilder {
        UpdateOptionsBuilder::default()
    }

    fn apply(self, mut request: WriteRequest) -> WriteRequest {
        if let Some(upsert) = self.upsert {
            request = request.upsert(upsert);
        }
        if let Some(filters) = self.array_filters {
            request = request.array_filters(filters);
        }
        request
    }
}

/// Builder for UpdateOptions.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptionsBuilder {
    options: UpdateOptions,
}

impl UpdateOptionsBuilder {
    /// Set upsert option.
    pub fn upsert(mut self, upsert: bool) -> Self {
        self.options.upsert = Some(upsert);
        self
    }

    /// Set array filters.
    pub fn array_filters(mut self, filters: Vec<Document>) -> Self {
        self.options.array_filters = Some(filters);
        self
    }

    /// Build the options.
    pub fn build(self) -> UpdateOptions {
        self.options
    }
}

/// A handle to a MongoDB collection.
///
/// Reads are retried once after a transient failure when the client has
/// `retry_reads` set. Writes run in a session (the handle's own, or an
/// implicit one) so that they can be retried with the same transaction
/// number.
///
/// # Type Parameters
///
/// * `T` - The type of documents in this collection.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Serialize, Deserialize)]
/// struct User {
///     name: String,
///     email: String,
/// }
///
/// let users = client.database("mydb").collection::<User>("users");
/// users.insert_one(User { name: "John".to_string(), email: "john@example.com".to_string() }).await?;
/// ```
pub struct Collection<T> {
    namespace: Namespace,
    client: MongoClient,
    session: Option<ClientSession>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Collection<T> {
    /// Create a new collection handle.
    pub(crate) fn new(namespace: Namespace, client: MongoClient) -> Self {
        Self {
            namespace,
            client,
            session: None,
            _marker: PhantomData,
        }
    }

    /// Get the collection name.
    pub fn name(&self) -> &str {
        &self.namespace.coll
    }

    /// Get the database name.
    pub fn database_name(&self) -> &str {
        &self.namespace.db
    }

    /// Get the full namespace.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The session operations on this handle run in, if any.
    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref()
    }

    /// A handle whose operations all run in `session`.
    pub fn with_session(&self, session: ClientSession) -> Self {
        Self {
            session: Some(session),
            ..self.clone()
        }
    }

    /// Clone this collection with a new type parameter.
    pub fn clone_with_type<U>(&self) -> Collection<U> {
        Collection {
            namespace: self.namespace.clone(),
            client: self.client.clone(),
            session: self.session.clone(),
            _marker: PhantomData,
        }
    }

    /// Drop the collection. Dropping a collection that does not exist
    /// succeeds.
    pub async fn drop(&self) -> Result<()> {
        let command = doc! { "drop": self.namespace.coll.as_str() };
        match CommandOperation::new(self.namespace.db.as_str(), command)
            .execute(self.client.binding(), self.session.as_ref())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(26) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Run `requests` as one bulk write.
    ///
    /// Write concern errors are reported in the result rather than as an
    /// error.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = collection.bulk_write(vec![
    ///     WriteRequest::insert(doc! { "x": 1 }),
    ///     WriteRequest::update_one(doc! { "x": 1 }, doc! { "$inc": { "x": 1 } }),
    ///     WriteRequest::delete_many(doc! { "x": { "$gt": 5 } }),
    /// ], true).await?;
    /// ```
    pub async fn bulk_write(&self, requests: Vec<WriteRequest>, ordered: bool) -> Result<BulkWriteResult> {
        let options = self.client.options();
        let write_concern = options.write_concern();
        let operation = MixedBulkWriteOperation::new(self.namespace.clone(), requests, ordered)?
            .write_concern(write_concern.clone())
            .retry_writes(options.retry_writes);

        let implicit;
        let session = match &self.session {
            Some(session) => Some(session),
            None if write_concern.is_acknowledged() => {
                implicit = ClientSession::implicit();
                Some(&implicit)
            }
            None => None,
        };
        operation.execute(self.client.binding(), session).await
    }

    async fn write_one(&self, request: WriteRequest) -> Result<BulkWriteResult> {
        self.bulk_write(vec![request], true).await?.into_result()
    }

    /// Update a single document.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = collection.update_one(
    ///     doc! { "_id": id },
    ///     doc! { "$set": { "name": "Jane" } },
    /// ).await?;
    /// ```
    pub async fn update_one(&self, filter: Document, update: Document) -> Result<UpdateResult> {
        self.update_one_with_options(filter, update, None).await
    }

    /// Update a single document with options.
    pub async fn update_one_with_options(
        &self,
        filter: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        let request = options
            .into()
            .unwrap_or_default()
            .apply(WriteRequest::update_one(filter, update));
        self.write_one(request).await.map(update_result)
    }

    /// Update every matching document.
    ///
    /// Multi-document updates are never retried.
    pub async fn update_many(&self, filter: Document, update: Document) -> Result<UpdateResult> {
        self.update_many_with_options(filter, update, None).await
    }

    /// Update every matching document with options.
    pub async fn update_many_with_options(
        &self,
        filter: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        let request = options
            .into()
            .unwrap_or_default()
            .apply(WriteRequest::update_many(filter, update));
        self.write_one(request).await.map(update_result)
    }

    /// Delete a single document.
    pub async fn delete_one(&self, filter: Document) -> Result<DeleteResult> {
        let result = self.write_one(WriteRequest::delete_one(filter)).await?;
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    /// Delete every matching document.
    pub async fn delete_many(&self, filter: Document) -> Result<DeleteResult> {
        let result = self.write_one(WriteRequest::delete_many(filter)).await?;
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    /// Count the documents matching `filter`.
    pub async fn count_documents(&self, filter: impl Into<Option<Document>>) -> Result<u64> {
        let options = self.client.options();
        let mut operation = CountOperation::new(self.namespace.clone())
            .read_concern(options.read_concern())
            .retry_reads(options.retry_reads);
        if let Some(filter) = filter.into() {
            operation = operation.query(filter);
        }
        operation.execute(self.client.binding(), self.session.as_ref()).await
    }

    /// Run an aggregation pipeline.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let cursor = collection.aggregate(vec![
    ///     doc! { "$match": { "status": "active" } },
    ///     doc! { "$sort": { "age": -1 } },
    /// ]).await?;
    /// ```
    pub async fn aggregate(&self, pipeline: impl IntoIterator<Item = Document>) -> Result<Cursor<Document>> {
        let options = self.client.options();
        let batches = AggregateOperation::<Document>::new(self.namespace.clone(), pipeline)
            .read_concern(options.read_concern())
            .retry_reads(options.retry_reads)
            .execute(self.client.binding(), self.session.as_ref())
            .await?;
        Ok(Cursor::new(batches))
    }
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        self.clone_with_type()
    }
}

impl<T> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("namespace", &self.namespace)
            .field("session", &self.session)
            .finish()
    }
}

fn update_result(result: BulkWriteResult) -> UpdateResult {
    UpdateResult {
        matched_count: result.matched_count,
        modified_count: result.modified_count,
        upserted_id: result.upserted_ids.get(&0).cloned(),
    }
}

impl<T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static> Collection<T> {
    /// Insert a single document.
    ///
    /// An `_id` is generated when the document has none.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = collection.insert_one(doc! { "name": "John" }).await?;
    /// println!("Inserted ID: {:?}", result.inserted_id);
    /// ```
    pub async fn insert_one(&self, doc: impl Into<T>) -> Result<InsertOneResult> {
        let document = bson::to_document(&doc.into())?;
        let result = self.write_one(WriteRequest::insert(document)).await?;
        Ok(InsertOneResult {
            inserted_id: result.inserted_ids.get(&0).cloned().unwrap_or(Bson::Null),
        })
    }

    /// Insert multiple documents, in order.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let docs = vec![
    ///     doc! { "name": "John" },
    ///     doc! { "name": "Jane" },
    /// ];
    /// let result = collection.insert_many(docs).await?;
    /// ```
    pub async fn insert_many(&self, docs: impl IntoIterator<Item = T>) -> Result<InsertManyResult> {
        let requests = docs
            .into_iter()
            .map(|d| bson::to_document(&d).map(WriteRequest::insert))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let result = self.bulk_write(requests, true).await?.into_result()?;
        Ok(InsertManyResult {
            inserted_ids: result.inserted_ids,
        })
    }

    /// Replace the first document matching `filter`.
    pub async fn replace_one(&self, filter: Document, replacement: impl Into<T>) -> Result<UpdateResult> {
        let replacement = bson::to_document(&replacement.into())?;
        self.write_one(WriteRequest::replace_one(filter, replacement))
            .await
            .map(update_result)
    }

    /// Find documents matching a filter.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let cursor = collection.find(doc! { "status": "active" }).await?;
    /// let docs: Vec<User> = cursor.collect().await?;
    /// ```
    pub async fn find(&self, filter: impl Into<Option<Document>>) -> Result<Cursor<T>> {
        self.find_with_options(filter, None).await
    }

    /// Find documents with options.
    pub async fn find_with_options(
        &self,
        filter: impl Into<Option<Document>>,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Cursor<T>> {
        let operation = self.find_operation(filter.into(), options.into().unwrap_or_default())?;
        let batches = operation
            .execute(self.client.binding(), self.session.as_ref())
            .await?;
        Ok(Cursor::new(batches))
    }

    /// Find a single document.
    pub async fn find_one(&self, filter: impl Into<Option<Document>>) -> Result<Option<T>> {
        let options = FindOptions::builder().limit(-1).build();
        let mut cursor = self.find_with_options(filter, options).await?;
        cursor.try_next().await
    }

    fn find_operation(&self, filter: Option<Document>, options: FindOptions) -> Result<FindOperation<T>> {
        let client_options = self.client.options();
        let mut operation = FindOperation::new(self.namespace.clone())
            .read_concern(client_options.read_concern())
            .retry_reads(client_options.retry_reads);

        if let Some(filter) = filter {
            operation = operation.filter(filter);
        }
        if let Some(limit) = options.limit {
            operation = operation.limit(limit);
        }
        if let Some(skip) = options.skip {
            let skip = i64::try_from(skip)
                .map_err(|_| MongoError::invalid_argument(format!("skip out of range: {skip}")))?;
            operation = operation.skip(skip);
        }
        if let Some(sort) = options.sort {
            operation = operation.sort(sort);
        }
        if let Some(projection) = options.projection {
            operation = operation.projection(projection);
        }
        if let Some(batch_size) = options.batch_size {
            operation = operation.batch_size(batch_size);
        }
        if let Some(max_time) = options.max_time {
            operation = operation.max_time(max_time);
        }
        if let Some(comment) = options.comment {
            operation = operation.comment(comment);
        }
        if let Some(cursor_type) = options.cursor_type {
            operation = operation.cursor_type(cursor_type);
            let max_await_time = options.max_await_time.or_else(|| client_options.max_await_time());
            if let (CursorType::TailableAwait, Some(max_await_time)) = (cursor_type, max_await_time) {
                operation = operation.max_await_time(max_await_time);
            }
        }
        Ok(operation)
    }
}
