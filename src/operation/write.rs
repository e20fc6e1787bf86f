//! Insert, update, replace and delete, executed as bulk write commands.
//!
//! A [`MixedBulkWriteOperation`] groups its requests into runs of the same
//! kind. Each run is sent as one or more write commands of at most
//! `max_write_batch_size` requests. Every command is a separate retryable
//! write with its own `txnNumber`.

use super::{execute_retryable_write, RetryableOperation};
use crate::command::{execute_command, get_int, CommandDocument};
use crate::concern::{append_write_concern, WriteConcern};
use crate::connection::{Binding, Connection, ConnectionSource};
use crate::cursor::Namespace;
use crate::error::{MongoError, Result};
use crate::session::ClientSession;
use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One write of a bulk.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    /// Insert a document.
    Insert {
        /// The document; an `_id` is generated when absent.
        document: Document,
    },
    /// Apply update operators to matching documents.
    Update {
        /// Selects the documents to update.
        filter: Document,
        /// Update operators such as `$set`.
        update: Document,
        /// Update every match instead of the first.
        multi: bool,
        /// Insert a document when nothing matches.
        upsert: bool,
        /// Filters for positional array updates.
        array_filters: Option<Vec<Document>>,
    },
    /// Replace the first matching document.
    Replace {
        /// Selects the document to replace.
        filter: Document,
        /// The new document, without update operators.
        replacement: Document,
        /// Insert the replacement when nothing matches.
        upsert: bool,
    },
    /// Delete matching documents.
    Delete {
        /// Selects the documents to delete.
        filter: Document,
        /// Delete every match instead of the first.
        multi: bool,
    },
}

impl WriteRequest {
    /// Insert `document`.
    pub fn insert(document: Document) -> Self {
        WriteRequest::Insert { document }
    }

    /// Update the first document matching `filter`.
    pub fn update_one(filter: Document, update: Document) -> Self {
        WriteRequest::Update {
            filter,
            update,
            multi: false,
            upsert: false,
            array_filters: None,
        }
    }

    /// Update every document matching `filter`.
    pub fn update_many(filter: Document, update: Document) -> Self {
        WriteRequest::Update {
            filter,
            update,
            multi: true,
            upsert: false,
            array_filters: None,
        }
    }

    /// Replace the first document matching `filter`.
    pub fn replace_one(filter: Document, replacement: Document) -> Self {
        WriteRequest::Replace {
            filter,
            replacement,
            upsert: false,
        }
    }

    /// Delete the first document matching `filter`.
    pub fn delete_one(filter: Document) -> Self {
        WriteRequest::Delete { filter, multi: false }
    }

    /// Delete every document matching `filter`.
    pub fn delete_many(filter: Document) -> Self {
        WriteRequest::Delete { filter, multi: true }
    }

    /// Set `upsert` on an update or replace; other requests are unchanged.
    pub fn upsert(mut self, value: bool) -> Self {
        match &mut self {
            WriteRequest::Update { upsert, .. } | WriteRequest::Replace { upsert, .. } => {
                *upsert = value;
            }
            _ => {}
        }
        self
    }

    /// Set array filters on an update; other requests are unchanged.
    pub fn array_filters(mut self, filters: Vec<Document>) -> Self {
        if let WriteRequest::Update { array_filters, .. } = &mut self {
            *array_filters = Some(filters);
        }
        self
    }

    fn kind(&self) -> WriteKind {
        match self {
            WriteRequest::Insert { .. } => WriteKind::Insert,
            WriteRequest::Update { .. } | WriteRequest::Replace { .. } => WriteKind::Update,
            WriteRequest::Delete { .. } => WriteKind::Delete,
        }
    }

    fn is_multi(&self) -> bool {
        matches!(
            self,
            WriteRequest::Update { multi: true, .. } | WriteRequest::Delete { multi: true, .. }
        )
    }

    fn validate(&self) -> Result<()> {
        match self {
            WriteRequest::Update { update, .. } => {
                if update.is_empty() || !update.keys().all(|k| k.starts_with('$')) {
                    return Err(MongoError::invalid_argument(
                        "update document must contain only update operators",
                    ));
                }
            }
            WriteRequest::Replace { replacement, .. } => {
                if replacement.keys().any(|k| k.starts_with('$')) {
                    return Err(MongoError::invalid_argument(
                        "replacement document must not contain update operators",
                    ));
                }
            }
            WriteRequest::Insert { .. } | WriteRequest::Delete { .. } => {}
        }
        Ok(())
    }

    fn to_wire(&self) -> Bson {
        let entry = match self {
            WriteRequest::Insert { document } => document.clone(),
            WriteRequest::Update {
                filter,
                update,
                multi,
                upsert,
                array_filters,
            } => CommandDocument::new("q", filter.clone())
                .put("u", update.clone())
                .put_if_true("multi", *multi)
                .put_if_true("upsert", *upsert)
                .put_if_some("arrayFilters", array_filters.clone())
                .into_document(),
            WriteRequest::Replace {
                filter,
                replacement,
                upsert,
            } => CommandDocument::new("q", filter.clone())
                .put("u", replacement.clone())
                .put_if_true("upsert", *upsert)
                .into_document(),
            WriteRequest::Delete { filter, multi } => {
                let limit = if *multi { 0 } else { 1 };
                doc! { "q": filter.clone(), "limit": limit }
            }
        };
        Bson::Document(entry)
    }

    fn inserted_id(&self) -> Option<&Bson> {
        match self {
            WriteRequest::Insert { document } => document.get("_id"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl WriteKind {
    fn command_name(self) -> &'static str {
        match self {
            WriteKind::Insert => "insert",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        }
    }

    fn payload_key(self) -> &'static str {
        match self {
            WriteKind::Insert => "documents",
            WriteKind::Update => "updates",
            WriteKind::Delete => "deletes",
        }
    }
}

/// Write concern failure reported alongside a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteConcernError {
    pub code: i32,
    pub message: String,
}

/// Accumulated outcome of a bulk write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteResult {
    /// Number of documents inserted.
    pub inserted_count: u64,
    /// Number of documents matched by updates and replacements.
    pub matched_count: u64,
    /// Number of documents actually changed.
    pub modified_count: u64,
    /// Number of documents deleted.
    pub deleted_count: u64,
    /// `_id` of each upserted document, keyed by request index.
    pub upserted_ids: HashMap<usize, Bson>,
    /// `_id` of each inserted document, keyed by request index.
    pub inserted_ids: HashMap<usize, Bson>,
    /// Write concern failures, one per command that reported one.
    pub write_concern_errors: Vec<WriteConcernError>,
}

impl BulkWriteResult {
    /// Turn the first write concern failure into an error.
    pub fn into_result(self) -> Result<Self> {
        match self.write_concern_errors.first() {
            Some(error) => Err(MongoError::WriteConcern {
                code: error.code,
                message: error.message.clone(),
            }),
            None => Ok(self),
        }
    }
}

struct Run {
    kind: WriteKind,
    indexes: Vec<usize>,
}

/// An ordered or unordered list of writes against one collection.
///
/// # Example
///
/// ```ignore
/// let op = MixedBulkWriteOperation::new(
///     namespace,
///     vec![
///         WriteRequest::insert(doc! { "x": 1 }),
///         WriteRequest::update_one(doc! { "x": 1 }, doc! { "$inc": { "x": 1 } }),
///     ],
///     true,
/// )?;
/// let result = op.execute(&binding, Some(&session)).await?;
/// ```
#[derive(Debug, Clone)]
pub struct MixedBulkWriteOperation {
    namespace: Namespace,
    requests: Vec<WriteRequest>,
    ordered: bool,
    write_concern: WriteConcern,
    bypass_document_validation: Option<bool>,
    comment: Option<Bson>,
    retry_writes: bool,
}

impl MixedBulkWriteOperation {
    /// Create the operation. Inserts without an `_id` get a generated one
    /// here, so every attempt sends the same documents.
    pub fn new(namespace: Namespace, requests: Vec<WriteRequest>, ordered: bool) -> Result<Self> {
        if requests.is_empty() {
            return Err(MongoError::illegal_state("requests can not be an empty list"));
        }
        let requests = requests
            .into_iter()
            .map(|request| {
                request.validate()?;
                Ok(match request {
                    WriteRequest::Insert { document } if !document.contains_key("_id") => {
                        let mut with_id = doc! { "_id": ObjectId::new() };
                        for (key, value) in document {
                            with_id.insert(key, value);
                        }
                        WriteRequest::Insert { document: with_id }
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            namespace,
            requests,
            ordered,
            write_concern: WriteConcern::default(),
            bypass_document_validation: None,
            comment: None,
            retry_writes: true,
        })
    }

    pub fn write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }

    pub fn bypass_document_validation(mut self, bypass: bool) -> Self {
        self.bypass_document_validation = Some(bypass);
        self
    }

    pub fn comment(mut self, comment: impl Into<Bson>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn retry_writes(mut self, retry_writes: bool) -> Self {
        self.retry_writes = retry_writes;
        self
    }

    /// The requests, with generated `_id`s in place.
    pub fn requests(&self) -> &[WriteRequest] {
        &self.requests
    }

    /// Execute every request.
    ///
    /// An ordered bulk stops at the first write error, which is returned. An
    /// unordered bulk executes everything and returns the first write error
    /// it saw, if any.
    pub async fn execute(&self, binding: &dyn Binding, session: Option<&ClientSession>) -> Result<BulkWriteResult> {
        let mut result = BulkWriteResult::default();
        let mut first_error = None;

        for run in self.runs() {
            let retry_writes = self.retry_writes && !run.indexes.iter().any(|&i| self.requests[i].is_multi());
            let mut offset = 0;
            while offset < run.indexes.len() {
                let batch = WriteBatch {
                    operation: self,
                    kind: run.kind,
                    indexes: &run.indexes[offset..],
                    size: OnceCell::new(),
                };
                let reply =
                    execute_retryable_write(&batch, binding, session, retry_writes, &self.write_concern).await?;
                let chunk = &run.indexes[offset..offset + reply.size];
                offset += reply.size;

                if let Some(error) = self.merge(&mut result, run.kind, chunk, &reply.document) {
                    if self.ordered {
                        return Err(error);
                    }
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(result),
        }
    }

    fn runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = Vec::new();
        for (index, request) in self.requests.iter().enumerate() {
            let kind = request.kind();
            let run = if self.ordered {
                runs.last_mut().filter(|run| run.kind == kind)
            } else {
                runs.iter_mut().find(|run| run.kind == kind)
            };
            match run {
                Some(run) => run.indexes.push(index),
                None => runs.push(Run {
                    kind,
                    indexes: vec![index],
                }),
            }
        }
        runs
    }

    fn command(&self, kind: WriteKind, indexes: &[usize], session: Option<&ClientSession>) -> Document {
        let entries: Vec<Bson> = indexes.iter().map(|&i| self.requests[i].to_wire()).collect();
        CommandDocument::new(kind.command_name(), self.namespace.coll.as_str())
            .put("ordered", self.ordered)
            .put(kind.payload_key(), entries)
            .with(|command| append_write_concern(command, &self.write_concern, session))
            .put_if_some("bypassDocumentValidation", self.bypass_document_validation)
            .put_if_some("comment", self.comment.clone())
            .into_document()
    }

    /// Fold one command reply into `result`. Returns the first write error.
    fn merge(
        &self,
        result: &mut BulkWriteResult,
        kind: WriteKind,
        chunk: &[usize],
        reply: &Document,
    ) -> Option<MongoError> {
        let n = get_int(reply, "n").unwrap_or(0).max(0) as u64;

        let write_errors: Vec<(usize, i32, String)> = reply
            .get_array("writeErrors")
            .map(|errors| {
                errors
                    .iter()
                    .filter_map(Bson::as_document)
                    .map(|error| {
                        let position = get_int(error, "index").and_then(|i| usize::try_from(i).ok()).unwrap_or(0);
                        let code = get_int(error, "code").and_then(|c| i32::try_from(c).ok()).unwrap_or(0);
                        let message = error.get_str("errmsg").unwrap_or_default().to_string();
                        (position, code, message)
                    })
                    .collect()
            })
            .unwrap_or_default();

        match kind {
            WriteKind::Insert => {
                result.inserted_count += n;
                let stop = if self.ordered {
                    write_errors.iter().map(|(position, ..)| *position).min()
                } else {
                    None
                };
                for (position, &index) in chunk.iter().enumerate() {
                    if stop.is_some_and(|stop| position >= stop)
                        || write_errors.iter().any(|(p, ..)| *p == position)
                    {
                        continue;
                    }
                    if let Some(id) = self.requests[index].inserted_id() {
                        result.inserted_ids.insert(index, id.clone());
                    }
                }
            }
            WriteKind::Update => {
                let mut upserted = 0;
                if let Ok(entries) = reply.get_array("upserted") {
                    for entry in entries.iter().filter_map(Bson::as_document) {
                        let position = get_int(entry, "index").unwrap_or(0).max(0) as usize;
                        if let (Some(&index), Some(id)) = (chunk.get(position), entry.get("_id")) {
                            result.upserted_ids.insert(index, id.clone());
                            upserted += 1;
                        }
                    }
                }
                result.matched_count += n.saturating_sub(upserted);
                result.modified_count += get_int(reply, "nModified").unwrap_or(0).max(0) as u64;
            }
            WriteKind::Delete => result.deleted_count += n,
        }

        if let Ok(error) = reply.get_document("writeConcernError") {
            let code = get_int(error, "code").and_then(|c| i32::try_from(c).ok()).unwrap_or(0);
            let message = error.get_str("errmsg").unwrap_or_default().to_string();
            debug!(code, message = %message, "write concern error");
            result.write_concern_errors.push(WriteConcernError { code, message });
        }

        write_errors
            .into_iter()
            .min_by_key(|(position, ..)| *position)
            .map(|(position, code, message)| {
                let index = chunk.get(position).copied().unwrap_or(position);
                MongoError::write(index, code, message)
            })
    }
}

struct ChunkReply {
    document: Document,
    size: usize,
}

/// One write command: a prefix of a run's remaining requests.
///
/// The prefix length is fixed by the first attempt so a retry resends the
/// same requests.
struct WriteBatch<'a> {
    operation: &'a MixedBulkWriteOperation,
    kind: WriteKind,
    indexes: &'a [usize],
    size: OnceCell<usize>,
}

#[async_trait]
impl<'a> RetryableOperation for WriteBatch<'a> {
    type Output = ChunkReply;

    fn name(&self) -> &str {
        self.kind.command_name()
    }

    async fn execute_attempt(
        &self,
        _source: Arc<dyn ConnectionSource>,
        connection: Arc<dyn Connection>,
        session: Option<&ClientSession>,
        txn_number: Option<i64>,
    ) -> Result<ChunkReply> {
        let max = connection.description().max_write_batch_size.max(1);
        let size = *self.size.get_or_init(|| self.indexes.len().min(max));
        let command = self.operation.command(self.kind, &self.indexes[..size], session);
        let document = execute_command(
            connection.as_ref(),
            &self.operation.namespace.db,
            command,
            session,
            txn_number,
        )
        .await?;
        Ok(ChunkReply { document, size })
    }
}
