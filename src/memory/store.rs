//! Collections and server cursors of the in-memory server, and the commands
//! that operate on them.
//!
//! Every command returns a reply document; failures are `ok: 0` replies, the
//! same way a real server reports them.

use super::matcher::{self, ServerError};
use crate::command::get_int;
use crate::cursor::Namespace;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Size of a first batch when the command does not ask for one.
pub(crate) const DEFAULT_FIRST_BATCH: usize = 101;

pub(crate) fn ok_reply() -> Document {
    doc! { "ok": 1.0 }
}

pub(crate) fn error_reply(code: i32, code_name: &str, message: impl Into<String>) -> Document {
    doc! {
        "ok": 0.0,
        "errmsg": message.into(),
        "code": code,
        "codeName": code_name,
    }
}

fn server_error_reply((code, code_name, message): ServerError) -> Document {
    error_reply(code, code_name, message)
}

fn cursor_reply(namespace: &Namespace, id: i64, batch: Vec<Document>, key: &str) -> Document {
    let mut cursor = Document::new();
    cursor.insert(key, batch);
    cursor.insert("id", id);
    cursor.insert("ns", namespace.to_string());
    doc! { "cursor": cursor, "ok": 1.0 }
}

fn requested_size(command: &Document, key: &str) -> Option<usize> {
    get_int(command, key)
        .filter(|n| *n > 0)
        .and_then(|n| usize::try_from(n).ok())
}

struct Stored {
    seq: u64,
    document: Document,
    size: usize,
}

#[derive(Default)]
struct Capped {
    size: Option<usize>,
    max: Option<usize>,
}

#[derive(Default)]
struct StoredCollection {
    entries: Vec<Stored>,
    capped: Option<Capped>,
}

impl StoredCollection {
    fn contains_id(&self, id: &Bson) -> bool {
        self.entries.iter().any(|entry| entry.document.get("_id") == Some(id))
    }

    fn push(&mut self, seq: u64, document: Document) {
        let size = bson::to_vec(&document).map(|bytes| bytes.len()).unwrap_or(0);
        self.entries.push(Stored { seq, document, size });
        if let Some(capped) = &self.capped {
            while capped.max.is_some_and(|max| self.entries.len() > max)
                || capped
                    .size
                    .is_some_and(|limit| self.entries.iter().map(|e| e.size).sum::<usize>() > limit)
            {
                if self.entries.len() <= 1 {
                    break;
                }
                self.entries.remove(0);
            }
        }
    }

    fn matching(&self, filter: &Document) -> Result<Vec<&Stored>, ServerError> {
        let mut found = Vec::new();
        for entry in &self.entries {
            if matcher::matches(&entry.document, filter)? {
                found.push(entry);
            }
        }
        Ok(found)
    }
}

enum CursorSource {
    Buffered(VecDeque<Document>),
    Tailable {
        filter: Document,
        projection: Option<Document>,
        last_seq: u64,
        await_data: bool,
    },
}

struct CursorState {
    namespace: Namespace,
    source: CursorSource,
}

/// Outcome of a get-more.
pub(crate) enum GetMore {
    /// A reply to send back.
    Reply(Document),
    /// A tailable cursor with nothing new: the empty reply, and whether the
    /// cursor asked the server to wait for data.
    NoData(Document, bool),
}

#[derive(Default)]
pub(crate) struct Store {
    databases: HashMap<String, BTreeMap<String, StoredCollection>>,
    cursors: HashMap<i64, CursorState>,
    next_cursor_id: i64,
    next_seq: u64,
}

impl Store {
    pub fn open_cursor_count(&self) -> usize {
        self.cursors.len()
    }

    /// Forget every server cursor, as if they had timed out.
    pub fn expire_cursors(&mut self) {
        self.cursors.clear();
    }

    fn collection(&self, db: &str, coll: &str) -> Option<&StoredCollection> {
        self.databases.get(db).and_then(|collections| collections.get(coll))
    }

    fn register(&mut self, namespace: Namespace, source: CursorSource) -> i64 {
        self.next_cursor_id += 1;
        let id = self.next_cursor_id;
        self.cursors.insert(id, CursorState { namespace, source });
        id
    }

    /// Hand out the first batch of `documents`, keeping a cursor over the
    /// rest.
    fn open_buffered(&mut self, namespace: Namespace, documents: Vec<Document>, batch_size: Option<usize>) -> Document {
        let mut remaining: VecDeque<Document> = documents.into();
        let first = batch_size.unwrap_or(DEFAULT_FIRST_BATCH).min(remaining.len());
        let batch: Vec<Document> = remaining.drain(..first).collect();
        let id = if remaining.is_empty() {
            0
        } else {
            self.register(namespace.clone(), CursorSource::Buffered(remaining))
        };
        cursor_reply(&namespace, id, batch, "firstBatch")
    }

    pub fn find(&mut self, db: &str, command: &Document) -> Document {
        let Ok(coll) = command.get_str("find") else {
            return error_reply(2, "BadValue", "collection name must be a string");
        };
        let namespace = Namespace::new(db, coll);
        let filter = command.get_document("filter").cloned().unwrap_or_default();
        let projection = command.get_document("projection").ok().cloned();
        let batch_size = requested_size(command, "batchSize");
        let tailable = command.get_bool("tailable").unwrap_or(false);

        let Some(collection) = self.collection(db, coll) else {
            return cursor_reply(&namespace, 0, Vec::new(), "firstBatch");
        };

        if tailable {
            if collection.capped.is_none() {
                return error_reply(
                    2,
                    "BadValue",
                    format!("error processing query: ns={namespace} tailable cursor requested on non capped collection"),
                );
            }
            let matching = match collection.matching(&filter) {
                Ok(matching) => matching,
                Err(e) => return server_error_reply(e),
            };
            let first = batch_size.unwrap_or(DEFAULT_FIRST_BATCH);
            let taken: Vec<&Stored> = matching.into_iter().take(first).collect();
            let last_seq = taken.last().map_or(0, |entry| entry.seq);
            let batch = taken
                .iter()
                .map(|entry| apply_projection(&entry.document, projection.as_ref()))
                .collect();
            let id = self.register(
                namespace.clone(),
                CursorSource::Tailable {
                    filter,
                    projection,
                    last_seq,
                    await_data: command.get_bool("awaitData").unwrap_or(false),
                },
            );
            return cursor_reply(&namespace, id, batch, "firstBatch");
        }

        let mut documents: Vec<Document> = match collection.matching(&filter) {
            Ok(matching) => matching.into_iter().map(|entry| entry.document.clone()).collect(),
            Err(e) => return server_error_reply(e),
        };
        if let Ok(sort) = command.get_document("sort") {
            matcher::sort(&mut documents, sort);
        }
        let skip = get_int(command, "skip").unwrap_or(0).max(0) as usize;
        let limit = get_int(command, "limit").unwrap_or(0).unsigned_abs() as usize;
        let documents = documents
            .into_iter()
            .skip(skip)
            .take(if limit == 0 { usize::MAX } else { limit })
            .map(|document| apply_projection(&document, projection.as_ref()))
            .collect();

        self.open_buffered(namespace, documents, batch_size)
    }

    pub fn aggregate(&mut self, db: &str, command: &Document) -> Document {
        let Ok(coll) = command.get_str("aggregate") else {
            return error_reply(2, "BadValue", "aggregate needs a collection name");
        };
        let namespace = Namespace::new(db, coll);
        let Ok(pipeline) = command.get_array("pipeline") else {
            return error_reply(9, "FailedToParse", "'pipeline' option must be specified as an array");
        };
        let Ok(cursor) = command.get_document("cursor") else {
            return error_reply(9, "FailedToParse", "The 'cursor' option is required");
        };
        let batch_size = requested_size(cursor, "batchSize");

        let mut documents: Vec<Document> = self
            .collection(db, coll)
            .map(|collection| collection.entries.iter().map(|e| e.document.clone()).collect())
            .unwrap_or_default();

        for stage in pipeline {
            let Some(stage) = stage.as_document() else {
                return error_reply(14, "TypeMismatch", "each element of the 'pipeline' array must be an object");
            };
            documents = match run_stage(documents, stage) {
                Ok(documents) => documents,
                Err(e) => return server_error_reply(e),
            };
        }

        self.open_buffered(namespace, documents, batch_size)
    }

    pub fn get_more(&mut self, command: &Document) -> GetMore {
        let Some(id) = get_int(command, "getMore") else {
            return GetMore::Reply(error_reply(14, "TypeMismatch", "getMore needs a cursor id"));
        };
        let batch_size = requested_size(command, "batchSize");
        let Some(cursor) = self.cursors.get_mut(&id) else {
            return GetMore::Reply(error_reply(43, "CursorNotFound", format!("cursor id {id} not found")));
        };
        let namespace = cursor.namespace.clone();

        match &mut cursor.source {
            CursorSource::Buffered(remaining) => {
                let count = batch_size.unwrap_or(remaining.len()).min(remaining.len());
                let batch: Vec<Document> = remaining.drain(..count).collect();
                let id = if remaining.is_empty() {
                    self.cursors.remove(&id);
                    0
                } else {
                    id
                };
                GetMore::Reply(cursor_reply(&namespace, id, batch, "nextBatch"))
            }
            CursorSource::Tailable {
                filter,
                projection,
                last_seq,
                await_data,
            } => {
                let Some(collection) = self
                    .databases
                    .get(&namespace.db)
                    .and_then(|collections| collections.get(&namespace.coll))
                else {
                    self.cursors.remove(&id);
                    return GetMore::Reply(cursor_reply(&namespace, 0, Vec::new(), "nextBatch"));
                };
                let start = *last_seq;
                let mut batch = Vec::new();
                for entry in collection.entries.iter().filter(|entry| entry.seq > start) {
                    if batch_size.is_some_and(|size| batch.len() >= size) {
                        break;
                    }
                    match matcher::matches(&entry.document, filter) {
                        Ok(true) => {
                            batch.push(apply_projection(&entry.document, projection.as_ref()));
                            *last_seq = entry.seq;
                        }
                        Ok(false) => {}
                        Err(e) => return GetMore::Reply(server_error_reply(e)),
                    }
                }
                if batch.is_empty() {
                    let await_data = *await_data;
                    GetMore::NoData(cursor_reply(&namespace, id, batch, "nextBatch"), await_data)
                } else {
                    GetMore::Reply(cursor_reply(&namespace, id, batch, "nextBatch"))
                }
            }
        }
    }

    pub fn kill_cursors(&mut self, command: &Document) -> Document {
        let ids: Vec<i64> = command
            .get_array("cursors")
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| match id {
                        Bson::Int64(v) => Some(*v),
                        Bson::Int32(v) => Some(i64::from(*v)),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let (killed, not_found): (Vec<i64>, Vec<i64>) =
            ids.into_iter().partition(|id| self.cursors.remove(id).is_some());
        doc! {
            "cursorsKilled": killed,
            "cursorsNotFound": not_found,
            "cursorsAlive": [],
            "cursorsUnknown": [],
            "ok": 1.0,
        }
    }

    pub fn insert(&mut self, db: &str, command: &Document) -> Document {
        let Ok(coll) = command.get_str("insert") else {
            return error_reply(2, "BadValue", "collection name must be a string");
        };
        let ordered = command.get_bool("ordered").unwrap_or(true);
        let Ok(documents) = command.get_array("documents") else {
            return error_reply(9, "FailedToParse", "insert needs a documents array");
        };

        let Store {
            databases, next_seq, ..
        } = self;
        let collection = databases
            .entry(db.to_string())
            .or_default()
            .entry(coll.to_string())
            .or_default();

        let mut n = 0;
        let mut write_errors = Vec::new();
        for (index, document) in documents.iter().enumerate() {
            let Some(document) = document.as_document() else {
                write_errors.push(write_error(index, 2, "document to insert must be an object"));
                if ordered {
                    break;
                }
                continue;
            };
            let document = with_id(document.clone());
            let id = document.get("_id").cloned().unwrap_or(Bson::Null);
            if collection.contains_id(&id) {
                write_errors.push(write_error(
                    index,
                    11000,
                    format!("E11000 duplicate key error collection: {db}.{coll} index: _id_ dup key: {{ _id: {id} }}"),
                ));
                if ordered {
                    break;
                }
                continue;
            }
            *next_seq += 1;
            collection.push(*next_seq, document);
            n += 1;
        }

        write_reply(n, None, Vec::new(), write_errors)
    }

    pub fn update(&mut self, db: &str, command: &Document) -> Document {
        let Ok(coll) = command.get_str("update") else {
            return error_reply(2, "BadValue", "collection name must be a string");
        };
        let ordered = command.get_bool("ordered").unwrap_or(true);
        let Ok(updates) = command.get_array("updates") else {
            return error_reply(9, "FailedToParse", "update needs an updates array");
        };

        let Store {
            databases, next_seq, ..
        } = self;

        let mut n = 0;
        let mut modified = 0;
        let mut upserted = Vec::new();
        let mut write_errors = Vec::new();

        for (index, statement) in updates.iter().enumerate() {
            let outcome = statement
                .as_document()
                .ok_or_else(|| (9, "FailedToParse", "update statement must be an object".to_string()))
                .and_then(|statement| {
                    let filter = statement.get_document("q").cloned().unwrap_or_default();
                    let update = statement
                        .get_document("u")
                        .cloned()
                        .map_err(|_| (9, "FailedToParse", "update statement needs 'u'".to_string()))?;
                    let multi = statement.get_bool("multi").unwrap_or(false);
                    let upsert = statement.get_bool("upsert").unwrap_or(false);
                    let collections = databases.entry(db.to_string()).or_default();
                    if !upsert && !collections.contains_key(coll) {
                        return Ok((0, 0, None));
                    }
                    let collection = collections.entry(coll.to_string()).or_default();
                    update_documents(collection, &filter, &update, multi, upsert, next_seq)
                });
            match outcome {
                Ok((matched, changed, upserted_id)) => {
                    n += matched;
                    modified += changed;
                    if let Some(id) = upserted_id {
                        n += 1;
                        upserted.push(doc! { "index": index as i32, "_id": id });
                    }
                }
                Err((code, _, message)) => {
                    write_errors.push(write_error(index, code, message));
                    if ordered {
                        break;
                    }
                }
            }
        }

        write_reply(n, Some(modified), upserted, write_errors)
    }

    pub fn delete(&mut self, db: &str, command: &Document) -> Document {
        let Ok(coll) = command.get_str("delete") else {
            return error_reply(2, "BadValue", "collection name must be a string");
        };
        let ordered = command.get_bool("ordered").unwrap_or(true);
        let Ok(deletes) = command.get_array("deletes") else {
            return error_reply(9, "FailedToParse", "delete needs a deletes array");
        };

        let mut n = 0;
        let mut write_errors = Vec::new();
        let collection = self
            .databases
            .get_mut(db)
            .and_then(|collections| collections.get_mut(coll));
        let Some(collection) = collection else {
            return write_reply(0, None, Vec::new(), Vec::new());
        };

        for (index, statement) in deletes.iter().enumerate() {
            let Some(statement) = statement.as_document() else {
                write_errors.push(write_error(index, 9, "delete statement must be an object"));
                if ordered {
                    break;
                }
                continue;
            };
            let filter = statement.get_document("q").cloned().unwrap_or_default();
            let single = get_int(statement, "limit").unwrap_or(0) == 1;

            let mut removed = 0;
            let mut failure = None;
            collection.entries.retain(|entry| {
                if failure.is_some() || (single && removed == 1) {
                    return true;
                }
                match matcher::matches(&entry.document, &filter) {
                    Ok(true) => {
                        removed += 1;
                        false
                    }
                    Ok(false) => true,
                    Err(e) => {
                        failure = Some(e);
                        true
                    }
                }
            });
            n += removed;
            if let Some((code, _, message)) = failure {
                write_errors.push(write_error(index, code, message));
                if ordered {
                    break;
                }
            }
        }

        write_reply(n, None, Vec::new(), write_errors)
    }

    pub fn count(&mut self, db: &str, command: &Document) -> Document {
        let Ok(coll) = command.get_str("count") else {
            return error_reply(2, "BadValue", "collection name must be a string");
        };
        let query = command.get_document("query").cloned().unwrap_or_default();
        let matching = match self.collection(db, coll) {
            Some(collection) => match collection.matching(&query) {
                Ok(matching) => matching.len(),
                Err(e) => return server_error_reply(e),
            },
            None => 0,
        };
        let skip = get_int(command, "skip").unwrap_or(0).max(0) as usize;
        let limit = get_int(command, "limit").unwrap_or(0).unsigned_abs() as usize;
        let mut n = matching.saturating_sub(skip);
        if limit != 0 {
            n = n.min(limit);
        }
        doc! { "n": n as i64, "ok": 1.0 }
    }

    pub fn list_collections(&mut self, db: &str, command: &Document) -> Document {
        let filter = command.get_document("filter").cloned().unwrap_or_default();
        let name_only = command.get_bool("nameOnly").unwrap_or(false);
        let batch_size = command
            .get_document("cursor")
            .ok()
            .and_then(|cursor| requested_size(cursor, "batchSize"));

        let mut documents = Vec::new();
        if let Some(collections) = self.databases.get(db) {
            for (name, collection) in collections {
                let info = if name_only {
                    doc! { "name": name.as_str(), "type": "collection" }
                } else {
                    let mut options = Document::new();
                    if let Some(capped) = &collection.capped {
                        options.insert("capped", true);
                        if let Some(size) = capped.size {
                            options.insert("size", size as i64);
                        }
                        if let Some(max) = capped.max {
                            options.insert("max", max as i64);
                        }
                    }
                    doc! {
                        "name": name.as_str(),
                        "type": "collection",
                        "options": options,
                        "info": { "readOnly": false },
                    }
                };
                match matcher::matches(&info, &filter) {
                    Ok(true) => documents.push(info),
                    Ok(false) => {}
                    Err(e) => return server_error_reply(e),
                }
            }
        }

        self.open_buffered(Namespace::new(db, "$cmd.listCollections"), documents, batch_size)
    }

    pub fn create(&mut self, db: &str, command: &Document) -> Document {
        let Ok(coll) = command.get_str("create") else {
            return error_reply(2, "BadValue", "collection name must be a string");
        };
        let collections = self.databases.entry(db.to_string()).or_default();
        if collections.contains_key(coll) {
            return error_reply(48, "NamespaceExists", format!("Collection already exists. NS: {db}.{coll}"));
        }
        let capped = command.get_bool("capped").unwrap_or(false).then(|| Capped {
            size: get_int(command, "size").and_then(|n| usize::try_from(n).ok()),
            max: get_int(command, "max")
                .filter(|n| *n > 0)
                .and_then(|n| usize::try_from(n).ok()),
        });
        collections.insert(
            coll.to_string(),
            StoredCollection {
                entries: Vec::new(),
                capped,
            },
        );
        ok_reply()
    }

    pub fn drop_collection(&mut self, db: &str, command: &Document) -> Document {
        let Ok(coll) = command.get_str("drop") else {
            return error_reply(2, "BadValue", "collection name must be a string");
        };
        let removed = self
            .databases
            .get_mut(db)
            .and_then(|collections| collections.remove(coll));
        if removed.is_none() {
            return error_reply(26, "NamespaceNotFound", "ns not found");
        }
        self.cursors
            .retain(|_, cursor| !(cursor.namespace.db == db && cursor.namespace.coll == coll));
        doc! { "ns": format!("{db}.{coll}"), "nIndexesWas": 1, "ok": 1.0 }
    }

    pub fn drop_database(&mut self, db: &str) -> Document {
        self.databases.remove(db);
        self.cursors.retain(|_, cursor| cursor.namespace.db != db);
        doc! { "dropped": db, "ok": 1.0 }
    }
}

fn update_documents(
    collection: &mut StoredCollection,
    filter: &Document,
    update: &Document,
    multi: bool,
    upsert: bool,
    next_seq: &mut u64,
) -> Result<(i64, i64, Option<Bson>), ServerError> {
    let mut matched = 0;
    let mut modified = 0;
    for entry in collection.entries.iter_mut() {
        if !matcher::matches(&entry.document, filter)? {
            continue;
        }
        let mut updated = entry.document.clone();
        let changed = matcher::apply_update(&mut updated, update)?;
        if updated.get("_id") != entry.document.get("_id") {
            return Err((
                66,
                "ImmutableField",
                "Performing an update on the path '_id' would modify the immutable field '_id'".to_string(),
            ));
        }
        matched += 1;
        if changed {
            modified += 1;
            entry.document = updated;
        }
        if !multi {
            break;
        }
    }

    if matched > 0 || !upsert {
        return Ok((matched, modified, None));
    }

    let mut document = matcher::upsert_seed(filter)?;
    matcher::apply_update(&mut document, update)?;
    let document = with_id(document);
    let id = document.get("_id").cloned().unwrap_or(Bson::Null);
    *next_seq += 1;
    collection.push(*next_seq, document);
    Ok((0, 0, Some(id)))
}

fn run_stage(documents: Vec<Document>, stage: &Document) -> Result<Vec<Document>, ServerError> {
    let Some((name, body)) = stage.iter().next() else {
        return Err((40323, "Location40323", "A pipeline stage specification object must contain exactly one field.".to_string()));
    };
    match (name.as_str(), body) {
        ("$match", Bson::Document(filter)) => {
            let mut kept = Vec::new();
            for document in documents {
                if matcher::matches(&document, filter)? {
                    kept.push(document);
                }
            }
            Ok(kept)
        }
        ("$sort", Bson::Document(body)) => {
            let mut documents = documents;
            matcher::sort(&mut documents, body);
            Ok(documents)
        }
        ("$skip", value) => {
            let skip = as_count(value)?;
            Ok(documents.into_iter().skip(skip).collect())
        }
        ("$limit", value) => {
            let limit = as_count(value)?;
            Ok(documents.into_iter().take(limit).collect())
        }
        ("$project", Bson::Document(body)) => {
            Ok(documents.iter().map(|document| matcher::project(document, body)).collect())
        }
        (name, _) => Err((
            40324,
            "Location40324",
            format!("Unrecognized pipeline stage name: '{name}'"),
        )),
    }
}

fn as_count(value: &Bson) -> Result<usize, ServerError> {
    let n = match value {
        Bson::Int32(v) => i64::from(*v),
        Bson::Int64(v) => *v,
        Bson::Double(v) if v.fract() == 0.0 => *v as i64,
        _ => -1,
    };
    usize::try_from(n).map_err(|_| (15958, "Location15958", "the stage argument must be a non-negative number".to_string()))
}

fn apply_projection(document: &Document, projection: Option<&Document>) -> Document {
    match projection {
        Some(projection) if !projection.is_empty() => matcher::project(document, projection),
        _ => document.clone(),
    }
}

fn with_id(document: Document) -> Document {
    if document.contains_key("_id") {
        return document;
    }
    let mut with_id = doc! { "_id": ObjectId::new() };
    for (key, value) in document {
        with_id.insert(key, value);
    }
    with_id
}

fn write_error(index: usize, code: i32, message: impl Into<String>) -> Document {
    doc! { "index": index as i32, "code": code, "errmsg": message.into() }
}

fn write_reply(n: i64, modified: Option<i64>, upserted: Vec<Document>, write_errors: Vec<Document>) -> Document {
    let mut reply = doc! { "n": n as i32 };
    if let Some(modified) = modified {
        reply.insert("nModified", modified as i32);
    }
    if !upserted.is_empty() {
        reply.insert("upserted", upserted);
    }
    if !write_errors.is_empty() {
        reply.insert("writeErrors", write_errors);
    }
    reply.insert("ok", 1.0);
    reply
}
