//! Building command documents and sending them over a connection.

use crate::connection::Connection;
use crate::error::{
    MongoError, Result, CURSOR_NOT_FOUND_CODE, MAX_TIME_MS_EXPIRED_CODE,
};
use crate::session::ClientSession;
use bson::{Bson, Document};
use std::time::Duration;
use tracing::trace;

/// A command document under construction.
///
/// Keys keep insertion order. The `put_if_*` helpers skip default and unset
/// values so they never reach the wire as nulls.
#[derive(Debug, Clone, Default)]
pub(crate) struct CommandDocument {
    document: Document,
}

impl CommandDocument {
    /// Start a command: `{name: target}`.
    pub(crate) fn new(name: &str, target: impl Into<Bson>) -> Self {
        let mut document = Document::new();
        document.insert(name, target);
        Self { document }
    }

    pub(crate) fn put(mut self, key: &str, value: impl Into<Bson>) -> Self {
        self.document.insert(key, value);
        self
    }

    pub(crate) fn put_if_some<V: Into<Bson>>(mut self, key: &str, value: Option<V>) -> Self {
        if let Some(value) = value {
            self.document.insert(key, value);
        }
        self
    }

    pub(crate) fn put_if_true(mut self, key: &str, value: bool) -> Self {
        if value {
            self.document.insert(key, true);
        }
        self
    }

    pub(crate) fn put_if_nonzero<N>(mut self, key: &str, value: N) -> Self
    where
        N: Into<Bson> + Default + PartialEq,
    {
        if value != N::default() {
            self.document.insert(key, value);
        }
        self
    }

    /// Insert `value` unless it is absent or an empty document.
    pub(crate) fn put_if_not_empty(mut self, key: &str, value: Option<&Document>) -> Self {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            self.document.insert(key, value.clone());
        }
        self
    }

    /// Insert `maxTimeMS` for a nonzero duration.
    pub(crate) fn put_max_time(self, key: &str, value: Option<Duration>) -> Self {
        let millis = value.map(duration_millis).unwrap_or(0);
        self.put_if_nonzero(key, millis)
    }

    /// Apply a function that needs mutable access to the raw document.
    pub(crate) fn with(mut self, f: impl FnOnce(&mut Document)) -> Self {
        f(&mut self.document);
        self
    }

    pub(crate) fn into_document(self) -> Document {
        self.document
    }
}

pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Whether a reply reports success.
pub(crate) fn is_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    }
}

/// Read an integer field stored as any numeric type.
pub(crate) fn get_int(document: &Document, key: &str) -> Option<i64> {
    match document.get(key) {
        Some(Bson::Int32(v)) => Some(i64::from(*v)),
        Some(Bson::Int64(v)) => Some(*v),
        Some(Bson::Double(v)) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

/// Send `command` to `database` over `connection`.
///
/// Session fields are appended last: `lsid`, then `txnNumber`. The encoded
/// command is checked against the server's maximum message size before
/// anything is sent. A reply with `ok: 0` becomes the matching error.
pub(crate) async fn execute_command(
    connection: &dyn Connection,
    database: &str,
    mut command: Document,
    session: Option<&ClientSession>,
    txn_number: Option<i64>,
) -> Result<Document> {
    if let Some(session) = session {
        command.insert("lsid", session.id().clone());
    }
    if let Some(txn_number) = txn_number {
        command.insert("txnNumber", txn_number);
    }

    let description = connection.description();
    let encoded = bson::to_vec(&command)?;
    if encoded.len() > description.max_message_size {
        return Err(MongoError::Serialization(format!(
            "command of {} bytes exceeds the maximum message size of {} bytes",
            encoded.len(),
            description.max_message_size
        )));
    }

    let name = command.keys().next().cloned().unwrap_or_default();
    let cursor_id = command.get_i64("getMore").ok();
    trace!(command = %name, database, address = %description.address, "sending command");

    let reply = connection.command(database, command).await?;

    if let Some(session) = session {
        if let Ok(time) = reply.get_timestamp("operationTime") {
            session.advance_operation_time(time);
        }
    }

    if is_ok(&reply) {
        return Ok(reply);
    }
    Err(translate_error(&reply, cursor_id, connection))
}

fn translate_error(reply: &Document, cursor_id: Option<i64>, connection: &dyn Connection) -> MongoError {
    let code = get_int(reply, "code").and_then(|c| i32::try_from(c).ok()).unwrap_or(0);
    let message = reply.get_str("errmsg").unwrap_or_default().to_string();

    match (code, cursor_id) {
        (CURSOR_NOT_FOUND_CODE, Some(cursor_id)) => MongoError::CursorNotFound {
            cursor_id,
            address: connection.description().address.clone(),
        },
        (MAX_TIME_MS_EXPIRED_CODE, _) => MongoError::ExecutionTimeout { code, message },
        _ => MongoError::Command {
            code,
            code_name: reply.get_str("codeName").unwrap_or_default().to_string(),
            message,
            labels: reply
                .get_array("errorLabels")
                .map(|labels| {
                    labels
                        .iter()
                        .filter_map(|l| l.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        },
    }
}
