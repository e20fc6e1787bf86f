//! Server cursor handles and cursor reply decoding.

use crate::command::get_int;
use crate::connection::ServerAddress;
use crate::error::{MongoError, Result};
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name.
    pub db: String,
    /// Collection name.
    pub coll: String,
}

impl Namespace {
    /// Create a namespace.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse `db.collection`; the collection part may itself contain dots.
    pub fn parse(full_name: &str) -> Result<Self> {
        match full_name.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(MongoError::invalid_argument(format!(
                "invalid namespace: {full_name}"
            ))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// A cursor the server is holding open for us.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerCursor {
    /// The nonzero cursor id.
    pub id: i64,
    /// The server holding the cursor.
    pub address: ServerAddress,
}

impl ServerCursor {
    /// Create a handle.
    pub fn new(id: i64, address: ServerAddress) -> Self {
        Self { id, address }
    }
}

/// One decoded cursor reply.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CursorReply {
    /// Cursor id; zero when the server closed the cursor.
    pub id: i64,
    /// Namespace reported by the server, if any.
    pub namespace: Option<Namespace>,
    /// The documents of this batch.
    pub batch: Vec<Document>,
}

impl CursorReply {
    /// Decode either `{cursor: {id, ns, firstBatch | nextBatch}}` or the
    /// legacy `{documents, cursorId, startingFrom}` shape.
    pub fn parse(reply: &Document) -> Result<Self> {
        if let Ok(cursor) = reply.get_document("cursor") {
            let id = get_int(cursor, "id")
                .ok_or_else(|| MongoError::Deserialization("cursor reply has no id".into()))?;
            let batch = cursor
                .get_array("firstBatch")
                .or_else(|_| cursor.get_array("nextBatch"))
                .map_err(|_| MongoError::Deserialization("cursor reply has no batch".into()))?;
            let namespace = match cursor.get_str("ns") {
                Ok(ns) => Some(Namespace::parse(ns)?),
                Err(_) => None,
            };
            return Ok(Self {
                id,
                namespace,
                batch: documents(batch)?,
            });
        }

        if let Ok(batch) = reply.get_array("documents") {
            return Ok(Self {
                id: get_int(reply, "cursorId").unwrap_or(0),
                namespace: None,
                batch: documents(batch)?,
            });
        }

        Err(MongoError::Deserialization(
            "reply does not contain a cursor".into(),
        ))
    }
}

fn documents(batch: &[Bson]) -> Result<Vec<Document>> {
    batch
        .iter()
        .map(|value| match value {
            Bson::Document(doc) => Ok(doc.clone()),
            other => Err(MongoError::Deserialization(format!(
                "expected a document in batch, found {other}"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_command_reply() {
        let reply = doc! {
            "ok": 1,
            "cursor": { "id": 12_i64, "ns": "db.coll", "firstBatch": [{ "_id": 1 }, { "_id": 2 }] }
        };
        let parsed = CursorReply::parse(&reply).unwrap();
        assert_eq!(parsed.id, 12);
        assert_eq!(parsed.namespace, Some(Namespace::new("db", "coll")));
        assert_eq!(parsed.batch, vec![doc! { "_id": 1 }, doc! { "_id": 2 }]);
    }

    #[test]
    fn test_parse_get_more_reply() {
        let reply = doc! { "ok": 1, "cursor": { "id": 0_i64, "nextBatch": [] } };
        let parsed = CursorReply::parse(&reply).unwrap();
        assert_eq!(parsed.id, 0);
        assert!(parsed.batch.is_empty());
        assert!(parsed.namespace.is_none());
    }

    #[test]
    fn test_both_shapes_decode_alike() {
        let modern = doc! { "cursor": { "id": 7_i64, "firstBatch": [{ "x": 1 }] } };
        let legacy = doc! { "documents": [{ "x": 1 }], "cursorId": 7_i64, "startingFrom": 0 };
        assert_eq!(
            CursorReply::parse(&modern).unwrap(),
            CursorReply::parse(&legacy).unwrap()
        );
    }

    #[test]
    fn test_reply_without_cursor() {
        let err = CursorReply::parse(&doc! { "ok": 1, "n": 3 }).unwrap_err();
        assert!(matches!(err, MongoError::Deserialization(_)));
    }

    #[test]
    fn test_namespace_parse() {
        let ns = Namespace::parse("db.$cmd.listCollections").unwrap();
        assert_eq!(ns.db, "db");
        assert_eq!(ns.coll, "$cmd.listCollections");
        assert_eq!(ns.to_string(), "db.$cmd.listCollections");
        assert!(Namespace::parse("nodot").is_err());
    }
}
