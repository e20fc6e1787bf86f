//! Read and write concerns, and how they are stamped onto commands.

use crate::error::{MongoError, Result};
use crate::session::ClientSession;
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

/// Isolation level requested for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadConcernLevel {
    /// Return the node's most recent data.
    Local,
    /// Return data acknowledged by a majority of the replica set.
    Majority,
    /// Return data reflecting all majority-acknowledged writes before the read.
    Linearizable,
    /// Return data with no guarantee it was written to a majority.
    Available,
    /// Read from a snapshot of majority-committed data.
    Snapshot,
}

impl ReadConcernLevel {
    /// The level's wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadConcernLevel::Local => "local",
            ReadConcernLevel::Majority => "majority",
            ReadConcernLevel::Linearizable => "linearizable",
            ReadConcernLevel::Available => "available",
            ReadConcernLevel::Snapshot => "snapshot",
        }
    }

    /// Parse a wire name.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "local" => Ok(ReadConcernLevel::Local),
            "majority" => Ok(ReadConcernLevel::Majority),
            "linearizable" => Ok(ReadConcernLevel::Linearizable),
            "available" => Ok(ReadConcernLevel::Available),
            "snapshot" => Ok(ReadConcernLevel::Snapshot),
            other => Err(MongoError::invalid_argument(format!(
                "unknown read concern level: {other}"
            ))),
        }
    }
}

/// Read concern of an operation. The default leaves the level to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadConcern {
    /// Requested level, `None` for the server default.
    pub level: Option<ReadConcernLevel>,
}

impl ReadConcern {
    /// Read concern with the given level.
    pub fn new(level: ReadConcernLevel) -> Self {
        Self { level: Some(level) }
    }

    /// Majority read concern.
    pub fn majority() -> Self {
        Self::new(ReadConcernLevel::Majority)
    }

    /// Whether this leaves the level to the server.
    pub fn is_server_default(&self) -> bool {
        self.level.is_none()
    }
}

/// Requested acknowledgement of a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Acknowledgment {
    /// Acknowledged by this many nodes; zero means unacknowledged.
    Nodes(u32),
    /// A named mode such as `majority` or a tag set name.
    Custom(String),
}

impl Acknowledgment {
    /// Acknowledged by a majority of the replica set.
    pub fn majority() -> Self {
        Acknowledgment::Custom("majority".to_string())
    }

    fn parse(value: &str) -> Self {
        match value.parse::<u32>() {
            Ok(n) => Acknowledgment::Nodes(n),
            Err(_) => Acknowledgment::Custom(value.to_string()),
        }
    }

    fn to_bson(&self) -> Bson {
        match self {
            Acknowledgment::Nodes(n) => Bson::Int32(i32::try_from(*n).unwrap_or(i32::MAX)),
            Acknowledgment::Custom(s) => Bson::String(s.clone()),
        }
    }
}

impl From<&str> for Acknowledgment {
    fn from(value: &str) -> Self {
        Acknowledgment::parse(value)
    }
}

/// Write concern of an operation. The default leaves everything to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConcern {
    /// Requested acknowledgement.
    pub w: Option<Acknowledgment>,
    /// Whether to wait for the journal commit.
    pub journal: Option<bool>,
    /// How long to wait for acknowledgement, in milliseconds.
    pub w_timeout_ms: Option<u64>,
}

impl WriteConcern {
    /// Unacknowledged writes (`w: 0`).
    pub fn unacknowledged() -> Self {
        Self {
            w: Some(Acknowledgment::Nodes(0)),
            ..Default::default()
        }
    }

    /// Majority-acknowledged writes.
    pub fn majority() -> Self {
        Self {
            w: Some(Acknowledgment::majority()),
            ..Default::default()
        }
    }

    /// Whether nothing is set.
    pub fn is_server_default(&self) -> bool {
        self.w.is_none() && self.journal.is_none() && self.w_timeout_ms.is_none()
    }

    /// Whether the server will report the outcome of the write.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    /// The `writeConcern` document sent on the wire.
    pub fn to_document(&self) -> Document {
        let mut document = Document::new();
        if let Some(ref w) = self.w {
            document.insert("w", w.to_bson());
        }
        if let Some(journal) = self.journal {
            document.insert("j", journal);
        }
        if let Some(timeout) = self.w_timeout_ms {
            document.insert("wtimeout", i64::try_from(timeout).unwrap_or(i64::MAX));
        }
        document
    }
}

/// Append `readConcern` to `command` when it carries information.
///
/// Inside an active transaction nothing is appended. `afterClusterTime` is
/// only added for causally consistent sessions that have observed an
/// operation time.
pub(crate) fn append_read_concern(
    command: &mut Document,
    read_concern: &ReadConcern,
    session: Option<&ClientSession>,
) {
    if session.is_some_and(|s| s.in_transaction()) {
        return;
    }

    let mut document = Document::new();
    if let Some(level) = read_concern.level {
        document.insert("level", level.as_str());
    }
    if let Some(operation_time) = session
        .filter(|s| s.is_causally_consistent())
        .and_then(|s| s.operation_time())
    {
        document.insert("afterClusterTime", operation_time);
    }

    if !document.is_empty() {
        command.insert("readConcern", document);
    }
}

/// Append `writeConcern` to `command` unless it is the server default or a
/// transaction is active.
pub(crate) fn append_write_concern(
    command: &mut Document,
    write_concern: &WriteConcern,
    session: Option<&ClientSession>,
) {
    if write_concern.is_server_default() || session.is_some_and(|s| s.in_transaction()) {
        return;
    }
    command.insert("writeConcern", write_concern.to_document());
}
