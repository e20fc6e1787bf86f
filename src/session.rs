//! Logical sessions.
//!
//! A session identifies a sequence of operations to the server (`lsid`),
//! hands out transaction numbers for retryable writes and remembers the
//! latest operation time for causally consistent reads.

use bson::{doc, Binary, Bson, Document, Timestamp, Uuid};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

struct SessionInner {
    id: Document,
    causally_consistent: bool,
    implicit: bool,
    txn_number: AtomicI64,
    in_transaction: AtomicBool,
    operation_time: Mutex<Option<Timestamp>>,
}

/// A client session for causal consistency and retryable writes.
///
/// Cloning a session yields another handle to the same session.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl ClientSession {
    /// Start a new session.
    pub fn new(causally_consistent: bool) -> Self {
        Self::create(causally_consistent, false)
    }

    /// A session created by the driver for a single operation.
    pub(crate) fn implicit() -> Self {
        Self::create(false, true)
    }

    fn create(causally_consistent: bool, implicit: bool) -> Self {
        let id = doc! { "id": Bson::Binary(Binary::from_uuid(Uuid::new())) };
        Self {
            inner: Arc::new(SessionInner {
                id,
                causally_consistent,
                implicit,
                txn_number: AtomicI64::new(0),
                in_transaction: AtomicBool::new(false),
                operation_time: Mutex::new(None),
            }),
        }
    }

    /// The session id sent as `lsid`.
    pub fn id(&self) -> &Document {
        &self.inner.id
    }

    /// Whether reads in this session observe earlier operations.
    pub fn is_causally_consistent(&self) -> bool {
        self.inner.causally_consistent
    }

    /// Whether the driver created this session on the caller's behalf.
    pub fn is_implicit(&self) -> bool {
        self.inner.implicit
    }

    /// Whether a transaction is active on this session.
    pub fn in_transaction(&self) -> bool {
        self.inner.in_transaction.load(Ordering::Acquire)
    }

    /// Record whether a transaction is active on this session.
    pub fn set_in_transaction(&self, active: bool) {
        self.inner.in_transaction.store(active, Ordering::Release);
    }

    /// The latest operation time seen in this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        *self.inner.operation_time.lock()
    }

    /// Advance the operation time; earlier times are ignored.
    pub fn advance_operation_time(&self, time: Timestamp) {
        let mut current = self.inner.operation_time.lock();
        let newer = match *current {
            Some(existing) => (time.time, time.increment) > (existing.time, existing.increment),
            None => true,
        };
        if newer {
            *current = Some(time);
        }
    }

    /// The most recently issued transaction number, zero if none.
    pub fn txn_number(&self) -> i64 {
        self.inner.txn_number.load(Ordering::Acquire)
    }

    /// Issue the next transaction number.
    pub(crate) fn next_txn_number(&self) -> i64 {
        self.inner.txn_number.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.inner.id)
            .field("causally_consistent", &self.inner.causally_consistent)
            .field("txn_number", &self.txn_number())
            .finish()
    }
}
