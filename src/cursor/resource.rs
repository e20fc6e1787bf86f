//! Lifetime of the resources a cursor holds.
//!
//! A cursor owns one connection-source lease, one connection lease and
//! possibly a server cursor. [`ResourceManager`] serialises operations on
//! the cursor and guarantees those resources are given up exactly once:
//! on exhaustion, on reaching the limit, or on close. A close requested
//! while an operation is running is deferred until that operation ends.

use super::result::{Namespace, ServerCursor};
use crate::command::execute_command;
use crate::connection::{Connection, ConnectionSource};
use crate::error::{MongoError, Result};
use crate::runtime;
use bson::doc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub(crate) const CURSOR_CLOSED: &str = "Cursor has been closed";
pub(crate) const CONCURRENT_OPERATION: &str =
    "Another operation is currently in progress, concurrent operations are not supported";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    OperationInProgress,
    ClosePending,
    Closed,
}

struct Inner {
    state: State,
    source: Option<Arc<dyn ConnectionSource>>,
    connection: Option<Arc<dyn Connection>>,
    server_cursor: Option<ServerCursor>,
}

pub(crate) struct ResourceManager {
    namespace: Namespace,
    inner: Mutex<Inner>,
    closed: CancellationToken,
}

impl ResourceManager {
    /// Take ownership of the leases. Without a server cursor the leases are
    /// released straight away.
    pub fn new(
        namespace: Namespace,
        source: Arc<dyn ConnectionSource>,
        connection: Arc<dyn Connection>,
        server_cursor: Option<ServerCursor>,
    ) -> Self {
        let open = server_cursor.is_some();
        Self {
            namespace,
            inner: Mutex::new(Inner {
                state: State::Idle,
                source: open.then_some(source),
                connection: open.then_some(connection),
                server_cursor,
            }),
            closed: CancellationToken::new(),
        }
    }

    /// Begin an operation, failing if the cursor is closed or busy.
    pub fn try_start_operation(&self) -> Result<OperationGuard<'_>> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Idle => {
                inner.state = State::OperationInProgress;
                Ok(OperationGuard {
                    manager: self,
                    ended: false,
                })
            }
            State::OperationInProgress => Err(MongoError::illegal_state(CONCURRENT_OPERATION)),
            State::ClosePending | State::Closed => Err(MongoError::illegal_state(CURSOR_CLOSED)),
        }
    }

    fn end_operation(&self) -> Option<Release> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::OperationInProgress => {
                inner.state = State::Idle;
                None
            }
            State::ClosePending => {
                inner.state = State::Closed;
                Some(self.take(&mut inner))
            }
            State::Idle | State::Closed => None,
        }
    }

    /// Close the cursor.
    ///
    /// Returns the resources to release when the cursor was idle. While an
    /// operation is running the close is deferred and the operation is
    /// signalled to stop.
    pub fn close(&self) -> Option<Release> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Idle => {
                inner.state = State::Closed;
                self.closed.cancel();
                Some(self.take(&mut inner))
            }
            State::OperationInProgress => {
                inner.state = State::ClosePending;
                self.closed.cancel();
                None
            }
            State::ClosePending | State::Closed => None,
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.lock().state, State::ClosePending | State::Closed)
    }

    /// Cancelled once `close` has been called.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn server_cursor(&self) -> Option<ServerCursor> {
        self.inner.lock().server_cursor.clone()
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.inner.lock().connection.clone()
    }

    /// Record the server cursor after a reply. When the server has closed the
    /// cursor the leases are released.
    pub fn set_server_cursor(&self, server_cursor: Option<ServerCursor>) {
        let mut inner = self.inner.lock();
        if server_cursor.is_none() {
            let source = inner.source.take();
            let connection = inner.connection.take();
            if source.is_some() || connection.is_some() {
                trace!(namespace = %self.namespace, "released cursor resources");
            }
        }
        inner.server_cursor = server_cursor;
    }

    /// Give up the server cursor and the leases without closing the cursor.
    pub fn release_all(&self) -> Release {
        let mut inner = self.inner.lock();
        self.take(&mut inner)
    }

    fn take(&self, inner: &mut Inner) -> Release {
        Release {
            namespace: self.namespace.clone(),
            server_cursor: inner.server_cursor.take(),
            connection: inner.connection.take(),
            source: inner.source.take(),
        }
    }
}

/// Marks an operation in progress; ends it when dropped.
///
/// A guard dropped without [`OperationGuard::end`] (a cancelled future)
/// still ends the operation and releases resources in the background when a
/// close was requested meanwhile.
pub(crate) struct OperationGuard<'a> {
    manager: &'a ResourceManager,
    ended: bool,
}

impl OperationGuard<'_> {
    /// End the operation, running a deferred close if one was requested.
    ///
    /// Returns `true` when the cursor was closed during the operation.
    pub async fn end(mut self) -> bool {
        self.ended = true;
        match self.manager.end_operation() {
            Some(release) => {
                release.run().await;
                true
            }
            None => false,
        }
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if !self.ended {
            if let Some(release) = self.manager.end_operation() {
                release.spawn();
            }
        }
    }
}

/// Resources taken from a cursor, to be given back.
#[must_use]
pub(crate) struct Release {
    namespace: Namespace,
    server_cursor: Option<ServerCursor>,
    connection: Option<Arc<dyn Connection>>,
    source: Option<Arc<dyn ConnectionSource>>,
}

impl Release {
    /// Kill the server cursor, ignoring failures, then drop the leases.
    pub async fn run(self) {
        let Release {
            namespace,
            server_cursor,
            connection,
            source,
        } = self;

        if let (Some(cursor), Some(connection)) = (server_cursor, connection.as_ref()) {
            debug!(cursor_id = cursor.id, address = %cursor.address, "killing cursor");
            let command = doc! { "killCursors": namespace.coll.as_str(), "cursors": [cursor.id] };
            if let Err(e) = execute_command(connection.as_ref(), &namespace.db, command, None, None).await {
                debug!(cursor_id = cursor.id, error = %e, "ignoring killCursors failure");
            }
        }

        if connection.is_some() || source.is_some() {
            trace!(namespace = %namespace, "released cursor resources");
        }
        drop(connection);
        drop(source);
    }

    /// Run [`Release::run`] in the background.
    pub fn spawn(self) {
        if self.server_cursor.is_none() {
            // Nothing to send; drop the leases here.
            drop(self);
            return;
        }
        runtime::spawn(self.run());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDeployment;
    use crate::connection::Binding;

    async fn leases(deployment: &MemoryDeployment) -> (Arc<dyn ConnectionSource>, Arc<dyn Connection>) {
        let source = deployment.connection_source().await.unwrap();
        let connection = source.connection().await.unwrap();
        (source, connection)
    }

    #[tokio::test]
    async fn test_no_server_cursor_releases_immediately() {
        let deployment = MemoryDeployment::new();
        let (source, connection) = leases(&deployment).await;

        let manager = ResourceManager::new(
            Namespace::new("db", "coll"),
            source.clone(),
            connection.clone(),
            None,
        );

        assert!(manager.connection().is_none());
        assert_eq!(Arc::strong_count(&source), 1);
        assert_eq!(Arc::strong_count(&connection), 1);
    }

    #[tokio::test]
    async fn test_concurrent_operation_rejected() {
        let deployment = MemoryDeployment::new();
        let (source, connection) = leases(&deployment).await;
        let manager = ResourceManager::new(
            Namespace::new("db", "coll"),
            source,
            connection,
            Some(ServerCursor::new(1, Default::default())),
        );

        let guard = manager.try_start_operation().unwrap();
        let err = manager.try_start_operation().err().unwrap();
        assert_eq!(err.to_string(), format!("illegal state: {CONCURRENT_OPERATION}"));
        assert!(!guard.end().await);
        assert!(manager.try_start_operation().is_ok());
    }

    #[tokio::test]
    async fn test_close_during_operation_is_deferred() {
        let deployment = MemoryDeployment::new();
        let (source, connection) = leases(&deployment).await;
        let manager = ResourceManager::new(
            Namespace::new("db", "coll"),
            source.clone(),
            connection.clone(),
            Some(ServerCursor::new(1, Default::default())),
        );

        let guard = manager.try_start_operation().unwrap();
        assert!(manager.close().is_none());
        assert!(manager.closed().is_cancelled());
        assert!(manager.is_closed());
        assert_eq!(Arc::strong_count(&connection), 2);

        assert!(guard.end().await);
        assert_eq!(Arc::strong_count(&connection), 1);
        assert_eq!(Arc::strong_count(&source), 1);

        let err = manager.try_start_operation().err().unwrap();
        assert_eq!(err.to_string(), format!("illegal state: {CURSOR_CLOSED}"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let deployment = MemoryDeployment::new();
        let (source, connection) = leases(&deployment).await;
        let manager = ResourceManager::new(
            Namespace::new("db", "coll"),
            source,
            connection,
            Some(ServerCursor::new(1, Default::default())),
        );

        let release = manager.close().unwrap();
        release.run().await;
        assert!(manager.close().is_none());
        assert!(manager.server_cursor().is_none());
    }
}
