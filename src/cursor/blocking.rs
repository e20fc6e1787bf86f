//! Blocking batch cursor.

use super::core::{CursorCore, CursorSettings};
use super::result::{Namespace, ServerCursor};
use crate::connection::{Connection, ConnectionSource, ServerAddress};
use crate::error::{MongoError, Result};
use crate::runtime;
use crate::session::ClientSession;
use bson::Document;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Interrupts blocking calls on a [`BatchCursor`] from another thread.
///
/// An interrupt makes the call in progress (or, if none is, the next call)
/// fail with [`MongoError::Interrupted`]. The cursor stays usable.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl InterruptHandle {
    /// Interrupt the cursor.
    pub fn interrupt(&self) {
        self.token.lock().cancel();
    }

    fn current(&self) -> CancellationToken {
        self.token.lock().clone()
    }

    fn reset(&self) {
        let mut token = self.token.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }
}

/// A cursor over batches of documents whose calls block the calling thread.
///
/// Each call to [`next`](BatchCursor::next) hands out one whole batch, in the
/// order the server produced them. The cursor may be shared across threads;
/// closing it from one thread makes a call blocked in another fail with an
/// illegal-state error.
///
/// Dropping the cursor closes it.
///
/// # Example
///
/// ```ignore
/// let cursor = FindOperation::<Document>::new(namespace)
///     .batch_size(2)
///     .execute_blocking(&binding, None)?;
///
/// while let Some(batch) = cursor.next()? {
///     println!("{} documents", batch.len());
/// }
/// ```
pub struct BatchCursor<T> {
    core: Arc<CursorCore<T>>,
    interrupt: InterruptHandle,
}

impl<T> std::fmt::Debug for BatchCursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCursor")
            .field("interrupt", &self.interrupt)
            .finish_non_exhaustive()
    }
}

impl<T> BatchCursor<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Open a cursor from the reply of a cursor-returning command.
    ///
    /// The cursor takes ownership of `source` and `connection` and gives them
    /// back when it is exhausted or closed.
    pub fn new(
        reply: &Document,
        settings: CursorSettings,
        source: Arc<dyn ConnectionSource>,
        connection: Arc<dyn Connection>,
        session: Option<ClientSession>,
    ) -> Result<Self> {
        let core = runtime::block_on(CursorCore::open(reply, settings, source, connection, session))??;
        Ok(Self::from_core(Arc::new(core)))
    }

    pub(crate) fn from_core(core: Arc<CursorCore<T>>) -> Self {
        Self {
            core,
            interrupt: InterruptHandle::default(),
        }
    }

    fn block<R>(&self, operation: impl Future<Output = Result<R>>) -> Result<R> {
        let token = self.interrupt.current();
        let outcome = runtime::block_on(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(MongoError::Interrupted),
                result = operation => result,
            }
        })?;
        if matches!(outcome, Err(MongoError::Interrupted)) {
            self.interrupt.reset();
        }
        outcome
    }

    /// Whether another batch is available, blocking until that is known.
    pub fn has_next(&self) -> Result<bool> {
        self.block(self.core.has_next())
    }

    /// The next batch, blocking until it arrives. `None` once exhausted.
    pub fn next(&self) -> Result<Option<Vec<T>>> {
        self.block(self.core.next())
    }

    /// The next batch if one is available after at most one get-more.
    ///
    /// `None` means either that a tailable cursor has no data right now (the
    /// server cursor stays open) or that the cursor is exhausted.
    pub fn try_next(&self) -> Result<Option<Vec<T>>> {
        self.block(self.core.try_next())
    }

    /// Change the size of subsequent batches.
    pub fn set_batch_size(&self, batch_size: i32) -> Result<()> {
        self.core.set_batch_size(batch_size)
    }

    /// The batch size used for the next get-more.
    pub fn batch_size(&self) -> i32 {
        self.core.batch_size()
    }

    /// Number of documents already fetched and not yet returned.
    pub fn available(&self) -> usize {
        self.core.available()
    }

    /// The server cursor, `None` once the server has closed it.
    pub fn get_server_cursor(&self) -> Result<Option<ServerCursor>> {
        self.core.server_cursor()
    }

    /// The server the cursor was opened on.
    pub fn server_address(&self) -> &ServerAddress {
        self.core.address()
    }

    /// The namespace the cursor iterates.
    pub fn namespace(&self) -> &Namespace {
        self.core.namespace()
    }

    /// Whether the cursor was closed.
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// A handle that interrupts blocking calls on this cursor.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Close the cursor, killing the server cursor if one is open.
    ///
    /// Closing twice is a no-op. A close while another thread is blocked in
    /// this cursor completes once that call unwinds.
    pub fn close(&self) {
        let Some(release) = self.core.close() else {
            return;
        };
        if runtime::in_async_context() {
            release.spawn();
        } else if let Err(e) = runtime::block_on(release.run()) {
            tracing::warn!(error = %e, "failed to release cursor resources");
        }
    }
}

impl<T> Drop for BatchCursor<T> {
    fn drop(&mut self) {
        if let Some(release) = self.core.close() {
            release.spawn();
        }
    }
}
