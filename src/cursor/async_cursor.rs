//! Non-blocking batch cursor.

use super::core::{CursorCore, CursorSettings};
use super::result::{Namespace, ServerCursor};
use crate::connection::{Connection, ConnectionSource, ServerAddress};
use crate::error::Result;
use crate::runtime;
use crate::session::ClientSession;
use bson::Document;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// A cursor over batches of documents driven by async tasks.
///
/// Shares its state machine with [`BatchCursor`](super::BatchCursor): for
/// the same server data both hand out the same batches in the same order.
/// Only one fetch may be in flight at a time; a second concurrent call
/// fails with an illegal-state error.
///
/// Dropping the cursor closes it.
pub struct AsyncBatchCursor<T> {
    core: Arc<CursorCore<T>>,
}

impl<T> AsyncBatchCursor<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Open a cursor from the reply of a cursor-returning command.
    pub async fn open(
        reply: &Document,
        settings: CursorSettings,
        source: Arc<dyn ConnectionSource>,
        connection: Arc<dyn Connection>,
        session: Option<ClientSession>,
    ) -> Result<Self> {
        let core = CursorCore::open(reply, settings, source, connection, session).await?;
        Ok(Self::from_core(Arc::new(core)))
    }

    pub(crate) fn from_core(core: Arc<CursorCore<T>>) -> Self {
        Self { core }
    }

    /// The next batch. `None` once exhausted.
    pub async fn next(&self) -> Result<Option<Vec<T>>> {
        self.core.next().await
    }

    /// The next batch if one is available after at most one get-more.
    pub async fn try_next(&self) -> Result<Option<Vec<T>>> {
        self.core.try_next().await
    }

    /// Fetch the next batch in the background and hand the outcome to
    /// `callback`.
    ///
    /// Never blocks the caller. `callback` runs exactly once, with `Ok(None)`
    /// when the cursor is exhausted.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let (tx, rx) = tokio::sync::oneshot::channel();
    /// cursor.next_with(move |result| {
    ///     let _ = tx.send(result);
    /// });
    /// let batch = rx.await.unwrap()?;
    /// ```
    pub fn next_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<Option<Vec<T>>>) + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        match runtime::handle() {
            Ok(handle) => {
                handle.spawn(async move {
                    let result = core.next().await;
                    callback(result);
                });
            }
            Err(e) => callback(Err(e)),
        }
    }

    /// Close the cursor, killing the server cursor if one is open.
    pub async fn close(&self) {
        if let Some(release) = self.core.close() {
            release.run().await;
        }
    }

    pub(crate) fn core(&self) -> &Arc<CursorCore<T>> {
        &self.core
    }
}

impl<T> AsyncBatchCursor<T> {
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
}

impl<T> Drop for AsyncBatchCursor<T> {
    fn drop(&mut self) {
        if let Some(release) = self.core.close() {
            release.spawn();
        }
    }
}
