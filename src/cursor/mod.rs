//! Cursors over query results.
//!
//! [`BatchCursor`] and [`AsyncBatchCursor`] hand out whole batches and share
//! one state machine. [`Cursor`] sits on top of the async one and yields one
//! document at a time.

mod async_cursor;
mod blocking;
mod core;
mod resource;
mod result;

pub use self::async_cursor::AsyncBatchCursor;
pub use self::blocking::{BatchCursor, InterruptHandle};
pub use self::core::CursorSettings;
pub use self::result::{Namespace, ServerCursor};

pub(crate) use self::core::CursorCore;

use self::resource::CURSOR_CLOSED;

use crate::error::{MongoError, Result};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A cursor yielding one document at a time.
///
/// Cursors implement `Stream` and can be used with async iteration.
///
/// # Example
///
/// ```ignore
/// use futures::StreamExt;
///
/// let mut cursor = collection.find(doc! { "status": "active" }).await?;
/// while let Some(doc) = cursor.next().await {
///     println!("{:?}", doc?);
/// }
/// ```
pub struct Cursor<T> {
    batches: AsyncBatchCursor<T>,
    buffer: VecDeque<T>,
    current: Option<T>,
    pending: Option<BoxFuture<'static, Result<Option<Vec<T>>>>>,
    exhausted: bool,
}

impl<T> Cursor<T>
where
    T: DeserializeOwned + Send + Unpin + 'static,
{
    /// Wrap a batch cursor.
    pub fn new(batches: AsyncBatchCursor<T>) -> Self {
        Self {
            batches,
            buffer: VecDeque::new(),
            current: None,
            pending: None,
            exhausted: false,
        }
    }

    /// Check if the cursor is exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }

    /// Get the server cursor id, if the server still holds the cursor.
    pub fn cursor_id(&self) -> Option<i64> {
        self.batches
            .get_server_cursor()
            .ok()
            .flatten()
            .map(|cursor| cursor.id)
    }

    /// The underlying batch cursor.
    pub fn batches(&self) -> &AsyncBatchCursor<T> {
        &self.batches
    }

    async fn fill_buffer(&mut self) -> Result<bool> {
        if self.batches.is_closed() {
            return Err(MongoError::illegal_state(CURSOR_CLOSED));
        }
        while self.buffer.is_empty() {
            if self.exhausted {
                return Ok(false);
            }
            match self.batches.next().await? {
                Some(batch) => self.buffer.extend(batch),
                None => self.exhausted = true,
            }
        }
        Ok(true)
    }

    /// Advance the cursor to the next document; `false` once exhausted.
    pub async fn advance(&mut self) -> Result<bool> {
        if !self.fill_buffer().await? {
            self.current = None;
            return Ok(false);
        }
        self.current = self.buffer.pop_front();
        Ok(self.current.is_some())
    }

    /// The document the last [`advance`](Cursor::advance) moved to.
    pub fn current(&self) -> Result<&T> {
        self.current
            .as_ref()
            .ok_or_else(|| MongoError::illegal_state("no current document; call advance first"))
    }

    /// Try to get the next document.
    pub async fn try_next(&mut self) -> Result<Option<T>> {
        if !self.fill_buffer().await? {
            return Ok(None);
        }
        Ok(self.buffer.pop_front())
    }

    /// Collect all documents into a vector.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut results = Vec::new();
        while let Some(doc) = self.try_next().await? {
            results.push(doc);
        }
        Ok(results)
    }

    /// Close the cursor. Later calls fail.
    pub async fn close(&mut self) {
        self.pending = None;
        self.buffer.clear();
        self.current = None;
        self.batches.close().await;
    }
}

impl<T> Stream for Cursor<T>
where
    T: DeserializeOwned + Send + Unpin + 'static,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.batches.is_closed() {
            return Poll::Ready(Some(Err(MongoError::illegal_state(CURSOR_CLOSED))));
        }

        loop {
            if let Some(doc) = this.buffer.pop_front() {
                return Poll::Ready(Some(Ok(doc)));
            }
            if this.exhausted {
                return Poll::Ready(None);
            }

            if this.pending.is_none() {
                let core = this.batches.core().clone();
                this.pending = Some(async move { core.next().await }.boxed());
            }
            let Some(pending) = this.pending.as_mut() else {
                return Poll::Ready(None);
            };

            match pending.poll_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => {
                    this.pending = None;
                    match result {
                        Ok(Some(batch)) => this.buffer.extend(batch),
                        Ok(None) => this.exhausted = true,
                        Err(e) => return Poll::Ready(Some(Err(e))),
                    }
                }
            }
        }
    }
}
