//! The batch buffer shared by [`BatchCursor`](super::BatchCursor) and
//! [`AsyncBatchCursor`](super::AsyncBatchCursor).

use super::resource::{Release, ResourceManager, CURSOR_CLOSED};
use super::result::{CursorReply, Namespace, ServerCursor};
use crate::command::{execute_command, CommandDocument};
use crate::connection::{Connection, ConnectionSource, ServerAddress};
use crate::error::{MongoError, Result};
use crate::session::ClientSession;
use bson::{Bson, Document};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Everything a cursor needs besides the reply that opened it.
#[derive(Debug, Clone)]
pub struct CursorSettings {
    /// Namespace used when the reply does not report one.
    pub namespace: Namespace,
    /// Requested batch size; negative means a single batch.
    pub batch_size: i32,
    /// Maximum number of documents; negative means a single batch.
    pub limit: i32,
    /// `maxTimeMS` sent with each get-more of a tailable await cursor.
    pub max_await_time: Option<Duration>,
    /// Comment sent with each get-more.
    pub comment: Option<Bson>,
}

impl CursorSettings {
    /// Settings with no limit and the server's default batch size.
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            batch_size: 0,
            limit: 0,
            max_await_time: None,
            comment: None,
        }
    }

    /// Set the batch size.
    pub fn batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the limit.
    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = limit;
        self
    }

    /// Set the await time for get-more on tailable await cursors.
    pub fn max_await_time(mut self, max_await_time: Option<Duration>) -> Self {
        self.max_await_time = max_await_time;
        self
    }

    /// Set the comment.
    pub fn comment(mut self, comment: Option<Bson>) -> Self {
        self.comment = comment;
        self
    }
}

/// Whether `count` documents exhaust `limit`.
pub(crate) fn limit_reached(limit: i32, count: i64) -> bool {
    let limit = i64::from(limit).abs();
    limit != 0 && count >= limit
}

/// Size to request in the next get-more: what is left of the limit, capped
/// by the batch size.
pub(crate) fn number_to_return(limit: i32, batch_size: i32, count: i64) -> i32 {
    let limit = i64::from(limit).abs();
    if limit == 0 {
        return batch_size;
    }
    let remaining = (limit - count).max(0);
    if batch_size != 0 && remaining > i64::from(batch_size).abs() {
        batch_size
    } else {
        i32::try_from(remaining).unwrap_or(i32::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    /// Keep fetching until a non-empty batch arrives or the cursor ends.
    Blocking,
    /// Fetch at most once.
    Try,
}

struct BatchState<T> {
    next_batch: Option<Vec<T>>,
    count: i64,
    batch_size: i32,
}

pub(crate) struct CursorCore<T> {
    namespace: Namespace,
    address: ServerAddress,
    limit: i32,
    single_batch: bool,
    max_await_time: Option<Duration>,
    comment: Option<Bson>,
    session: Option<ClientSession>,
    resources: ResourceManager,
    state: Mutex<BatchState<T>>,
}

impl<T> CursorCore<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Build the cursor around the reply of the command that opened it,
    /// taking ownership of the leases used to run that command.
    pub async fn open(
        reply: &Document,
        settings: CursorSettings,
        source: Arc<dyn ConnectionSource>,
        connection: Arc<dyn Connection>,
        session: Option<ClientSession>,
    ) -> Result<Self> {
        let parsed = CursorReply::parse(reply)?;
        let namespace = parsed.namespace.unwrap_or(settings.namespace);
        let address = connection.description().address.clone();
        let server_cursor = (parsed.id != 0).then(|| ServerCursor::new(parsed.id, address.clone()));

        let core = Self {
            resources: ResourceManager::new(namespace.clone(), source, connection, server_cursor),
            namespace,
            address,
            limit: settings.limit,
            single_batch: settings.limit < 0 || settings.batch_size < 0,
            max_await_time: settings.max_await_time,
            comment: settings.comment,
            session,
            state: Mutex::new(BatchState {
                next_batch: None,
                count: 0,
                batch_size: settings.batch_size,
            }),
        };

        let batch = match decode::<T>(parsed.batch) {
            Ok(batch) => batch,
            Err(e) => {
                core.resources.release_all().run().await;
                return Err(e);
            }
        };
        core.accept_batch(parsed.id, batch);

        if core.single_batch || core.limit_reached() {
            core.resources.release_all().run().await;
        }
        Ok(core)
    }

    fn accept_batch(&self, cursor_id: i64, batch: Vec<T>) {
        debug!(
            cursor_id,
            size = batch.len(),
            address = %self.address,
            namespace = %self.namespace,
            "received batch"
        );
        let mut state = self.state.lock();
        state.count += batch.len() as i64;
        state.next_batch = Some(batch);
    }

    fn limit_reached(&self) -> bool {
        limit_reached(self.limit, self.state.lock().count)
    }

    fn has_buffered(&self) -> bool {
        self.state
            .lock()
            .next_batch
            .as_ref()
            .is_some_and(|batch| !batch.is_empty())
    }

    fn take_batch(&self) -> Option<Vec<T>> {
        self.state.lock().next_batch.take().filter(|batch| !batch.is_empty())
    }

    async fn fill(&self, mode: FetchMode) -> Result<bool> {
        loop {
            if self.has_buffered() {
                return Ok(true);
            }
            if self.limit_reached() {
                return Ok(false);
            }
            let Some(server_cursor) = self.resources.server_cursor() else {
                return Ok(false);
            };
            self.get_more(server_cursor).await?;
            if mode == FetchMode::Try {
                return Ok(self.has_buffered());
            }
        }
    }

    async fn get_more(&self, server_cursor: ServerCursor) -> Result<()> {
        let connection = self
            .resources
            .connection()
            .ok_or_else(|| MongoError::illegal_state(CURSOR_CLOSED))?;

        let (batch_size, count) = {
            let state = self.state.lock();
            (state.batch_size, state.count)
        };
        let request = number_to_return(self.limit, batch_size, count).saturating_abs();
        let command = CommandDocument::new("getMore", server_cursor.id)
            .put("collection", self.namespace.coll.as_str())
            .put_if_nonzero("batchSize", request)
            .put_max_time("maxTimeMS", self.max_await_time)
            .put_if_some("comment", self.comment.clone())
            .into_document();

        debug!(cursor_id = server_cursor.id, batch_size = request, address = %server_cursor.address, "sending getMore");
        let reply = execute_command(
            connection.as_ref(),
            &self.namespace.db,
            command,
            self.session.as_ref(),
            None,
        )
        .await;
        drop(connection);

        let reply = match reply {
            Ok(reply) => reply,
            Err(e @ MongoError::CursorNotFound { .. }) => {
                self.resources.set_server_cursor(None);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let parsed = CursorReply::parse(&reply)?;
        if parsed.id == 0 {
            self.resources.set_server_cursor(None);
        } else if parsed.id != server_cursor.id {
            self.resources
                .set_server_cursor(Some(ServerCursor::new(parsed.id, server_cursor.address)));
        }

        // The server counted these documents against the limit even when
        // they fail to decode.
        let received = parsed.batch.len() as i64;
        let outcome = match decode::<T>(parsed.batch) {
            Ok(batch) => {
                self.accept_batch(parsed.id, batch);
                Ok(())
            }
            Err(e) => {
                self.state.lock().count += received;
                Err(e)
            }
        };

        if self.limit_reached() {
            self.resources.release_all().run().await;
        }
        outcome
    }

    /// Run `operation` as the cursor's single in-flight operation. A close
    /// from elsewhere interrupts it.
    async fn run<R>(&self, operation: impl Future<Output = Result<R>>) -> Result<R> {
        let guard = self.resources.try_start_operation()?;
        let result = tokio::select! {
            biased;
            _ = self.resources.closed().cancelled() => Err(MongoError::illegal_state(CURSOR_CLOSED)),
            result = operation => result,
        };
        if guard.end().await {
            return Err(MongoError::illegal_state(CURSOR_CLOSED));
        }
        result
    }

    /// Whether another batch is available, fetching it if needed.
    pub async fn has_next(&self) -> Result<bool> {
        self.run(self.fill(FetchMode::Blocking)).await
    }

    /// The next batch, fetching until one arrives. `None` once exhausted.
    pub async fn next(&self) -> Result<Option<Vec<T>>> {
        self.run(async {
            if self.fill(FetchMode::Blocking).await? {
                Ok(self.take_batch())
            } else {
                Ok(None)
            }
        })
        .await
    }

    /// The next batch if one is buffered or a single get-more returns one.
    pub async fn try_next(&self) -> Result<Option<Vec<T>>> {
        self.run(async {
            if self.fill(FetchMode::Try).await? {
                Ok(self.take_batch())
            } else {
                Ok(None)
            }
        })
        .await
    }
}

impl<T> CursorCore<T> {
    pub fn set_batch_size(&self, batch_size: i32) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().batch_size = batch_size;
        Ok(())
    }

    pub fn batch_size(&self) -> i32 {
        self.state.lock().batch_size
    }

    /// Documents buffered and not yet handed out.
    pub fn available(&self) -> usize {
        if self.resources.is_closed() {
            return 0;
        }
        self.state.lock().next_batch.as_ref().map_or(0, Vec::len)
    }

    pub fn server_cursor(&self) -> Result<Option<ServerCursor>> {
        self.ensure_open()?;
        Ok(self.resources.server_cursor())
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn is_closed(&self) -> bool {
        self.resources.is_closed()
    }

    /// Close the cursor. The returned resources still have to be released.
    pub fn close(&self) -> Option<Release> {
        let release = self.resources.close();
        self.state.lock().next_batch = None;
        release
    }

    fn ensure_open(&self) -> Result<()> {
        if self.resources.is_closed() {
            return Err(MongoError::illegal_state(CURSOR_CLOSED));
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(batch: Vec<Document>) -> Result<Vec<T>> {
    batch
        .into_iter()
        .map(|document| bson::from_document(document).map_err(MongoError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0, 0, 0)]
    #[case(0, 2, 4, 2)]
    #[case(0, -3, 0, -3)]
    #[case(5, 2, 2, 2)]
    #[case(5, 2, 4, 1)]
    #[case(5, 0, 2, 3)]
    #[case(-5, 2, 0, 2)]
    #[case(5, -10, 1, 4)]
    #[case(3, 2, 3, 0)]
    fn test_number_to_return(
        #[case] limit: i32,
        #[case] batch_size: i32,
        #[case] count: i64,
        #[case] expected: i32,
    ) {
        assert_eq!(number_to_return(limit, batch_size, count), expected);
    }

    #[rstest]
    #[case(0, 1_000, false)]
    #[case(5, 4, false)]
    #[case(5, 5, true)]
    #[case(-5, 5, true)]
    #[case(-5, 6, true)]
    fn test_limit_reached(#[case] limit: i32, #[case] count: i64, #[case] expected: bool) {
        assert_eq!(limit_reached(limit, count), expected);
    }

    #[test]
    fn test_settings_builder() {
        let settings = CursorSettings::new(Namespace::new("db", "coll"))
            .batch_size(2)
            .limit(-5)
            .max_await_time(Some(Duration::from_millis(100)))
            .comment(Some(Bson::String("tag".into())));
        assert_eq!(settings.batch_size, 2);
        assert_eq!(settings.limit, -5);
        assert_eq!(settings.max_await_time, Some(Duration::from_millis(100)));
    }
}
