//! Operations: the units the client executes against a [`Binding`].
//!
//! Every operation acquires its connection source and connection through
//! [`execute_with_retries`], which also decides whether a failed attempt is
//! replayed.

mod aggregate;
mod command;
mod count;
mod find;
mod list_collections;
mod write;

pub use self::aggregate::AggregateOperation;
pub use self::command::CommandOperation;
pub use self::count::CountOperation;
pub use self::find::{CursorType, FindOperation};
pub use self::list_collections::ListCollectionsOperation;
pub use self::write::{BulkWriteResult, MixedBulkWriteOperation, WriteConcernError, WriteRequest};

use crate::concern::WriteConcern;
use crate::connection::{Binding, Connection, ConnectionSource};
use crate::error::{MongoError, Result};
use crate::retry::{AttemptFailure, AttemptResult, RetryState, Retryability};
use crate::session::ClientSession;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// One attempt of an operation, run over freshly acquired leases.
#[async_trait]
pub(crate) trait RetryableOperation: Send + Sync {
    type Output: Send;

    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run the operation once. Cursor-returning operations keep the leases.
    async fn execute_attempt(
        &self,
        source: Arc<dyn ConnectionSource>,
        connection: Arc<dyn Connection>,
        session: Option<&ClientSession>,
        txn_number: Option<i64>,
    ) -> Result<Self::Output>;
}

/// Retryability of a read under the given settings.
pub(crate) fn read_retryability(retry_reads: bool, session: Option<&ClientSession>) -> Retryability {
    if retry_reads && !session.is_some_and(ClientSession::in_transaction) {
        Retryability::Read
    } else {
        Retryability::None
    }
}

/// Retryability of a write under the given settings.
pub(crate) fn write_retryability(
    retry_writes: bool,
    session: Option<&ClientSession>,
    write_concern: &WriteConcern,
) -> Retryability {
    match session {
        Some(session)
            if retry_writes && !session.in_transaction() && write_concern.is_acknowledged() =>
        {
            Retryability::Write
        }
        _ => Retryability::None,
    }
}

/// Run a read, retrying it once on a transient error when `retry_reads` is
/// set and no transaction is active.
pub(crate) async fn execute_retryable_read<O>(
    operation: &O,
    binding: &dyn Binding,
    session: Option<&ClientSession>,
    retry_reads: bool,
) -> Result<O::Output>
where
    O: RetryableOperation + ?Sized,
{
    let retryability = read_retryability(retry_reads, session);
    execute_with_retries(operation, binding, session, retryability).await
}

/// Run a write, retrying it once with the same `txnNumber` when the settings
/// allow it.
pub(crate) async fn execute_retryable_write<O>(
    operation: &O,
    binding: &dyn Binding,
    session: Option<&ClientSession>,
    retry_writes: bool,
    write_concern: &WriteConcern,
) -> Result<O::Output>
where
    O: RetryableOperation + ?Sized,
{
    let retryability = write_retryability(retry_writes, session, write_concern);
    execute_with_retries(operation, binding, session, retryability).await
}

/// Run `operation`, replaying it once when the first attempt fails in a way
/// `retryability` allows.
pub(crate) async fn execute_with_retries<O>(
    operation: &O,
    binding: &dyn Binding,
    session: Option<&ClientSession>,
    retryability: Retryability,
) -> Result<O::Output>
where
    O: RetryableOperation + ?Sized,
{
    let mut retry = RetryState::new(retryability);
    let mut retried = false;

    loop {
        let outcome = attempt(operation, binding, session, &mut retry).await;
        match retry.complete(outcome) {
            AttemptResult::Success(output) => return Ok(output),
            AttemptResult::RetryableFailure(error) => {
                debug!(operation = operation.name(), error = %error, "retrying operation after error");
                retried = true;
            }
            AttemptResult::FinalFailure(error) => {
                if !retried && (error.is_retryable_read() || error.is_retryable_write()) {
                    debug!(operation = operation.name(), error = %error, "unable to retry");
                }
                return Err(error);
            }
        }
    }
}

async fn attempt<O>(
    operation: &O,
    binding: &dyn Binding,
    session: Option<&ClientSession>,
    retry: &mut RetryState,
) -> std::result::Result<O::Output, AttemptFailure>
where
    O: RetryableOperation + ?Sized,
{
    let source = binding
        .connection_source()
        .await
        .map_err(AttemptFailure::acquisition)?;
    let connection = source.connection().await.map_err(AttemptFailure::acquisition)?;
    let txn_number = retry.prepare_attempt(connection.description(), session)?;

    operation
        .execute_attempt(source, connection, session, txn_number)
        .await
        .map_err(|e| AttemptFailure::transmission(explain_unsupported_retryable_writes(e)))
}

fn explain_unsupported_retryable_writes(error: MongoError) -> MongoError {
    match error {
        MongoError::Command {
            code: 20,
            code_name,
            message,
            labels,
        } if message.starts_with("Transaction numbers") => MongoError::Command {
            code: 20,
            code_name,
            message: "This MongoDB deployment does not support retryable writes. \
                      Please add retryWrites=false to your connection string."
                .to_string(),
            labels,
        },
        other => other,
    }
}
