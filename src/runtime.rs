//! Process-wide Tokio runtime backing the blocking API.

use crate::error::{MongoError, Result};
use once_cell::sync::Lazy;
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};

static RUNTIME: Lazy<std::result::Result<Runtime, String>> = Lazy::new(|| {
    Builder::new_multi_thread()
        .enable_all()
        .thread_name("mongo-do-ops")
        .build()
        .map_err(|e| e.to_string())
});

fn runtime() -> Result<&'static Runtime> {
    RUNTIME
        .as_ref()
        .map_err(|e| MongoError::Internal(format!("failed to start runtime: {e}")))
}

/// Drive `future` to completion on the calling thread.
///
/// Must not be called from inside an async task.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    if in_async_context() {
        return Err(MongoError::illegal_state(
            "blocking cursor operations cannot run inside an async runtime",
        ));
    }
    Ok(runtime()?.block_on(future))
}

/// Whether the calling thread is inside a Tokio runtime.
pub(crate) fn in_async_context() -> bool {
    Handle::try_current().is_ok()
}

/// Handle to the ambient runtime, or to the process-wide one when called
/// outside any runtime.
pub(crate) fn handle() -> Result<Handle> {
    match Handle::try_current() {
        Ok(handle) => Ok(handle),
        Err(_) => Ok(runtime()?.handle().clone()),
    }
}

/// Run `future` in the background on [`handle`].
pub(crate) fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match handle() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(e) => tracing::warn!(error = %e, "dropping background task"),
    }
}
