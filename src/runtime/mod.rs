mod acknowledged_message;
mod worker_handle;

use std::future::Future;

pub(crate) use acknowledged_message::AcknowledgedMessage;
pub(crate) use worker_handle::{WorkerHandle, WorkerHandleListener};

/// Spawn a task on the tokio runtime this crate is running under. The task is detached; use a
/// [`WorkerHandleListener`] if its lifetime needs observing.
pub(crate) fn spawn<F, O>(fut: F) -> tokio::task::JoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    tokio::task::spawn(fut)
}
