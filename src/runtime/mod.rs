mod acknowledged_message;
mod join_handle;
mod worker_handle;

use std::future::Future;

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver},
    join_handle::AsyncJoinHandle,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};

/// Spawn a task in the background to run a future.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::Tokio(tokio::task::spawn(fut))
}
