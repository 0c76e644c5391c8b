use tokio::sync::{mpsc, oneshot};

use super::ChildProcessHandle;
use crate::{
    error::{Error, Result},
    options::SpawnData,
    runtime::{AcknowledgedMessage, WorkerHandle},
};

pub(super) type LaunchMessage = AcknowledgedMessage<PendingSpawn, Dispatch>;

/// Returns a new requester/receiver pair.
pub(super) fn channel(handle: WorkerHandle) -> (LaunchRequester, LaunchRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        LaunchRequester {
            sender,
            _handle: handle,
        },
        LaunchRequestReceiver { receiver },
    )
}

/// Handle for submitting spawn requests to the launcher worker.
/// This requester will keep the worker alive. Once all requesters have been
/// dropped, the worker stops servicing requests, tears down its live
/// connections, and exits.
#[derive(Clone, Debug)]
pub(super) struct LaunchRequester {
    sender: mpsc::UnboundedSender<LaunchMessage>,
    _handle: WorkerHandle,
}

impl LaunchRequester {
    /// Submit a spawn request. Resolves once the worker has either taken a
    /// slot for it (possibly the warmed spare) or queued it behind a full
    /// pool.
    pub(super) async fn request(&self, spawn: SpawnData) -> Result<Launch> {
        let (fulfiller, receiver) = oneshot::channel();
        let (message, ack) = AcknowledgedMessage::package(PendingSpawn {
            spawn,
            fulfiller,
            retried: false,
        });
        self.sender.send(message).map_err(|_| Error::shutdown())?;
        match ack.wait_for_acknowledgment().await {
            Some(dispatch) => Ok(Launch {
                queued: matches!(dispatch, Dispatch::Queued),
                receiver,
            }),
            None => Err(Error::shutdown()),
        }
    }
}

/// Receiving end of a given LaunchRequester.
#[derive(Debug)]
pub(super) struct LaunchRequestReceiver {
    receiver: mpsc::UnboundedReceiver<LaunchMessage>,
}

impl LaunchRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<LaunchMessage> {
        self.receiver.recv().await
    }
}

/// How the worker disposed of a spawn request on receipt.
#[derive(Clone, Copy, Debug)]
pub(super) enum Dispatch {
    /// A connection was taken immediately (fresh slot or warmed spare).
    Immediate,
    /// No slot was free; the request joined the pending queue.
    Queued,
}

/// A spawn request in flight: the spawn data plus the single-shot channel
/// its outcome is delivered on. Lives in the pending queue while no slot is
/// free, and rides along through the automatic retry after a peer-check
/// rejection.
#[derive(Debug)]
pub(crate) struct PendingSpawn {
    pub(crate) spawn: SpawnData,
    pub(crate) fulfiller: oneshot::Sender<Option<ChildProcessHandle>>,
    /// Whether the one automatic retry has been spent.
    pub(crate) retried: bool,
}

impl PendingSpawn {
    /// Resolve the spawn. Consumes the fulfiller, so each spawn resolves at
    /// most once; a receiver that has hung up is fine.
    pub(crate) fn fulfill(self, result: Option<ChildProcessHandle>) {
        let _: std::result::Result<_, _> = self.fulfiller.send(result);
    }
}

/// A launch in progress, returned by [`Launcher::start`](crate::Launcher::start).
#[derive(Debug)]
pub struct Launch {
    queued: bool,
    receiver: oneshot::Receiver<Option<ChildProcessHandle>>,
}

impl Launch {
    /// Whether the spawn found every slot occupied and was queued instead
    /// of dispatched immediately.
    pub fn was_queued(&self) -> bool {
        self.queued
    }

    /// Waits for the worker to come up. Resolves to `None` if the spawn
    /// failed or the launcher shut down first; queued spawns resolve
    /// whenever a slot frees up for them.
    pub async fn launched(self) -> Option<ChildProcessHandle> {
        self.receiver.await.ok().flatten()
    }
}
