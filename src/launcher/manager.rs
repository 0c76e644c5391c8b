use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::PoolStatus;
use crate::{
    binder::{ChildChannel, Pid, ServiceName},
    memory::MemoryPressureLevel,
    options::CreationParams,
    runtime,
};

/// A request handled on the launcher task ahead of any queued spawn
/// requests: binding-manager events, lifecycle calls, transport
/// notifications, and delayed-task firings.
#[derive(Debug)]
pub(crate) enum ManagementRequest {
    SetPriority {
        pid: Pid,
        foreground: bool,
        boost_for_pending_views: bool,
    },
    OnSentToBackground,
    OnBroughtToForeground,
    StartModerateBindingManagement {
        max_size: usize,
    },
    ReleaseAllModerateBindings,
    OnTrimMemory {
        level: MemoryPressureLevel,
    },
    OnLowMemory,
    Stop {
        pid: Pid,
    },
    WarmUp {
        params: CreationParams,
    },

    /// The transport reports the reply channel up for a service.
    ChannelEstablished {
        service: ServiceName,
        channel: Box<dyn ChildChannel>,
    },
    /// The transport reports the reply channel gone.
    ChannelLost {
        service: ServiceName,
    },
    /// The worker answered the peer-identity query.
    PeerIdentity {
        service: ServiceName,
        bound_to_other_host: bool,
    },
    /// The worker finished setup and reported its identity.
    SetupComplete {
        service: ServiceName,
        pid: Pid,
    },

    /// Delayed removal of a foreground strong binding falling due.
    CompleteForegroundDrop {
        pid: Pid,
        epoch: u64,
    },
    /// Delayed background drain of the moderate pool falling due.
    DrainModeratePool {
        epoch: u64,
    },
    /// A stopped or disconnected connection's slot becoming reusable.
    FreeConnection {
        service: ServiceName,
    },

    IsOomProtected {
        pid: Pid,
        reply: oneshot::Sender<bool>,
    },
    QueryPoolStatus {
        sandboxed: bool,
        reply: oneshot::Sender<PoolStatus>,
    },

    #[cfg(test)]
    Snapshot {
        reply: oneshot::Sender<super::worker::WorkerSnapshot>,
    },
}

pub(crate) fn channel() -> (ManagementSender, ManagementReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ManagementSender { sender }, ManagementReceiver { receiver })
}

/// Sender half of the management channel. Does not keep the worker alive
/// the way a `LaunchRequester` does, so transports and delayed tasks can
/// hold one without pinning the launcher.
#[derive(Clone, Debug)]
pub(crate) struct ManagementSender {
    sender: mpsc::UnboundedSender<ManagementRequest>,
}

impl ManagementSender {
    /// Send a request. If the worker has exited this is a no-op.
    pub(crate) fn send(&self, request: ManagementRequest) {
        let _: std::result::Result<_, _> = self.sender.send(request);
    }

    /// Post a request back to the worker after `delay`. The receiving code
    /// carries an epoch check where the request must be cancellable.
    pub(crate) fn post_delayed(&self, request: ManagementRequest, delay: Duration) {
        let sender = self.sender.clone();
        runtime::spawn(async move {
            tokio::time::sleep(delay).await;
            let _: std::result::Result<_, _> = sender.send(request);
        });
    }
}

#[derive(Debug)]
pub(crate) struct ManagementReceiver {
    receiver: mpsc::UnboundedReceiver<ManagementRequest>,
}

impl ManagementReceiver {
    pub(crate) async fn recv(&mut self) -> Option<ManagementRequest> {
        self.receiver.recv().await
    }
}

/// Handle for feeding visibility, host-lifecycle, and memory-pressure
/// events to the binding manager. Cheap to clone; callable from any thread.
#[derive(Clone, Debug)]
pub struct BindingManagerHandle {
    pub(super) sender: ManagementSender,
}

impl BindingManagerHandle {
    /// Declare a worker's visibility. `foreground` workers hold a strong
    /// binding; `boost_for_pending_views` holds the initial binding for a
    /// worker about to become visible.
    pub fn set_priority(&self, pid: Pid, foreground: bool, boost_for_pending_views: bool) {
        self.sender.send(ManagementRequest::SetPriority {
            pid,
            foreground,
            boost_for_pending_views,
        });
    }

    /// The host application left the foreground. Must alternate strictly
    /// with [`on_brought_to_foreground`](Self::on_brought_to_foreground).
    pub fn on_sent_to_background(&self) {
        self.sender.send(ManagementRequest::OnSentToBackground);
    }

    /// The host application returned to the foreground.
    pub fn on_brought_to_foreground(&self) {
        self.sender.send(ManagementRequest::OnBroughtToForeground);
    }

    /// Enable the bounded pool of moderate bindings for recently-foreground
    /// workers.
    pub fn start_moderate_binding_management(&self, max_size: usize) {
        self.sender
            .send(ManagementRequest::StartModerateBindingManagement { max_size });
    }

    /// Drop every moderate binding, making the pooled workers reclaimable.
    pub fn release_all_moderate_bindings(&self) {
        self.sender.send(ManagementRequest::ReleaseAllModerateBindings);
    }

    /// A memory-pressure signal from the host.
    pub fn on_trim_memory(&self, level: MemoryPressureLevel) {
        self.sender.send(ManagementRequest::OnTrimMemory { level });
    }

    /// The host hit its low-memory callback.
    pub fn on_low_memory(&self) {
        self.sender.send(ManagementRequest::OnLowMemory);
    }
}

/// Handle the transport uses to deliver channel notifications into the
/// launcher. Cheap to clone and callable from any thread; each call is
/// marshalled onto the launcher task.
#[derive(Clone, Debug)]
pub struct ChannelEvents {
    pub(super) sender: ManagementSender,
}

impl ChannelEvents {
    /// The reply channel for `service` is up.
    pub fn established(&self, service: ServiceName, channel: Box<dyn ChildChannel>) {
        self.sender
            .send(ManagementRequest::ChannelEstablished { service, channel });
    }

    /// The reply channel for `service` is gone.
    pub fn lost(&self, service: ServiceName) {
        self.sender.send(ManagementRequest::ChannelLost { service });
    }

    /// The worker on `service` answered the peer-identity query.
    /// `bound_to_other_host` means it is already serving a different host
    /// instance and must not be set up.
    pub fn peer_identity(&self, service: ServiceName, bound_to_other_host: bool) {
        self.sender.send(ManagementRequest::PeerIdentity {
            service,
            bound_to_other_host,
        });
    }

    /// The worker on `service` accepted its setup payload and reported its
    /// identity.
    pub fn setup_complete(&self, service: ServiceName, pid: Pid) {
        self.sender
            .send(ManagementRequest::SetupComplete { service, pid });
    }
}
