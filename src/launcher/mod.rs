//! The launcher facade: the public handle and the worker task behind it.

pub(crate) mod manager;
pub(crate) mod requester;
mod worker;


use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::oneshot;

pub use self::{
    manager::{BindingManagerHandle, ChannelEvents},
    requester::Launch,
};
use self::{
    manager::{ManagementRequest, ManagementSender},
    requester::LaunchRequester,
    worker::LauncherWorker,
};
use crate::{
    binder::{Pid, ServiceBinder, ServiceName},
    error::{Error, Result},
    options::{CreationParams, LauncherOptions, SpawnData},
};

/// Hands out slots in a fixed pool of worker processes, wires up a
/// request/reply channel to each, and continuously adjusts each worker's
/// OS importance so the workers the user sees survive memory pressure.
///
/// This type is a handle to the task that owns all launcher state; it is
/// cheap to clone and pass around. The worker tears down once every
/// `Launcher` clone has been dropped.
#[derive(Clone, Debug)]
pub struct Launcher {
    requester: LaunchRequester,
    manager: ManagementSender,
    sandboxed_service_count: usize,
}

impl Launcher {
    /// Starts a launcher for the two declared worker classes.
    ///
    /// Returns the launcher handle plus the [`ChannelEvents`] handle the
    /// embedder wires its transport notifications into. Fails if either
    /// worker class is misdeclared.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        options: LauncherOptions,
        binder: Arc<dyn ServiceBinder>,
    ) -> Result<(Launcher, ChannelEvents)> {
        let sandboxed_service_count = options.sandboxed_services.count;
        let (requester, manager) = LauncherWorker::start(options, binder)?;
        Ok((
            Launcher {
                requester,
                manager: manager.clone(),
                sandboxed_service_count,
            },
            ChannelEvents { sender: manager },
        ))
    }

    /// Requests a worker spawn.
    ///
    /// Resolves once the request has been dispatched onto a connection
    /// (fresh or the warmed spare) or queued behind a full pool; check
    /// [`Launch::was_queued`]. Await [`Launch::launched`] for the outcome;
    /// it fires exactly once per spawn, with `None` on failure.
    pub async fn start(&self, spawn: SpawnData) -> Result<Launch> {
        self.requester.request(spawn).await
    }

    /// Stops a worker: deregisters it from priority management, unbinds
    /// every level, and releases its slot shortly after so the OS can
    /// finish tearing the process down before the slot is reused. Unknown
    /// identities are logged and ignored.
    pub fn stop(&self, pid: Pid) {
        self.manager.send(ManagementRequest::Stop { pid });
    }

    /// Pre-warms a sandboxed connection for `params`, if none is held and
    /// a slot is free. A later spawn with matching parameters consumes it
    /// without a fresh allocation.
    pub fn warm_up(&self, params: CreationParams) {
        self.manager.send(ManagementRequest::WarmUp { params });
    }

    /// The binding-manager half of the API, for visibility and host
    /// lifecycle events.
    pub fn binding_manager(&self) -> BindingManagerHandle {
        BindingManagerHandle {
            sender: self.manager.clone(),
        }
    }

    /// Shorthand for [`BindingManagerHandle::set_priority`].
    pub fn set_in_foreground(&self, pid: Pid, foreground: bool, boost_for_pending_views: bool) {
        self.binding_manager()
            .set_priority(pid, foreground, boost_for_pending_views);
    }

    /// Whether the worker holds any OOM-protecting binding level; for a
    /// dead worker whose slot has not been reused yet, whether it did at
    /// time of death.
    pub async fn is_oom_protected(&self, pid: Pid) -> Result<bool> {
        let (reply, receiver) = oneshot::channel();
        self.manager
            .send(ManagementRequest::IsOomProtected { pid, reply });
        receiver.await.map_err(|_| Error::shutdown())
    }

    /// A point-in-time view of one worker class's slot pool.
    pub async fn pool_status(&self, sandboxed: bool) -> Result<PoolStatus> {
        let (reply, receiver) = oneshot::channel();
        self.manager
            .send(ManagementRequest::QueryPoolStatus { sandboxed, reply });
        receiver.await.map_err(|_| Error::shutdown())
    }

    /// The number of declared sandboxed service instances.
    pub fn number_of_sandboxed_services(&self) -> usize {
        self.sandboxed_service_count
    }
}

/// A live worker process, returned by a successful launch.
#[derive(Clone, Debug)]
pub struct ChildProcessHandle {
    pid: Pid,
    service: ServiceName,
    waived_only: Arc<AtomicBool>,
}

impl ChildProcessHandle {
    pub(crate) fn new(pid: Pid, service: ServiceName, waived_only: Arc<AtomicBool>) -> Self {
        Self {
            pid,
            service,
            waived_only,
        }
    }

    /// The worker identity assigned during setup.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The service instance backing the worker.
    pub fn service_name(&self) -> &ServiceName {
        &self.service
    }

    /// Whether the worker currently holds only the waived binding level,
    /// making it eligible for reclamation, or held only it at the moment it
    /// died.
    ///
    /// Readable from any thread. Deliberately unsynchronized: the value is
    /// a single flag whose staleness callers accept.
    pub fn waived_only_or_when_died(&self) -> bool {
        self.waived_only.load(Ordering::Relaxed)
    }
}

/// A point-in-time view of one worker class's slot pool.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct PoolStatus {
    /// The number of declared service instances for the class.
    pub declared_services: usize,
    /// Whether a spawn submitted now would get a slot immediately.
    pub free_slot_available: bool,
    /// Whether any slot is occupied.
    pub any_connection_allocated: bool,
    /// The number of spawns queued behind the full pool.
    pub pending_spawns: usize,
}
