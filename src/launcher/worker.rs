use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::oneshot;

use super::{
    manager::{self, ManagementReceiver, ManagementRequest, ManagementSender},
    requester::{self, Dispatch, LaunchRequester, LaunchRequestReceiver, PendingSpawn},
    ChildProcessHandle, PoolStatus,
};
use crate::{
    allocator::ConnectionAllocator,
    binder::{ChildChannel, Pid, ServiceBinder, ServiceName},
    bindings::BindingManager,
    conn::ChildConnection,
    error::{Error, Result},
    event::{
        ConnectionAllocatedEvent, ConnectionClosedEvent, ConnectionClosedReason,
        ConnectionReadyEvent, LauncherClosedEvent, LauncherEventEmitter, SpareConsumedEvent,
        SpareWarmedEvent, SpawnQueuedEvent,
    },
    options::{CreationParams, LauncherOptions},
    runtime::{self, WorkerHandleListener},
    spare::SpareConnectionHolder,
};

/// A worker task that owns all launcher state: both allocators, every live
/// connection, the spare holder, and the binding manager. Every public
/// entry point is a message into this task, so the state needs no locks.
pub(super) struct LauncherWorker {
    /// Slot pool for the sandboxed worker class.
    sandboxed: ConnectionAllocator,

    /// Slot pool for the privileged worker class.
    privileged: ConnectionAllocator,

    /// The single pre-warmed connection, if one is held.
    spare: SpareConnectionHolder,

    /// Importance policy for sandboxed workers.
    bindings: BindingManager,

    /// Worker identity to service-name lookup, populated at setup
    /// completion and cleared when the slot is freed.
    pid_index: HashMap<Pid, ServiceName>,

    /// Spawns that hold a connection but have not completed setup yet,
    /// keyed by the service they are riding on.
    in_flight: HashMap<ServiceName, PendingSpawn>,

    /// How long a dead connection keeps its slot before reuse.
    free_slot_delay: Duration,

    event_emitter: LauncherEventEmitter,

    /// Sender used by delayed tasks to post back into this worker.
    management_sender: ManagementSender,

    launch_receiver: LaunchRequestReceiver,
    management_receiver: ManagementReceiver,

    /// Receiver used to determine if any launcher handles are left. Once
    /// all of them drop, this worker tears down and exits.
    handle_listener: WorkerHandleListener,
}

impl LauncherWorker {
    /// Starts a worker and returns the launch and management senders.
    /// Once all launch requesters are dropped, the worker stops executing
    /// and tears down its connections.
    pub(super) fn start(
        options: LauncherOptions,
        binder: Arc<dyn ServiceBinder>,
    ) -> Result<(LaunchRequester, ManagementSender)> {
        if options
            .sandboxed_services
            .owns(&options.privileged_services.service_name(0))
        {
            return Err(Error::configuration(
                "sandboxed and privileged worker classes resolve to the same services",
            ));
        }

        let sandboxed =
            ConnectionAllocator::new(options.sandboxed_services.clone(), Arc::clone(&binder))?;
        let privileged =
            ConnectionAllocator::new(options.privileged_services.clone(), Arc::clone(&binder))?;

        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (launch_requester, launch_receiver) = requester::channel(handle);
        let (management_sender, management_receiver) = manager::channel();

        let worker = LauncherWorker {
            sandboxed,
            privileged,
            spare: SpareConnectionHolder::default(),
            bindings: BindingManager::new(options.host_profile, management_sender.clone()),
            pid_index: HashMap::new(),
            in_flight: HashMap::new(),
            free_slot_delay: options
                .free_slot_delay
                .unwrap_or(crate::options::DEFAULT_FREE_SLOT_DELAY),
            event_emitter: LauncherEventEmitter::new(options.event_handler),
            management_sender: management_sender.clone(),
            launch_receiver,
            management_receiver,
            handle_listener,
        };

        runtime::spawn(async move {
            worker.execute().await;
        });

        Ok((launch_requester, management_sender))
    }

    /// Run the worker task, listening on the various receivers until all
    /// launcher handles have been dropped. Management requests always have
    /// priority over spawn requests, so a stop or a channel loss observed
    /// before a spawn is acted on first.
    async fn execute(mut self) {
        loop {
            let task = tokio::select! {
                // This marker indicates that the futures will be polled in
                // order from top to bottom in this select! macro.
                biased;

                Some(request) = self.management_receiver.recv() => WorkerTask::Manage(request),
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    // all launcher handles have been dropped meaning this
                    // worker has no more references and can exit.
                    break
                },
                Some(message) = self.launch_receiver.recv() => WorkerTask::Launch(message),
                else => {
                    break
                }
            };

            match task {
                WorkerTask::Launch(message) => {
                    let (pending, ack) = message.into_parts();
                    self.handle_launch(pending, Some(ack));
                }
                WorkerTask::Manage(request) => self.handle_request(request),
            }
        }

        self.tear_down();
    }

    fn handle_request(&mut self, request: ManagementRequest) {
        match request {
            ManagementRequest::SetPriority {
                pid,
                foreground,
                boost_for_pending_views,
            } => {
                self.bindings.set_priority(
                    &mut self.sandboxed,
                    pid,
                    foreground,
                    boost_for_pending_views,
                );
            }
            ManagementRequest::OnSentToBackground => {
                self.bindings.on_sent_to_background(&mut self.sandboxed);
            }
            ManagementRequest::OnBroughtToForeground => {
                self.bindings.on_brought_to_foreground(&mut self.sandboxed);
            }
            ManagementRequest::StartModerateBindingManagement { max_size } => {
                self.bindings.start_moderate_binding_management(max_size);
            }
            ManagementRequest::ReleaseAllModerateBindings => {
                self.bindings
                    .release_all_moderate_bindings(&mut self.sandboxed);
            }
            ManagementRequest::OnTrimMemory { level } => {
                self.bindings.on_trim_memory(&mut self.sandboxed, level);
            }
            ManagementRequest::OnLowMemory => {
                self.bindings.on_low_memory(&mut self.sandboxed);
            }
            ManagementRequest::Stop { pid } => self.stop(pid),
            ManagementRequest::WarmUp { params } => self.warm_up(params),
            ManagementRequest::ChannelEstablished { service, channel } => {
                self.on_channel_established(&service, channel);
            }
            ManagementRequest::ChannelLost { service } => self.on_channel_lost(&service),
            ManagementRequest::PeerIdentity {
                service,
                bound_to_other_host,
            } => self.on_peer_identity(&service, bound_to_other_host),
            ManagementRequest::SetupComplete { service, pid } => {
                self.on_setup_complete(&service, pid);
            }
            ManagementRequest::CompleteForegroundDrop { pid, epoch } => {
                self.bindings
                    .complete_foreground_drop(&mut self.sandboxed, pid, epoch);
            }
            ManagementRequest::DrainModeratePool { epoch } => {
                self.bindings
                    .drain_moderate_pool(&mut self.sandboxed, epoch);
            }
            ManagementRequest::FreeConnection { service } => self.free_connection(&service),
            ManagementRequest::IsOomProtected { pid, reply } => {
                let _: std::result::Result<_, _> = reply.send(self.is_oom_protected(pid));
            }
            ManagementRequest::QueryPoolStatus { sandboxed, reply } => {
                let alloc = if sandboxed {
                    &self.sandboxed
                } else {
                    &self.privileged
                };
                let _: std::result::Result<_, _> = reply.send(PoolStatus {
                    declared_services: alloc.number_of_services(),
                    free_slot_available: alloc.is_free_connection_available(),
                    any_connection_allocated: alloc.any_connection_allocated(),
                    pending_spawns: alloc.pending_len(),
                });
            }
            #[cfg(test)]
            ManagementRequest::Snapshot { reply } => {
                let _: std::result::Result<_, _> = reply.send(self.snapshot());
            }
        }
    }

    /// Dispatch a spawn: consume the spare if it matches, otherwise take a
    /// slot from the right allocator, otherwise queue. `ack` is present
    /// only on first submission; retries and queued re-dispatches already
    /// answered their caller.
    fn handle_launch(&mut self, pending: PendingSpawn, ack: Option<oneshot::Sender<Dispatch>>) {
        let sandboxed = pending.spawn.sandboxed;

        if sandboxed {
            let matched = self.spare.take_if_matching(
                true,
                pending.spawn.foreground,
                &pending.spawn.creation_params,
            );
            if let Some(service) = matched {
                acknowledge(ack, Dispatch::Immediate);
                self.event_emitter.emit_event(|| {
                    SpareConsumedEvent {
                        service: service.clone(),
                    }
                    .into()
                });
                let payload = pending.spawn.bundles();
                match self.conn_mut(&service) {
                    Some(conn) => {
                        conn.record_setup(payload);
                        self.in_flight.insert(service, pending);
                    }
                    None => {
                        tracing::warn!(%service, "spare holder referenced a missing connection");
                        pending.fulfill(None);
                    }
                }
                return;
            }
        }

        let alloc = if sandboxed {
            &mut self.sandboxed
        } else {
            &mut self.privileged
        };
        match alloc.allocate() {
            Some(conn) => {
                let service = conn.service().clone();
                let start_result = conn.start(
                    pending.spawn.foreground,
                    pending.spawn.creation_params.bind_to_caller_check,
                );
                acknowledge(ack, Dispatch::Immediate);
                match start_result {
                    Ok(()) => {
                        self.event_emitter.emit_event(|| {
                            ConnectionAllocatedEvent {
                                service: service.clone(),
                            }
                            .into()
                        });
                        let payload = pending.spawn.bundles();
                        if let Some(conn) = self.conn_mut(&service) {
                            conn.record_setup(payload);
                        }
                        self.in_flight.insert(service, pending);
                    }
                    Err(error) => {
                        // A transport rejection is fatal for this spawn; no
                        // retry, and the slot goes through the normal death
                        // path.
                        tracing::warn!(%service, %error, "failed to start worker");
                        pending.fulfill(None);
                        self.connection_died(&service, ConnectionClosedReason::StartFailed);
                    }
                }
            }
            None => {
                let queue_length = alloc.enqueue(pending);
                acknowledge(ack, Dispatch::Queued);
                self.event_emitter.emit_event(|| {
                    SpawnQueuedEvent {
                        sandboxed,
                        queue_length,
                    }
                    .into()
                });
            }
        }
    }

    /// Stop a worker by identity: deregister it, tear down its bindings,
    /// and release its slot after the free delay.
    fn stop(&mut self, pid: Pid) {
        let Some(service) = self.pid_index.get(&pid).cloned() else {
            tracing::warn!(%pid, "stop requested for an unknown worker");
            return;
        };
        self.connection_died(&service, ConnectionClosedReason::Stopped);
    }

    /// Eagerly allocate and start a sandboxed connection so a later
    /// matching spawn can skip process creation. No queueing: if the pool
    /// is full the warm-up is simply skipped.
    fn warm_up(&mut self, params: CreationParams) {
        if !self.spare.is_empty() {
            return;
        }
        let Some(conn) = self.sandboxed.allocate() else {
            tracing::debug!("not warming a spare: no free sandboxed slot");
            return;
        };
        let service = conn.service().clone();
        match conn.start(false, params.bind_to_caller_check) {
            Ok(()) => {
                self.spare.record(service.clone(), params);
                self.event_emitter
                    .emit_event(|| SpareWarmedEvent { service }.into());
            }
            Err(error) => {
                tracing::warn!(%service, %error, "failed to start spare worker");
                self.connection_died(&service, ConnectionClosedReason::StartFailed);
            }
        }
    }

    fn on_channel_established(&mut self, service: &ServiceName, channel: Box<dyn ChildChannel>) {
        let Some(conn) = self.conn_mut(service) else {
            tracing::warn!(%service, "channel established for an unknown service");
            return;
        };
        if conn.is_disconnected() {
            return;
        }
        conn.on_channel_established(channel);
    }

    fn on_peer_identity(&mut self, service: &ServiceName, bound_to_other_host: bool) {
        let Some(conn) = self.conn_mut(service) else {
            tracing::warn!(%service, "peer identity reply for an unknown service");
            return;
        };
        if conn.is_disconnected() {
            return;
        }
        if !bound_to_other_host {
            conn.on_peer_verified();
            return;
        }

        // The worker is speculatively bound to another host instance. The
        // spawn riding on it gets one automatic re-entry through the normal
        // allocation path; the rejected slot is released through the death
        // path like any other.
        tracing::warn!(%service, "worker already bound to another host instance");
        let launch = self.in_flight.remove(service);
        self.connection_died(service, ConnectionClosedReason::StartFailed);
        match launch {
            Some(launch) if !launch.retried => {
                let retry = PendingSpawn {
                    retried: true,
                    ..launch
                };
                self.handle_launch(retry, None);
            }
            Some(launch) => launch.fulfill(None),
            None => {}
        }
    }

    fn on_setup_complete(&mut self, service: &ServiceName, pid: Pid) {
        if pid.get() == 0 {
            tracing::warn!(%service, "worker reported a zero identity; ignoring");
            return;
        }
        let sandboxed = self.sandboxed.owns(service);
        let Some(conn) = self.conn_mut(service) else {
            tracing::warn!(%service, "setup completion for an unknown service");
            return;
        };
        if conn.is_disconnected() {
            return;
        }
        if conn.is_setup_complete() {
            tracing::warn!(%service, "duplicate setup completion; ignoring");
            return;
        }
        conn.complete_setup(pid);
        let handle = ChildProcessHandle::new(pid, service.clone(), conn.waived_only_flag());

        self.pid_index.insert(pid, service.clone());
        if sandboxed {
            self.bindings.add_connection(pid, service.index());
        }
        self.event_emitter.emit_event(|| {
            ConnectionReadyEvent {
                service: service.clone(),
                pid,
            }
            .into()
        });
        if let Some(launch) = self.in_flight.remove(service) {
            launch.fulfill(Some(handle));
        }
    }

    fn on_channel_lost(&mut self, service: &ServiceName) {
        let Some(conn) = self.conn_mut(service) else {
            // Losing the channel after the slot was freed is expected; the
            // teardown raced the free delay.
            tracing::debug!(%service, "channel lost for an unknown service");
            return;
        };
        if conn.is_disconnected() {
            return;
        }
        self.connection_died(service, ConnectionClosedReason::ChannelLost);
    }

    /// The single death path. Marks the connection dead, resolves any
    /// outstanding launch with `None`, deregisters the worker, and
    /// schedules the slot release. Safe to call at most once per
    /// connection; later channel events are ignored by the disconnect
    /// check.
    fn connection_died(&mut self, service: &ServiceName, reason: ConnectionClosedReason) {
        let Some(conn) = self.conn_mut(service) else {
            return;
        };
        if conn.is_disconnected() {
            return;
        }
        let pid = conn.pid();
        conn.stop();

        if let Some(pid) = pid {
            self.bindings.remove_connection(pid);
        }
        self.spare.on_connection_died(service);
        if let Some(launch) = self.in_flight.remove(service) {
            launch.fulfill(None);
        }
        self.event_emitter.emit_event(|| {
            ConnectionClosedEvent {
                service: service.clone(),
                pid,
                reason,
            }
            .into()
        });
        self.management_sender.post_delayed(
            ManagementRequest::FreeConnection {
                service: service.clone(),
            },
            self.free_slot_delay,
        );
    }

    /// The free delay elapsing for a dead connection. Clears the slot and
    /// dispatches the next queued spawn, if any.
    fn free_connection(&mut self, service: &ServiceName) {
        let Some(alloc) = self.alloc_mut(service) else {
            return;
        };
        let Some((conn, next)) = alloc.free(service.index()) else {
            return;
        };
        if let Some(pid) = conn.pid() {
            self.pid_index.remove(&pid);
        }
        drop(conn);
        if let Some(pending) = next {
            self.handle_launch(pending, None);
        }
    }

    /// Whether the worker holds any binding level besides waived; for dead
    /// workers, whether it did at time of death.
    fn is_oom_protected(&self, pid: Pid) -> bool {
        let conn = self.pid_index.get(&pid).and_then(|service| self.conn(service));
        match conn {
            Some(conn) => conn.is_oom_protected(),
            None => {
                tracing::warn!(%pid, "OOM protection queried for an unknown worker");
                false
            }
        }
    }

    fn tear_down(&mut self) {
        for (_, launch) in self.in_flight.drain() {
            launch.fulfill(None);
        }
        let mut closed = Vec::new();
        for alloc in [&mut self.sandboxed, &mut self.privileged] {
            let pending: Vec<_> = alloc.drain_pending().collect();
            for spawn in pending {
                spawn.fulfill(None);
            }
            for conn in alloc.connections_mut() {
                if conn.is_disconnected() {
                    continue;
                }
                let pid = conn.pid();
                conn.stop();
                closed.push((conn.service().clone(), pid));
            }
        }
        for (service, pid) in closed {
            self.event_emitter.emit_event(|| {
                ConnectionClosedEvent {
                    service,
                    pid,
                    reason: ConnectionClosedReason::LauncherClosed,
                }
                .into()
            });
        }
        self.event_emitter
            .emit_event(|| LauncherClosedEvent {}.into());
    }

    fn alloc_mut(&mut self, service: &ServiceName) -> Option<&mut ConnectionAllocator> {
        if self.sandboxed.owns(service) {
            Some(&mut self.sandboxed)
        } else if self.privileged.owns(service) {
            Some(&mut self.privileged)
        } else {
            None
        }
    }

    fn conn_mut(&mut self, service: &ServiceName) -> Option<&mut ChildConnection> {
        let index = service.index();
        self.alloc_mut(service)?.get_mut(index)
    }

    fn conn(&self, service: &ServiceName) -> Option<&ChildConnection> {
        if self.sandboxed.owns(service) {
            self.sandboxed.get(service.index())
        } else if self.privileged.owns(service) {
            self.privileged.get(service.index())
        } else {
            None
        }
    }

    #[cfg(test)]
    fn snapshot(&self) -> WorkerSnapshot {
        use crate::binder::BindingLevel;
        use std::sync::atomic::Ordering;

        let mut conns = HashMap::new();
        for alloc in [&self.sandboxed, &self.privileged] {
            for conn in alloc.connections() {
                conns.insert(
                    conn.service().clone(),
                    ConnSnapshot {
                        pid: conn.pid(),
                        initial: conn.holds(BindingLevel::Initial),
                        strong: conn.strong_count(),
                        moderate: conn.holds(BindingLevel::Moderate),
                        waived: conn.holds(BindingLevel::Waived),
                        disconnected: conn.is_disconnected(),
                        waived_only: conn.waived_only_flag().load(Ordering::Relaxed),
                    },
                );
            }
        }
        WorkerSnapshot {
            sandboxed_free: self.sandboxed.free_slot_indices(),
            sandboxed_pending: self.sandboxed.pending_len(),
            privileged_free: self.privileged.free_slot_indices(),
            privileged_pending: self.privileged.pending_len(),
            conns,
            moderate_pool: self.bindings.moderate_pool_entries(),
            last_foreground: self.bindings.last_foreground(),
            bound_for_background: self.bindings.bound_for_background(),
        }
    }
}

fn acknowledge(ack: Option<oneshot::Sender<Dispatch>>, dispatch: Dispatch) {
    if let Some(ack) = ack {
        let _: std::result::Result<_, _> = ack.send(dispatch);
    }
}

/// Task to process by the worker.
enum WorkerTask {
    /// Handle a management request.
    Manage(ManagementRequest),

    /// Dispatch or queue the given spawn request.
    Launch(requester::LaunchMessage),
}

/// Point-in-time view of the worker state, for tests.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct WorkerSnapshot {
    pub(crate) sandboxed_free: Vec<usize>,
    pub(crate) sandboxed_pending: usize,
    pub(crate) privileged_free: Vec<usize>,
    pub(crate) privileged_pending: usize,
    pub(crate) conns: HashMap<ServiceName, ConnSnapshot>,
    pub(crate) moderate_pool: Vec<Pid>,
    pub(crate) last_foreground: Option<Pid>,
    pub(crate) bound_for_background: Option<Pid>,
}

#[cfg(test)]
#[derive(Clone, Debug)]
pub(crate) struct ConnSnapshot {
    pub(crate) pid: Option<Pid>,
    pub(crate) initial: bool,
    pub(crate) strong: u32,
    pub(crate) moderate: bool,
    pub(crate) waived: bool,
    pub(crate) disconnected: bool,
    pub(crate) waived_only: bool,
}
