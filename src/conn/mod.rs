//! Per-worker connection state: the four binding levels, their refcounts,
//! and the start/setup/stop lifecycle.


use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use derive_where::derive_where;

use crate::{
    binder::{BindingLevel, ChildChannel, Pid, ServiceBinder, ServiceName},
    error::Result,
    options::ConnectionBundles,
};

const LEVELS: [BindingLevel; 4] = [
    BindingLevel::Initial,
    BindingLevel::Strong,
    BindingLevel::Moderate,
    BindingLevel::Waived,
];

/// Which binding levels are held, with the strong level refcounted.
///
/// This is the *desired* importance of the worker; [`ChildConnection`] diffs
/// it against what is currently bound at the transport and issues at most
/// one bind and one unbind per level per transition.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct BindingState {
    initial: bool,
    strong: u32,
    moderate: bool,
    waived: bool,

    /// The initial level is bound exactly once at start and never re-bound
    /// after its first removal.
    initial_spent: bool,
}

impl BindingState {
    fn holds(&self, level: BindingLevel) -> bool {
        match level {
            BindingLevel::Initial => self.initial,
            BindingLevel::Strong => self.strong > 0,
            BindingLevel::Moderate => self.moderate,
            BindingLevel::Waived => self.waived,
        }
    }

    fn clear(&mut self, level: BindingLevel) {
        match level {
            BindingLevel::Initial => {
                self.initial = false;
                self.initial_spent = true;
            }
            BindingLevel::Strong => self.strong = 0,
            BindingLevel::Moderate => self.moderate = false,
            BindingLevel::Waived => self.waived = false,
        }
    }

    fn clear_all(&mut self) {
        for level in LEVELS {
            self.clear(level);
        }
    }

    /// True iff the worker is bound but only at the waived level, i.e. it
    /// is eligible for reclamation by the host OS.
    fn waived_only(&self) -> bool {
        self.waived && !self.initial && self.strong == 0 && !self.moderate
    }
}

/// The set of levels currently bound at the transport.
#[derive(Clone, Copy, Debug, Default)]
struct BoundLevels {
    initial: bool,
    strong: bool,
    moderate: bool,
    waived: bool,
}

impl BoundLevels {
    fn get(&self, level: BindingLevel) -> bool {
        match level {
            BindingLevel::Initial => self.initial,
            BindingLevel::Strong => self.strong,
            BindingLevel::Moderate => self.moderate,
            BindingLevel::Waived => self.waived,
        }
    }

    fn set(&mut self, level: BindingLevel, bound: bool) {
        match level {
            BindingLevel::Initial => self.initial = bound,
            BindingLevel::Strong => self.strong = bound,
            BindingLevel::Moderate => self.moderate = bound,
            BindingLevel::Waived => self.waived = bound,
        }
    }
}

/// One worker process: its service identity, binding state, reply channel,
/// and lifecycle flags. Owned by the allocator slot it was created for and
/// only ever touched from the launcher task.
#[derive_where(Debug)]
pub(crate) struct ChildConnection {
    service: ServiceName,

    #[derive_where(skip)]
    binder: Arc<dyn ServiceBinder>,

    bindings: BindingState,
    bound: BoundLevels,

    /// The reply channel, present once the transport reports the channel
    /// established.
    channel: Option<Box<dyn ChildChannel>>,

    /// Assigned during setup; `None` until the worker reports its identity.
    pid: Option<Pid>,

    started: bool,
    verify_peer: bool,
    peer_verified: bool,
    setup_sent: bool,
    setup_complete: bool,
    disconnected: bool,
    unbound: bool,

    /// Payload recorded by the facade, waiting for the channel (and the
    /// peer check, when requested) before it is handed to the worker.
    pending_setup: Option<ConnectionBundles>,

    /// Mirror of [`BindingState::waived_only`], readable from any thread.
    /// Frozen at its final value when the connection dies.
    waived_only: Arc<AtomicBool>,
}

impl ChildConnection {
    pub(crate) fn new(service: ServiceName, binder: Arc<dyn ServiceBinder>) -> Self {
        Self {
            service,
            binder,
            bindings: BindingState::default(),
            bound: BoundLevels::default(),
            channel: None,
            pid: None,
            started: false,
            verify_peer: false,
            peer_verified: false,
            setup_sent: false,
            setup_complete: false,
            disconnected: false,
            unbound: false,
            pending_setup: None,
            waived_only: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn service(&self) -> &ServiceName {
        &self.service
    }

    pub(crate) fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub(crate) fn is_setup_complete(&self) -> bool {
        self.setup_complete
    }

    pub(crate) fn strong_count(&self) -> u32 {
        self.bindings.strong
    }

    #[cfg(test)]
    pub(crate) fn holds(&self, level: BindingLevel) -> bool {
        self.bindings.holds(level)
    }

    /// Whether the reply channel is currently up.
    pub(crate) fn is_connected(&self) -> bool {
        self.started && self.channel.is_some() && !self.disconnected
    }

    /// Whether any of the OOM-protecting levels (anything but waived) is
    /// held. For dead connections this reports the state at time of death.
    pub(crate) fn is_oom_protected(&self) -> bool {
        !self.waived_only.load(Ordering::Relaxed)
            && (self.disconnected || self.bindings.holds(BindingLevel::Waived))
    }

    /// The any-thread mirror of the waived-only state, shared with
    /// [`ChildProcessHandle`](crate::ChildProcessHandle).
    pub(crate) fn waived_only_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.waived_only)
    }

    /// Binds the waived level plus either the strong or the initial level,
    /// asking the OS to create the worker process. A bind rejection here is
    /// fatal for the connection; the caller must not retry on it.
    pub(crate) fn start(&mut self, use_strong: bool, verify_peer: bool) -> Result<()> {
        debug_assert!(!self.started, "connection started twice");
        self.started = true;
        self.verify_peer = verify_peer;
        self.bindings.waived = true;
        if use_strong {
            self.bindings.strong = 1;
        } else {
            self.bindings.initial = true;
        }
        self.apply_bindings(true)
    }

    /// Records the setup payload. The payload is handed to the worker as
    /// soon as the channel is up and, when requested, the peer check has
    /// passed; either side may arrive first.
    pub(crate) fn record_setup(&mut self, payload: ConnectionBundles) {
        debug_assert!(
            self.pending_setup.is_none() && !self.setup_sent,
            "setup recorded twice"
        );
        if self.pending_setup.is_some() || self.setup_sent {
            tracing::warn!(service = %self.service, "ignoring duplicate setup payload");
            return;
        }
        self.pending_setup = Some(payload);
        self.maybe_send_setup();
    }

    /// Handles the transport reporting the channel established. Returns
    /// whether the peer check is still outstanding.
    pub(crate) fn on_channel_established(&mut self, channel: Box<dyn ChildChannel>) -> bool {
        if self.disconnected {
            return false;
        }
        let channel = self.channel.insert(channel);
        if self.verify_peer && !self.peer_verified {
            channel.request_peer_identity();
            true
        } else {
            self.peer_verified = true;
            self.maybe_send_setup();
            false
        }
    }

    /// Handles a passing peer-identity reply. (A failing reply never
    /// reaches the connection; the launcher tears it down instead.)
    pub(crate) fn on_peer_verified(&mut self) {
        self.peer_verified = true;
        self.maybe_send_setup();
    }

    fn maybe_send_setup(&mut self) {
        if self.setup_sent || self.disconnected || !self.peer_verified || self.channel.is_none() {
            return;
        }
        let Some(payload) = self.pending_setup.take() else {
            return;
        };
        self.setup_sent = true;
        if let Some(channel) = self.channel.as_ref() {
            channel.send_setup(payload);
        }
    }

    /// Records the worker identity reported at the end of setup.
    pub(crate) fn complete_setup(&mut self, pid: Pid) {
        debug_assert!(!self.setup_complete, "setup completed twice");
        self.pid = Some(pid);
        self.setup_complete = true;
    }

    /// Unbinds all levels and marks the connection dead. Idempotent. The
    /// waived-only snapshot observable through
    /// [`ChildProcessHandle`](crate::ChildProcessHandle) keeps the value it
    /// had at the moment of death.
    pub(crate) fn stop(&mut self) {
        if self.unbound {
            return;
        }
        // Freeze the cross-thread snapshot before tearing the levels down;
        // the recorded priority is the one held at time of death.
        self.disconnected = true;
        self.unbound = true;
        self.bindings.clear_all();
        self.apply_unbinds();
        self.channel = None;
    }

    /// Holds the initial level. No-op if it is already held or was held
    /// once before; the initial level is never re-bound after its first
    /// removal.
    pub(crate) fn add_initial_binding(&mut self) {
        if self.bindings.initial || self.bindings.initial_spent || self.disconnected {
            return;
        }
        self.bindings.initial = true;
        let _ = self.apply_bindings(false);
    }

    /// Releases the initial level. Allowed even post-disconnect, where it
    /// has no observable effect.
    pub(crate) fn remove_initial_binding(&mut self) {
        if !self.bindings.initial {
            return;
        }
        self.bindings.clear(BindingLevel::Initial);
        if !self.disconnected {
            self.apply_unbinds();
        }
    }

    /// Increments the strong refcount, binding the level on 0 -> 1.
    /// Rejected while the channel is not up.
    pub(crate) fn add_strong_binding(&mut self) {
        if !self.is_connected() {
            tracing::warn!(service = %self.service, "strong binding requested on a connection that is not connected");
            return;
        }
        self.bindings.strong += 1;
        let _ = self.apply_bindings(false);
    }

    /// Decrements the strong refcount, unbinding the level on 1 -> 0.
    pub(crate) fn remove_strong_binding(&mut self) {
        if self.bindings.strong == 0 {
            tracing::warn!(service = %self.service, "strong binding removed more times than added");
            return;
        }
        self.bindings.strong -= 1;
        if !self.disconnected {
            self.apply_unbinds();
        }
    }

    /// Holds the moderate level. Ignored while the channel is not up.
    pub(crate) fn add_moderate_binding(&mut self) {
        if !self.is_connected() {
            tracing::warn!(service = %self.service, "moderate binding requested on a connection that is not connected");
            return;
        }
        self.bindings.moderate = true;
        let _ = self.apply_bindings(false);
    }

    /// Releases the moderate level. Ignored while not held.
    pub(crate) fn remove_moderate_binding(&mut self) {
        if !self.bindings.moderate {
            return;
        }
        self.bindings.clear(BindingLevel::Moderate);
        if !self.disconnected {
            self.apply_unbinds();
        }
    }

    /// Forcibly clears every OOM-protecting level, leaving only waived.
    /// Used on low-memory hosts when a new foreground worker displaces this
    /// one.
    pub(crate) fn drop_oom_bindings(&mut self) {
        self.bindings.clear(BindingLevel::Initial);
        self.bindings.clear(BindingLevel::Strong);
        self.bindings.clear(BindingLevel::Moderate);
        if !self.disconnected {
            self.apply_unbinds();
        }
    }

    /// Issues the binds the desired state needs, then the unbinds, so a
    /// transition never leaves the worker below its target importance.
    /// With `strict`, a bind rejection is returned to the caller; otherwise
    /// it is logged and the level dropped from the desired state.
    fn apply_bindings(&mut self, strict: bool) -> Result<()> {
        for level in LEVELS {
            if self.bindings.holds(level) && !self.bound.get(level) {
                match self.binder.bind(&self.service, level) {
                    Ok(()) => self.bound.set(level, true),
                    Err(error) if strict => return Err(error),
                    Err(error) => {
                        tracing::warn!(service = %self.service, ?level, %error, "bind rejected; dropping level");
                        self.bindings.clear(level);
                    }
                }
            }
        }
        self.apply_unbinds();
        Ok(())
    }

    fn apply_unbinds(&mut self) {
        for level in LEVELS {
            if !self.bindings.holds(level) && self.bound.get(level) {
                self.binder.unbind(&self.service, level);
                self.bound.set(level, false);
            }
        }
        if !self.disconnected {
            self.waived_only
                .store(self.bindings.waived_only(), Ordering::Relaxed);
        }
    }
}
