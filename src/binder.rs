//! The seam between the launcher core and the host transport.
//!
//! The core never talks to the OS directly. It asks a [`ServiceBinder`] to
//! bind or unbind one of the four binding levels for a named service, and it
//! receives transport notifications (channel established, channel lost, peer
//! identity replies, setup replies) through the [`ChannelEvents`](crate::ChannelEvents) handle,
//! which marshals them onto the launcher task regardless of which thread the
//! transport delivers them on.

use std::fmt;

use bitflags::bitflags;

use crate::error::Result;

/// The identity a worker process reports once its reply channel is set up.
/// Zero is reserved for "setup has not completed".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("pid {_0}")]
pub struct Pid(u32);

impl Pid {
    /// Wraps a raw worker identity as reported by the transport.
    pub fn new(raw: u32) -> Self {
        Pid(raw)
    }

    /// The raw worker identity.
    pub fn get(&self) -> u32 {
        self.0
    }
}

/// One of the four overlapping binding levels a connection can hold. Each
/// level expresses a target OS importance for the worker; the transport maps
/// the level to concrete OS flags via [`BindingLevel::platform_flags`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingLevel {
    /// Held from start until the embedder clears its pending-view boost.
    Initial,
    /// Held (refcounted) while the worker backs a visible surface.
    Strong,
    /// Held while the worker sits in the recently-foreground pool.
    Moderate,
    /// Held for the whole live lifetime; carries no OOM protection.
    Waived,
}

impl BindingLevel {
    /// The OS bind-flag word this level maps to on the current platform.
    pub fn platform_flags(&self) -> BindFlags {
        match self {
            BindingLevel::Initial => BindFlags::AUTO_CREATE,
            BindingLevel::Strong => BindFlags::AUTO_CREATE | BindFlags::IMPORTANT,
            BindingLevel::Moderate => BindFlags::AUTO_CREATE,
            BindingLevel::Waived => BindFlags::AUTO_CREATE | BindFlags::WAIVE_PRIORITY,
        }
    }
}

bitflags! {
    /// OS-level service bind flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BindFlags: u32 {
        /// Create the service process if it is not already running.
        const AUTO_CREATE = 0b001;
        /// Mark the bound process as important to the host OS.
        const IMPORTANT = 0b010;
        /// Waive any importance the bind would otherwise confer.
        const WAIVE_PRIORITY = 0b100;
    }
}

/// Describes a worker class: how many instances are declared and how their
/// concrete service names are derived. Slot `i` of the class resolves to
/// `{package_name}/{class_name_prefix}{i}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// The package hosting the worker binaries.
    pub package_name: String,
    /// The per-class prefix the slot index is appended to.
    pub class_name_prefix: String,
    /// The number of declared instances of this class.
    pub count: usize,
}

impl ServiceDescriptor {
    /// The service name for a slot of this class.
    pub(crate) fn service_name(&self, index: usize) -> ServiceName {
        ServiceName {
            package_name: self.package_name.clone(),
            class_name_prefix: self.class_name_prefix.clone(),
            index,
        }
    }

    pub(crate) fn owns(&self, service: &ServiceName) -> bool {
        service.package_name == self.package_name
            && service.class_name_prefix == self.class_name_prefix
    }
}

/// The opaque name of one worker service instance: a class plus a slot index.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceName {
    pub(crate) package_name: String,
    pub(crate) class_name_prefix: String,
    pub(crate) index: usize,
}

impl ServiceName {
    /// The package hosting the worker binary.
    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    /// The slot index within the worker class.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}{}",
            self.package_name, self.class_name_prefix, self.index
        )
    }
}

/// Binds and unbinds binding levels for worker services.
///
/// Implementations wrap the host OS transport. `bind` is called at most once
/// per (service, level) while that level is unbound, and `unbind` at most
/// once per (service, level) while it is bound; the core performs the
/// flag-diffing that guarantees this. Both are called from the launcher task
/// and must not block.
pub trait ServiceBinder: Send + Sync + fmt::Debug + 'static {
    /// Bind `level` for `service`. An error here is fatal for the spawn in
    /// flight on that service; errors on later re-binds are logged and the
    /// level treated as unbound.
    fn bind(&self, service: &ServiceName, level: BindingLevel) -> Result<()>;

    /// Unbind `level` for `service`. Unbinding never fails.
    fn unbind(&self, service: &ServiceName, level: BindingLevel);
}

/// The reply channel to a live worker process, handed to the core by the
/// transport when it reports the channel established.
///
/// Both methods are fire-and-forget; replies arrive through [`ChannelEvents`](crate::ChannelEvents)
/// keyed by service name.
pub trait ChildChannel: Send + Sync + fmt::Debug + 'static {
    /// Ask the worker whether it is already bound to a different host
    /// instance. The transport answers via [`ChannelEvents::peer_identity`](crate::ChannelEvents::peer_identity).
    fn request_peer_identity(&self);

    /// Hand the setup payload to the worker. The worker answers with its
    /// identity via [`ChannelEvents::setup_complete`](crate::ChannelEvents::setup_complete).
    fn send_setup(&self, payload: crate::options::ConnectionBundles);
}

