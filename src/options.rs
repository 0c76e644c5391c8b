//! Options for constructing a [`Launcher`](crate::Launcher) and for
//! individual spawn requests.

use std::{sync::Arc, time::Duration};

use derive_where::derive_where;
use typed_builder::TypedBuilder;

use crate::{binder::ServiceDescriptor, event::LauncherEventHandler};

/// How long a stopped or disconnected connection keeps its slot before the
/// slot can be reused. The delay exists so the OS observes the unbind before
/// a new spawn can land on the same service; the exact value is a tuning
/// knob, not a contract.
pub(crate) const DEFAULT_FREE_SLOT_DELAY: Duration = Duration::from_millis(1);

/// Hysteresis before a worker that left the foreground loses its strong
/// binding. Avoids binding churn when visibility oscillates during layout or
/// animation.
pub(crate) const STRONG_REMOVAL_DELAY: Duration = Duration::from_secs(1);

/// How long after the host goes to background before the moderate-binding
/// pool is drained wholesale.
pub(crate) const MODERATE_DRAIN_DELAY: Duration = Duration::from_secs(10);

/// Memory characteristics of the host device, fixed at construction. Chosen
/// as a strategy value rather than branched on at every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostProfile {
    pub(crate) low_memory: bool,
    pub(crate) strong_removal_delay: Duration,
}

impl HostProfile {
    /// A host with enough memory that multiple workers may hold OOM
    /// protection simultaneously. Strong-binding removal is delayed to
    /// absorb visibility churn.
    pub fn regular() -> Self {
        Self {
            low_memory: false,
            strong_removal_delay: STRONG_REMOVAL_DELAY,
        }
    }

    /// A memory-constrained host: at most one worker carries OOM protection
    /// and strong bindings are dropped without hysteresis.
    pub fn low_memory() -> Self {
        Self {
            low_memory: true,
            strong_removal_delay: Duration::ZERO,
        }
    }

    /// Whether this is a memory-constrained host.
    pub fn is_low_memory(&self) -> bool {
        self.low_memory
    }
}

impl Default for HostProfile {
    fn default() -> Self {
        Self::regular()
    }
}

/// Options used to construct a [`Launcher`](crate::Launcher).
#[derive(Clone, TypedBuilder)]
#[derive_where(Debug)]
#[non_exhaustive]
pub struct LauncherOptions {
    /// The worker class used for sandboxed spawns.
    pub sandboxed_services: ServiceDescriptor,

    /// The worker class used for privileged (non-sandboxed) spawns.
    pub privileged_services: ServiceDescriptor,

    /// The memory profile of the host.
    #[builder(default)]
    pub host_profile: HostProfile,

    /// Overrides the 1 ms default delay between a connection dying and its
    /// slot becoming reusable. The slot must still not be reused before the
    /// OS has observed the unbind.
    #[builder(default, setter(strip_option))]
    pub free_slot_delay: Option<Duration>,

    /// Handler invoked for lifecycle events, in addition to the tracing
    /// events the launcher always emits.
    #[builder(default, setter(strip_option))]
    #[derive_where(skip)]
    pub event_handler: Option<Arc<dyn LauncherEventHandler>>,
}

/// Per-class creation parameters. A warmed spare connection is only handed
/// out to a spawn whose parameters match exactly.
#[derive(Clone, Debug, Default, PartialEq, Eq, TypedBuilder)]
#[non_exhaustive]
pub struct CreationParams {
    /// Overrides the package the sandboxed worker binaries are resolved in.
    #[builder(default, setter(strip_option, into))]
    pub package_name_for_sandboxed: Option<String>,

    /// Whether the sandboxed service is exported by an external package.
    #[builder(default)]
    pub is_sandboxed_service_external: bool,

    /// Whether the worker must confirm it is not already serving another
    /// host instance before setup proceeds.
    #[builder(default)]
    pub bind_to_caller_check: bool,
}

/// An opaque payload blob handed through to the worker at setup. The
/// contents (command lines, file descriptors, linker parameters) are the
/// embedder's business.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bundle(Vec<u8>);

impl Bundle {
    /// Wraps raw payload bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Bundle(bytes)
    }

    /// The raw payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// The two payload bundles delivered to a worker during setup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionBundles {
    /// Parameters that apply to the service as a whole.
    pub service_bundle: Bundle,
    /// Parameters for this particular connection.
    pub connection_bundle: Bundle,
}

/// A request to spawn a worker process.
#[derive(Clone, Debug, TypedBuilder)]
#[non_exhaustive]
pub struct SpawnData {
    /// Setup payload for the service as a whole.
    #[builder(default)]
    pub service_bundle: Bundle,

    /// Setup payload for this connection.
    #[builder(default)]
    pub connection_bundle: Bundle,

    /// Whether to spawn into the sandboxed worker class.
    pub sandboxed: bool,

    /// Whether the worker immediately backs a visible surface. Foreground
    /// spawns start with a strong binding instead of an initial one.
    #[builder(default)]
    pub foreground: bool,

    /// Class creation parameters, matched against any warmed spare.
    #[builder(default)]
    pub creation_params: CreationParams,
}

impl SpawnData {
    pub(crate) fn bundles(&self) -> ConnectionBundles {
        ConnectionBundles {
            service_bundle: self.service_bundle.clone(),
            connection_bundle: self.connection_bundle.clone(),
        }
    }
}
