//! Lifecycle events emitted by a [`Launcher`](crate::Launcher).
//!
//! Events are delivered to an optional embedder-supplied handler and, at
//! debug level, as tracing events. Handlers must not block: events are
//! emitted from the launcher task.

use std::{fmt, sync::Arc};

use derive_where::derive_where;

use crate::binder::{Pid, ServiceName};

/// Event emitted when a spawn request is handed a slot and its service is
/// bound for the first time.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionAllocatedEvent {
    /// The service instance the spawn was allocated.
    pub service: ServiceName,
}

/// Event emitted when a spawn request found no free slot and was queued.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct SpawnQueuedEvent {
    /// Whether the request targeted the sandboxed worker class.
    pub sandboxed: bool,
    /// The number of requests now waiting, including this one.
    pub queue_length: usize,
}

/// Event emitted when a worker finishes setup and reports its identity.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    /// The service instance backing the worker.
    pub service: ServiceName,
    /// The worker identity assigned during setup.
    pub pid: Pid,
}

/// The reasons a connection can die.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The embedder stopped the worker.
    Stopped,
    /// The transport reported the channel lost.
    ChannelLost,
    /// The worker could not be started, either because the transport
    /// refused the bind or because the worker was already serving another
    /// host instance.
    StartFailed,
    /// The launcher itself shut down.
    LauncherClosed,
}

/// Event emitted when a connection dies. Fired at most once per connection.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The service instance the worker was bound on.
    pub service: ServiceName,
    /// The worker identity, if setup had completed.
    pub pid: Option<Pid>,
    /// Why the connection died.
    pub reason: ConnectionClosedReason,
}

/// Event emitted when a spare connection is warmed up.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct SpareWarmedEvent {
    /// The service instance held by the spare.
    pub service: ServiceName,
}

/// Event emitted when a spawn request consumes the warmed spare.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct SpareConsumedEvent {
    /// The service instance handed over to the spawn.
    pub service: ServiceName,
}

/// Event emitted when the launcher worker exits.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct LauncherClosedEvent {}

/// A launcher lifecycle event.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum LauncherEvent {
    /// A spawn was handed a slot.
    ConnectionAllocated(ConnectionAllocatedEvent),
    /// A spawn was queued behind a full pool.
    SpawnQueued(SpawnQueuedEvent),
    /// A worker completed setup.
    ConnectionReady(ConnectionReadyEvent),
    /// A connection died.
    ConnectionClosed(ConnectionClosedEvent),
    /// A spare connection was warmed.
    SpareWarmed(SpareWarmedEvent),
    /// The warmed spare was consumed by a spawn.
    SpareConsumed(SpareConsumedEvent),
    /// The launcher shut down.
    LauncherClosed(LauncherClosedEvent),
}

macro_rules! from_event {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for LauncherEvent {
            fn from(event: $ty) -> Self {
                LauncherEvent::$variant(event)
            }
        }
    };
}

from_event!(ConnectionAllocatedEvent, ConnectionAllocated);
from_event!(SpawnQueuedEvent, SpawnQueued);
from_event!(ConnectionReadyEvent, ConnectionReady);
from_event!(ConnectionClosedEvent, ConnectionClosed);
from_event!(SpareWarmedEvent, SpareWarmed);
from_event!(SpareConsumedEvent, SpareConsumed);
from_event!(LauncherClosedEvent, LauncherClosed);

/// Process [`LauncherEvent`]s.
pub trait LauncherEventHandler: Send + Sync {
    /// Handle an event. Must not block.
    fn handle_event(&self, event: LauncherEvent);
}

impl<F> LauncherEventHandler for F
where
    F: Fn(LauncherEvent) + Send + Sync,
{
    fn handle_event(&self, event: LauncherEvent) {
        self(event)
    }
}

/// Responsible for emitting events to a user-specified handler and as
/// tracing events.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct LauncherEventEmitter {
    #[derive_where(skip)]
    handler: Option<Arc<dyn LauncherEventHandler>>,
}

impl LauncherEventEmitter {
    pub(crate) fn new(handler: Option<Arc<dyn LauncherEventHandler>>) -> Self {
        Self { handler }
    }

    /// Emit the event generated by `generate`, lazily, so that callers pay
    /// nothing when neither a handler nor a debug subscriber is installed.
    pub(crate) fn emit_event<F>(&self, generate: F)
    where
        F: FnOnce() -> LauncherEvent,
    {
        if self.handler.is_none() && !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        let event = generate();
        tracing::debug!(event = ?event, "launcher lifecycle event");
        if let Some(ref handler) = self.handler {
            handler.handle_event(event);
        }
    }
}

impl fmt::Display for ConnectionClosedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionClosedReason::Stopped => "stopped",
            ConnectionClosedReason::ChannelLost => "channel lost",
            ConnectionClosedReason::StartFailed => "start failed",
            ConnectionClosedReason::LauncherClosed => "launcher closed",
        };
        f.write_str(label)
    }
}
