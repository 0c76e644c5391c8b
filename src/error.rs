//! Contains the `Error` and `Result` types that `child-launcher` uses.

use thiserror::Error;

use crate::binder::ServiceName;

/// The result type for all methods that can return an error in the
/// `child-launcher` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `child-launcher` crate. The inner
/// [`ErrorKind`] is boxed to keep the type cheap to move through channels.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
        }
    }

    /// Creates a configuration error raised while constructing a launcher.
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        ErrorKind::Configuration {
            message: message.into(),
        }
        .into()
    }

    /// Creates an error for a transport-level bind rejection.
    pub(crate) fn bind_failure(service: &ServiceName, message: impl Into<String>) -> Self {
        ErrorKind::Bind {
            service: service.to_string(),
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn shutdown() -> Self {
        ErrorKind::Shutdown.into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    /// Whether this error was caused by the transport rejecting a bind.
    pub fn is_bind_failure(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Bind { .. })
    }

    /// Whether this error was caused by the launcher having shut down.
    pub fn is_shutdown(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Shutdown)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The launcher was constructed with an invalid configuration, e.g. a
    /// worker class whose service descriptor declares no instances. This is
    /// the only error surfaced from a constructor; everything else is
    /// reported through the channel associated with the failed operation.
    #[error("invalid launcher configuration: {message}")]
    #[non_exhaustive]
    Configuration { message: String },

    /// The OS rejected a bind for a service. Fatal for the spawn that
    /// triggered it.
    #[error("transport refused to bind {service}: {message}")]
    #[non_exhaustive]
    Bind { service: String, message: String },

    /// The launcher worker is no longer running.
    #[error("launcher has shut down")]
    #[non_exhaustive]
    Shutdown,

    /// An internal invariant was violated. Never expected during normal
    /// operation.
    #[error("internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}
