//! Errors raised by the instrumentation layer itself.
//!
//! Errors from the wrapped driver are never converted: they travel inside
//! [`ProxyError::Delegated`] exactly as the driver produced them.

use std::fmt;

use thiserror::Error;

use crate::event::{ResourceId, ResourceKind};

/// Error type sinks may return. The recorder absorbs it.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// An operation was attempted on a proxied resource that is already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} {id} is closed")]
pub struct ClosedResourceError {
    pub id: ResourceId,
    pub kind: ResourceKind,
}

/// Error type of every instrumented resource.
#[derive(Debug, Error)]
pub enum ProxyError<E> {
    /// The wrapped resource failed.
    #[error(transparent)]
    Delegated(E),

    #[error(transparent)]
    Closed(#[from] ClosedResourceError),
}

impl<E> ProxyError<E> {
    pub fn delegated(&self) -> Option<&E> {
        match self {
            ProxyError::Delegated(error) => Some(error),
            ProxyError::Closed(_) => None,
        }
    }

    /// The driver's error, as it was returned.
    pub fn into_delegated(self) -> Option<E> {
        match self {
            ProxyError::Delegated(error) => Some(error),
            ProxyError::Closed(_) => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ProxyError::Closed(_))
    }
}

/// `install` was given a source that is already instrumented.
///
/// The rejected source is handed back through [`into_inner`](Self::into_inner).
pub struct AlreadyInstrumentedError<S> {
    inner: S,
}

impl<S> AlreadyInstrumentedError<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> fmt::Debug for AlreadyInstrumentedError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlreadyInstrumentedError").finish_non_exhaustive()
    }
}

impl<S> fmt::Display for AlreadyInstrumentedError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("data source is already instrumented")
    }
}

impl<S> std::error::Error for AlreadyInstrumentedError<S> {}
