//! Error taxonomy at the boundary of each policy (see `SPEC_FULL.md` §6/§7).

use std::fmt;
use thiserror::Error;

/// The error surface of [`crate::circuit_breaker::CircuitBreaker::call`].
///
/// The breaker never fabricates a wrapped error on its own: `Wrapped`
/// carries the caller's `op` error verbatim, `Open` is the breaker's own
/// rejection. `E` is left unconstrained so any `op` error type can be
/// wrapped; `std::error::Error` is implemented for this type only when `E`
/// itself implements it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerCallError<E> {
    /// The breaker is open (or the `HalfOpen` probe slot was already taken)
    /// and the call was rejected without running `op`.
    Open,
    /// `op` ran and failed with `E`.
    Wrapped(E),
}

impl<E: fmt::Display> fmt::Display for CircuitBreakerCallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "circuit breaker is open"),
            Self::Wrapped(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerCallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open => None,
            Self::Wrapped(e) => Some(e),
        }
    }
}

/// The error surface of [`crate::bulkhead::Bulkhead::call`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkheadError<E> {
    /// `op` ran and failed with `E`.
    CallFailed(E),
    /// Both the in-flight slots and the queue were saturated; `op` never ran.
    BulkheadRejection,
}

impl<E: fmt::Display> fmt::Display for BulkheadError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallFailed(e) => write!(f, "{e}"),
            Self::BulkheadRejection => write!(f, "bulkhead is saturated"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BulkheadError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CallFailed(e) => Some(e),
            Self::BulkheadRejection => None,
        }
    }
}

/// Construction-time validation failure for any policy's config struct.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A field was out of the valid range documented on its config struct.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// The offending field's name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
