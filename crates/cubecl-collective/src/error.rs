use crate::backtrace::BackTrace;
use alloc::string::{String, ToString};
use thiserror::Error;

/// Result type used by every fallible operation of a process group.
pub type Result<T> = core::result::Result<T, CollectiveError>;

/// Errors that can happen while issuing or waiting on collective operations.
#[derive(Error, Clone)]
pub enum CollectiveError {
    /// The call was rejected before any device work was issued.
    #[error("A precondition of the collective call isn't met\nCaused by:\n  {reason}\nBacktrace:\n{backtrace}")]
    Precondition {
        /// The precondition that failed.
        reason: String,
        /// The captured backtrace.
        backtrace: BackTrace,
    },

    /// The communication library or the device runtime reported a failure.
    ///
    /// Library errors are never retried. Devices already issued inside the same group bracket may
    /// have partially executed the operation.
    #[error("The communication library reported a fatal error\nCaused by:\n  {reason}\nBacktrace:\n{backtrace}")]
    Library {
        /// The error reported by the library.
        reason: String,
        /// The captured backtrace.
        backtrace: BackTrace,
    },

    /// The element type or the reduction can't be expressed by the communication library.
    #[error("Unimplemented\nCaused by:\n  {reason}\nBacktrace:\n{backtrace}")]
    Unimplemented {
        /// What isn't supported.
        reason: String,
        /// The captured backtrace.
        backtrace: BackTrace,
    },

    /// A task didn't complete before the enforced timeout.
    #[error("The task didn't complete after {elapsed_ms} ms (timeout of {timeout_ms} ms)")]
    Timeout {
        /// The timeout that was requested.
        timeout_ms: u128,
        /// The time spent waiting.
        elapsed_ms: u128,
    },

    /// The rendezvous store failed.
    #[error("The rendezvous store failed\nCaused by:\n  {0}")]
    Store(#[from] StoreError),
}

impl core::fmt::Debug for CollectiveError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{self}"))
    }
}

impl CollectiveError {
    /// Create a new [precondition](CollectiveError::Precondition) error.
    pub fn precondition(reason: impl ToString) -> Self {
        Self::Precondition {
            reason: reason.to_string(),
            backtrace: BackTrace::capture(),
        }
    }

    /// Create a new [library](CollectiveError::Library) error.
    pub fn library(reason: impl ToString) -> Self {
        Self::Library {
            reason: reason.to_string(),
            backtrace: BackTrace::capture(),
        }
    }

    /// Create a new [unimplemented](CollectiveError::Unimplemented) error.
    pub fn unimplemented(reason: impl ToString) -> Self {
        Self::Unimplemented {
            reason: reason.to_string(),
            backtrace: BackTrace::capture(),
        }
    }

    /// Whether the error was raised before any device work was issued.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }
}

/// Errors reported by a rendezvous [store](crate::store::Store).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No value was published under the key before the store's own timeout.
    #[error("Timed out waiting for key `{key}`")]
    Timeout {
        /// The key that was waited on.
        key: String,
    },
    /// The store can't be reached anymore.
    #[error("The store is closed")]
    Closed,
}

/// Ensure a precondition holds, returning a [precondition](CollectiveError::Precondition) error
/// otherwise.
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::CollectiveError::precondition(alloc::format!($($arg)+)));
        }
    };
}

pub(crate) use ensure;

#[cfg(test)]
mod tests {
    use super::*;

    fn check(value: usize) -> Result<usize> {
        ensure!(value < 4, "value {value} is out of range");
        Ok(value)
    }

    #[test]
    fn ensure_returns_precondition() {
        let err = check(5).unwrap_err();

        assert!(err.is_precondition());
        assert!(format!("{err}").contains("value 5 is out of range"));
    }

    #[test]
    fn store_error_converts() {
        let err: CollectiveError = StoreError::Closed.into();

        assert!(matches!(err, CollectiveError::Store(StoreError::Closed)));
    }
}
