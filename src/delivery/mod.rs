//! Delivery engine and transports.
//!
//! A [`DeliveryPlan`](crate::router::DeliveryPlan) lists transports in
//! attempt order. The engine runs each one under its own timeout, falls back
//! to the next on failure, and normalizes whatever went wrong into a
//! [`DeliveryError`] that the retry handler understands.

pub mod engine;
pub mod inbox;
pub mod injection;
pub mod traits;

pub use crate::config::TransportKind;
pub use engine::{DeliveryEngine, DeliveryReceipt};
pub use inbox::InboxTransport;
pub use injection::{CommandInjector, Injector, InjectionTransport};
pub use traits::{Transport, TransportReceipt};

use thiserror::Error;

/// Raw failure of a single transport attempt. Never leaves the engine.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{transport} timed out after {timeout_ms}ms")]
    Timeout {
        transport: TransportKind,
        timeout_ms: u64,
    },
    #[error("{transport} unavailable: {reason}")]
    Unavailable {
        transport: TransportKind,
        reason: String,
    },
    #[error("{transport} rejected delivery: {reason}")]
    Rejected {
        transport: TransportKind,
        reason: String,
    },
    #[error("{transport} I/O error: {source}")]
    Io {
        transport: TransportKind,
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    pub fn unavailable(transport: TransportKind, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            transport,
            reason: reason.into(),
        }
    }

    pub fn rejected(transport: TransportKind, reason: impl Into<String>) -> Self {
        Self::Rejected {
            transport,
            reason: reason.into(),
        }
    }

    /// Retrying cannot help: the target itself is unusable.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Rejected { .. } => true,
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidInput
                    | std::io::ErrorKind::NotADirectory
                    | std::io::ErrorKind::IsADirectory
            ),
            Self::Timeout { .. } | Self::Unavailable { .. } => false,
        }
    }
}

/// Outcome of a failed delivery, as seen by the retry handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self::Transient(detail.into())
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self::Permanent(detail.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::Transient(detail) | Self::Permanent(detail) => detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_split_into_permanent_and_transient() {
        let permanent = TransportError::Io {
            transport: TransportKind::Inbox,
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(permanent.is_permanent());

        let transient = TransportError::Io {
            transport: TransportKind::Inbox,
            source: std::io::Error::from(std::io::ErrorKind::WouldBlock),
        };
        assert!(!transient.is_permanent());
        assert!(!TransportError::unavailable(TransportKind::Injection, "busy").is_permanent());
        assert!(TransportError::rejected(TransportKind::Inbox, "bad name").is_permanent());
    }

    #[test]
    fn delivery_error_display_names_the_class() {
        assert_eq!(
            DeliveryError::transient("inbox timed out").to_string(),
            "transient: inbox timed out"
        );
        assert_eq!(DeliveryError::permanent("x").detail(), "x");
    }
}
