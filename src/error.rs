//! Error types and error handling strategy for shoal.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Startup errors (configuration, handshake, initializer failures)
//!   propagate as `Result` to the runtime entry point
//! - In-loop scheduling corruption is fatal, never propagated: continuing
//!   would risk dispatching a thread twice or losing one
//! - Empty queues and failed steal attempts are normal control flow, not
//!   errors, and never appear here

use core::fmt;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Configuration file is missing, unreadable, or malformed.
    ConfigError,
    /// The core-allocation authority rejected the startup handshake.
    HandshakeRejected,
    /// The core-allocation authority could not be reached.
    ///
    /// During steady-state renegotiation this is recoverable: the runtime
    /// freezes its current core count rather than guessing.
    AuthorityUnreachable,
    /// An application-supplied initializer phase reported failure.
    InitFailed,
    /// Internal runtime error (bug).
    Internal,
}

impl ErrorKind {
    /// Returns a static description of the error kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigError => "configuration error",
            Self::HandshakeRejected => "core grant handshake rejected",
            Self::AuthorityUnreachable => "core authority unreachable",
            Self::InitFailed => "initializer failed",
            Self::Internal => "internal runtime error",
        }
    }

    /// Returns true if the runtime may continue in a degraded mode after
    /// observing this error (as opposed to aborting startup).
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        matches!(self, Self::AuthorityUnreachable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A runtime error with a kind and an optional detail message.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
}

impl Error {
    /// Creates a new error with no detail message.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Creates a new error with a detail message.
    #[must_use]
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the detail message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {msg}", self.kind),
            None => self.kind.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message() {
        let err = Error::with_message(ErrorKind::ConfigError, "line 3: bad value");
        let text = err.to_string();
        assert!(text.contains("configuration error"), "{text}");
        assert!(text.contains("line 3"), "{text}");
    }

    #[test]
    fn display_without_message_is_kind_only() {
        let err = Error::new(ErrorKind::HandshakeRejected);
        assert_eq!(err.to_string(), "core grant handshake rejected");
    }

    #[test]
    fn only_authority_loss_is_recoverable() {
        assert!(ErrorKind::AuthorityUnreachable.is_recoverable());
        assert!(!ErrorKind::ConfigError.is_recoverable());
        assert!(!ErrorKind::HandshakeRejected.is_recoverable());
        assert!(!ErrorKind::InitFailed.is_recoverable());
    }
}
