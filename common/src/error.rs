use std::fmt;

/// Error type shared by every component of the `cluster-synchro` core.
///
/// Two wrapper variants carry error-identity markers: callers test for
/// them via [`Error::is_recoverable`] and [`Error::is_retryable`] rather
/// than matching on message text or on the wrapped variant's shape.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),

    /// Marks the inner error as transient and safe to retry without
    /// operator intervention (the storage layer's "recoverable" marker).
    #[error("recoverable: {0}")]
    Recoverable(Box<Error>),

    /// Marks a constructor failure the caller should reschedule rather
    /// than treat as fatal.
    #[error("retryable: {0}")]
    Retryable(Box<Error>),
}

impl Error {
    pub fn recoverable(self) -> Self {
        Error::Recoverable(Box::new(self))
    }

    pub fn retryable(self) -> Self {
        Error::Retryable(Box::new(self))
    }

    /// Tests the recoverable marker by identity, not by message or by
    /// re-deriving it from the wrapped variant.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Recoverable(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retryable(_))
    }

    /// The error as it would be surfaced in a status condition's message
    /// field: unwraps the marker wrappers so operators see the underlying
    /// cause, not `"recoverable: recoverable: ..."`.
    pub fn display_message(&self) -> String {
        match self {
            Error::Recoverable(inner) | Error::Retryable(inner) => inner.display_message(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Coarse classification used only for metrics labels — never for control
/// flow (control flow always goes through `is_recoverable`/`is_retryable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Kube,
    Discovery,
    Negotiation,
    Storage,
    Config,
    Other,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Kube { .. } => ErrorClass::Kube,
            Error::Discovery(_) => ErrorClass::Discovery,
            Error::Negotiation(_) => ErrorClass::Negotiation,
            Error::Storage(_) => ErrorClass::Storage,
            Error::Config(_) => ErrorClass::Config,
            Error::Other(_) => ErrorClass::Other,
            Error::Recoverable(inner) | Error::Retryable(inner) => inner.class(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
