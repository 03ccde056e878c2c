use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Null or invalid argument, or a tracker of the wrong direction
    #[error("Argument error: {0}")]
    Argument(String),

    /// No valid source or destination is reachable
    #[error("State error: {0}")]
    State(String),

    /// Address format, rule application, store or decode failure
    #[error("{0}")]
    Generic(String),

    /// Connector/listener creation or TLS/SASL credential failure
    #[error("Network error: {0}")]
    Network(String),

    /// A blocking wait exceeded its deadline
    #[error("Timed out")]
    Timeout,

    /// A blocking wait was broken by an external wakeup
    #[error("Interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of an operation that drives the event loop.
///
/// A non-blocking messenger reports `InProgress` instead of timing out:
/// the caller should try again later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Complete,
    InProgress,
}

impl Progress {
    pub fn is_complete(self) -> bool {
        matches!(self, Progress::Complete)
    }
}
