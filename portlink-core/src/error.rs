use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Error domain shared by every portlink crate.
///
/// The reliable channel's public API reports success as a boolean and keeps
/// the most recent `Error` retrievable for diagnostics; these variants are
/// the semantic categories that surface there.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Invalid parameters rejected at initialization time.
    #[error("config: {0}")]
    Config(String),
    /// The underlying byte pipe refused a write or went away mid-session.
    #[error("transport: {0}")]
    Transport(String),
    /// A malformed or out-of-contract frame. Counted and dropped; the
    /// session survives isolated occurrences.
    #[error("protocol: {0}")]
    Protocol(String),
    /// Retries exhausted, handshake expired, or peer liveness lost.
    #[error("timeout: {0}")]
    Timeout(String),
    /// A disconnect raced the operation.
    #[error("cancelled")]
    Cancelled,
    #[error("io: {0}")]
    Io(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}

// File streaming funnels std::io failures into the shared domain. The
// message keeps the io::ErrorKind so diagnostics stay actionable.
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
