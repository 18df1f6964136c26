use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// The server for a connection could not be reached.
    Connection(String),
    /// A bind or replace would give one remote changelist two owners.
    MappingConflict(String),
    /// The operation is not allowed for the given identities.
    InvalidOperation(String),
    /// The server rejected a changelist command.
    Remote(String),
    /// The local editing surface rejected an operation.
    Surface(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The server side of a connection failed; the connection can be
    /// skipped for this cycle without affecting the others.
    pub fn is_server_side(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Remote(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(msg) => write!(f, "Connection error: {}", msg),
            Error::MappingConflict(msg) => write!(f, "Mapping conflict: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::Remote(msg) => write!(f, "Remote error: {}", msg),
            Error::Surface(msg) => write!(f, "Local surface error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
