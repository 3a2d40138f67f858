use crate::raft::NodeID;

use serde::{Deserialize, Serialize};

/// Raft core errors. These are serializable, since client errors are returned
/// to callers via `Message::ClientResponse`.
///
/// Protocol-internal failures (stale terms, log mismatches, peer timeouts,
/// aborted snapshot transfers) are not errors: they are carried as messages
/// and recovered from within the protocol. Only the variants below ever leave
/// a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was aborted and must be retried. This happens e.g. when a
    /// leadership transfer is in progress or fails.
    Abort,
    /// A membership change was requested while another one is still pending,
    /// or before the leader has committed an entry in its own term.
    ConflictingReconfigure,
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
    /// Invalid user input, typically an invalid configuration change.
    InvalidInput(String),
    /// An IO error.
    IO(String),
    /// The request was submitted to a node that is not the leader. Contains
    /// the leader known to the node, if any, so the caller can retry there.
    NotLeader(Option<NodeID>),
    /// No handler is registered for an RPC kind.
    Unhandled(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Abort => write!(f, "operation aborted"),
            Error::ConflictingReconfigure => write!(f, "another configuration change is pending"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NotLeader(Some(leader)) => write!(f, "not leader, try leader {leader}"),
            Error::NotLeader(None) => write!(f, "not leader, no known leader"),
            Error::Unhandled(kind) => write!(f, "no handler registered for {kind}"),
        }
    }
}

impl Error {
    /// Returns whether the error is considered deterministic. Client request
    /// errors of deterministic kinds can be returned as-is, while others mean
    /// the request may or may not have been applied.
    pub fn is_deterministic(&self) -> bool {
        match self {
            Error::ConflictingReconfigure | Error::InvalidInput(_) | Error::NotLeader(_) => true,
            Error::Abort | Error::InvalidData(_) | Error::IO(_) | Error::Unhandled(_) => false,
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A raftcore Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}
