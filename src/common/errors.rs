use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::utils::security::ValidationError;

/// Process-level failures. These end the server or client process.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Cannot connect to server at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Cannot listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Shared folder {path} is not usable: {source}")]
    SharedFolder {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reported to the operator; the refused connection is closed.
    #[error("Capacity exceeded: {limit} sessions already active, refusing {peer}")]
    CapacityExceeded { limit: usize, peer: SocketAddr },
}

/// Framing failures on a single connection.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Token is {len} bytes, frame holds {limit}")]
    TokenTooLong { len: usize, limit: usize },

    #[error("Token is not valid UTF-8")]
    InvalidToken,

    #[error("Timed out waiting for peer")]
    Timeout,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures of one transfer pass.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("File not found: {path}")]
    FileNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read {path}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot create {path}")]
    FileCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {path}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Refusing file name {name:?}: {source}")]
    InvalidName {
        name: String,
        #[source]
        source: ValidationError,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),
}

impl TransferError {
    /// Local errors are contained in one request; the connection stays usable.
    pub fn is_local(&self) -> bool {
        !matches!(self, TransferError::Transport(_))
    }

    pub fn invalid_name(name: &str, source: ValidationError) -> Self {
        TransferError::InvalidName {
            name: name.to_string(),
            source,
        }
    }
}

impl From<CodecError> for TransferError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => TransferError::Transport(e),
            CodecError::Timeout => TransferError::Transport(io::ErrorKind::TimedOut.into()),
            other => TransferError::Transport(io::Error::new(io::ErrorKind::InvalidData, other)),
        }
    }
}

/// Failures that end, or are logged by, one session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Unrecognized command: {0:?}")]
    UnrecognizedCommand(String),

    #[error("Cannot list {path}")]
    Listing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Receive loop has stopped")]
    ReceiverStopped,
}
