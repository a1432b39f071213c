//! Error types for the zeus master
//!
//! Library code returns these typed errors; the binary and the supervised
//! subsystems wrap them in `anyhow` at their boundary.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single duplex channel operation
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the channel")]
    Closed,

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    #[error("expected a file descriptor, none received")]
    NoDescriptor,
}

impl From<nix::errno::Errno> for ChannelError {
    fn from(errno: nix::errno::Errno) -> Self {
        ChannelError::Io(io::Error::from(errno))
    }
}

/// A message arrived but did not have the expected shape
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("expected {expected} message, got {got:?}")]
    UnexpectedMessage { expected: &'static str, got: String },

    #[error("invalid pid {0:?}")]
    InvalidPid(String),
}

/// Why a client handshake was abandoned
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("{step}: {source}")]
    Channel {
        step: &'static str,
        #[source]
        source: ChannelError,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no such command: {0}")]
    UnknownCommand(String),

    #[error("slave {0} is no longer accepting spawn requests")]
    SlaveUnavailable(String),

    #[error("writing to client terminal failed: {0}")]
    Terminal(#[source] io::Error),
}

impl HandshakeError {
    pub(crate) fn channel(step: &'static str) -> impl FnOnce(ChannelError) -> Self {
        move |source| HandshakeError::Channel { step, source }
    }
}

/// The listening socket could not be set up
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("another master is already listening on {0}")]
    AlreadyRunning(PathBuf),

    #[error("can't create listener at {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// `zeus.json` could not be turned into a process tree
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing or empty \"{0}\" entry")]
    Missing(&'static str),

    #[error("plan entry {0:?} must be an object (slave) or an array (command)")]
    InvalidPlanEntry(String),

    #[error("alias {alias:?} of {command:?} must be a string")]
    InvalidAlias { command: String, alias: String },

    #[error("command or alias {0:?} is defined more than once")]
    DuplicateCommand(String),
}
