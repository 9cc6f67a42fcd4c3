use std::{io, time::Duration};

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of the remote-login transport itself or of one of its channels.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not open a channel: {0}")]
    ChannelOpen(#[source] BoxError),
    #[error("remote side rejected the {0} request")]
    RequestRejected(&'static str),
    #[error("channel was closed by the remote side")]
    ChannelClosed,
    #[error("transport is disconnected")]
    Disconnected,
    #[error(transparent)]
    IO(#[from] io::Error),
    #[error(transparent)]
    Other(BoxError),
}

impl TransportError {
    pub fn other<E>(err: E) -> TransportError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TransportError::Other(Box::new(err))
    }
}

/// Why a command run over a channel did not succeed.
#[derive(Debug, Error)]
pub enum ExecutionFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("exited with status {0}")]
    ExitStatus(u32),
    #[error("killed by signal {0}")]
    Signal(String),
    #[error("channel closed without an exit status")]
    ExitMissing,
    #[error("no exit after {0:?}")]
    TimedOut(Duration),
}

/// Why a single file push failed.
#[derive(Debug, Error)]
pub enum TransferFailure {
    #[error("invalid file name {0:?}")]
    InvalidFileName(String),
    #[error("could not open channel: {0}")]
    ChannelOpen(#[source] TransportError),
    #[error("could not start receive command: {0}")]
    CommandStart(#[source] TransportError),
    #[error("could not stream content: {0}")]
    Write(#[source] TransportError),
    #[error("receiver exited with status {status}: {message}")]
    ExitStatus { status: u32, message: String },
    #[error("receiver closed without an exit status")]
    ExitMissing,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication failed for {user}@{host}: {reason}")]
    AuthFailure { user: String, host: String, reason: String },
    #[error("session is missing or not authenticated")]
    SessionInvalid,
    #[error("command `{command}` failed: {reason}")]
    Execution {
        command: String,
        output: String,
        #[source]
        reason: ExecutionFailure,
    },
    #[error("transfer to {path} failed: {reason}")]
    Transfer {
        path: String,
        #[source]
        reason: TransferFailure,
    },
    #[error("pseudo-terminal setup failed: {0}")]
    PtySetup(#[source] TransportError),
    #[error("shell start failed: {0}")]
    ShellStart(#[source] TransportError),
    #[error("path {0:?} escapes the home directory")]
    PathEscapesHome(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub(crate) fn execution(command: impl Into<String>, output: impl Into<String>, reason: ExecutionFailure) -> Error {
        Error::Execution {
            command: command.into(),
            output: output.into(),
            reason,
        }
    }

    pub(crate) fn transfer(path: impl Into<String>, reason: TransferFailure) -> Error {
        Error::Transfer {
            path: path.into(),
            reason,
        }
    }

    /// Whether the caller should send the user back to the login step.
    pub fn requires_login(&self) -> bool {
        matches!(self, Error::AuthFailure { .. } | Error::SessionInvalid)
    }
}

/// Failures loading a [`crate::config::TuneConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    IO(#[from] io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}
