use std::io;

use thiserror::Error;

/// Errors thay may occur in this library.
#[derive(Debug, Error)]
pub enum Error {
    /// The helper tool could not be started.
    #[error("Could not start `{command}`: {source}")]
    Spawn {
        /// The command line which failed.
        command: String,

        /// What went wrong.
        #[source]
        source: io::Error,
    },

    /// Reading from or writing to a tool (or a socket) failed.
    #[error("Underlying IO problem: {0}")]
    Io(#[from] io::Error),

    /// The tool's input is closed: a write made no progress.
    #[error("Tool input is closed, could not send command")]
    InputClosed,

    /// The tool closed its output.
    #[error("Tool output closed")]
    OutputClosed,

    /// The client was asked to do something before being started.
    #[error("Client `{0}` has not been started")]
    NotStarted(String),

    /// The client's process is gone, or its decode loop has stopped
    /// and the reason was already reported.
    #[error("Client `{0}` is dead")]
    Dead(String),

    /// A value could not be turned into JSON.
    #[error("JSON problem: {0}")]
    Json(#[from] serde_json::Error),

    /// The tool's output was not valid JSON, or a value grew too large.
    #[error("Could not decode message from tool: {0}")]
    Decode(String),

    /// A message was valid JSON, but broke the protocol.
    /// For example an `add` event without a port.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// No reply arrived in time.
    #[error("timeout waiting for message")]
    Timeout {
        /// The event type which was awaited.
        expected: String,
    },

    /// A reply arrived, but not the one we asked for.
    #[error("communication out of sync, expected '{expected}', received '{received}'")]
    OutOfSync {
        /// The awaited event type.
        expected: String,

        /// The event type which arrived instead.
        received: String,
    },

    /// The tool replied to a command, and said it failed.
    #[error("command failed: {message}")]
    CommandFailed {
        /// The event type of the failed command.
        command: String,

        /// Whatever the tool reported.
        message: String,
    },

    /// The monitor tool speaks a newer protocol than we do.
    #[error("protocol version not supported: requested {requested}, got {got}")]
    UnsupportedProtocolVersion {
        /// The version we asked for.
        requested: u32,

        /// The version the tool replied with.
        got: u32,
    },

    /// A monitor was asked to open a port using a protocol it does not handle.
    #[error("invalid monitor protocol '{requested}': only '{supported}' is accepted")]
    UnsupportedProtocol {
        /// What the caller asked for.
        requested: String,

        /// What the tool described (empty if DESCRIBE never ran).
        supported: String,
    },

    /// A discovery with the same ID is already registered.
    #[error("pluggable discovery already added: {0}")]
    DuplicateDiscovery(String),

    /// Starting a discovery failed.
    #[error("starting discovery {id}: {source}")]
    DiscoveryStart {
        /// The discovery which failed.
        id: String,

        /// What went wrong.
        #[source]
        source: Box<Error>,
    },

    /// The user did something which is not valid.
    /// For example, starting sync mode twice.
    #[error("The request did not conform to valid usage. Problem: `{0}`")]
    BadUsage(String),

    /// A configuration could not be parsed, or did not validate.
    #[error("Bad configuration: {0}")]
    BadConfig(String),
}

impl Error {
    /// Unwrap the problem of a bad configuration,
    /// or give back the error if it was something else.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(problem) = self {
            Ok(problem)
        } else {
            Err(self)
        }
    }

    /// Unwrap the tool's message of a failed command,
    /// or give back the error if it was something else.
    pub fn try_into_command_failed(self) -> Result<String, Self> {
        if let Self::CommandFailed { message, .. } = self {
            Ok(message)
        } else {
            Err(self)
        }
    }

    /// True if this error means no reply arrived in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
