//! Error types for the telemetry core

use thiserror::Error;

use crate::protocol::{CommandKind, FrameError};
use crate::sensor_link::LinkState;

/// Error type for telemetry operations
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Link I/O failure (send/receive error, closed transport)
    #[error("Link transport error: {0}")]
    LinkTransport(String),

    /// Command was not acknowledged within the configured timeout
    #[error("Protocol timeout waiting for {0} acknowledgement")]
    ProtocolTimeout(CommandKind),

    /// Frame could not be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    /// Configuration value rejected; the previous value is retained
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Template name is already present in the library
    #[error("Template '{0}' already exists")]
    DuplicateTemplateName(String),

    /// Template name is not present in the library
    #[error("Unknown template '{0}'")]
    UnknownTemplateName(String),

    /// Persisted series is malformed or not strictly time-ordered
    #[error("Corrupt persisted file at record {record}: {reason}")]
    CorruptPersistedFile { record: usize, reason: String },

    /// Command issued from a link state that cannot accept it
    #[error("Cannot {command} while {state}")]
    InvalidState { command: CommandKind, state: LinkState },

    /// Another command is still waiting for its acknowledgement
    #[error("{0} command already awaiting acknowledgement")]
    CommandInFlight(CommandKind),

    /// Gesture recording was started twice
    #[error("Gesture recording already in progress")]
    AlreadyRecording,

    /// Gesture recording was stopped without being started
    #[error("No gesture recording in progress")]
    NotRecording,

    /// File system error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON / CSV (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Link worker thread is gone
    #[error("Link worker has stopped")]
    WorkerStopped,
}

impl From<serde_json::Error> for TelemetryError {
    fn from(e: serde_json::Error) -> Self {
        TelemetryError::Serialization(e.to_string())
    }
}

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;
