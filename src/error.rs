use crate::model::ValueId;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("MQTT client error: {0}")]
    Mqtt(String),

    #[error("Z-Wave driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Gave up reconnecting {session} session after {attempts} attempts")]
    ReconnectExhausted {
        session: &'static str,
        attempts: u32,
    },

    #[error("Internal channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors reported synchronously by the mesh-network driver.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("driver is not connected")]
    NotConnected,

    #[error("command rejected by driver: {0}")]
    Rejected(String),

    #[error("driver I/O failure: {0}")]
    Io(String),
}

/// Terminal reason attached to a rejected or failed command.
#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    MalformedInput(String),

    #[error("unknown target {0}")]
    UnknownTarget(ValueId),

    #[error("{0} is read-only")]
    ReadOnly(ValueId),

    #[error("no confirmation after {attempts} attempts")]
    CommandTimeout { attempts: u32 },

    #[error("driver reported failure: {0}")]
    DriverFailure(String),

    #[error("mesh network went away while the command was in flight")]
    TransientNetwork,
}

/// Payload decoding failure.
#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload has no value")]
    MissingValue,

    #[error("expected {expected} value, got {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("numeric value is not finite")]
    NotFinite,
}
