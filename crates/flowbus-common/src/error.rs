use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error types covering transport failures, command verification, and configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FlowError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or short response from the instrument.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The serial link or its master connection is gone.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No response within the configured response timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The instrument answered with a non-zero status code.
    #[error("device status {code}: {message}")]
    DeviceStatus {
        /// Status code reported by the instrument.
        code: u8,
        /// Human readable description.
        message: String,
    },

    /// Readback after a write did not match the written value.
    #[error("verification failed for {parameter}: wrote {expected}, read {actual}")]
    VerificationFailed {
        /// Parameter name.
        parameter: String,
        /// Value that was written.
        expected: String,
        /// Value that was read back.
        actual: String,
    },

    /// The address is temporarily disabled after an error streak.
    #[error("address {address} disabled after {consecutive} consecutive errors")]
    AddressDisabled {
        /// Instrument address.
        address: u8,
        /// Length of the error streak.
        consecutive: u32,
    },

    /// Argument outside its valid range.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The port is not known to the manager.
    #[error("unknown port: {0}")]
    UnknownPort(String),

    /// The command queue of a port is full.
    #[error("command queue full for port {0}")]
    QueueFull(String),

    /// The port worker has stopped and no longer accepts requests.
    #[error("port worker stopped: {0}")]
    WorkerStopped(String),

    /// Invalid health state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

/// Convenience type alias for flowbus operations.
pub type FlowResult<T> = Result<T, FlowError>;

/// Coarse error classification carried by error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed response, short read.
    Transient,
    /// Link failure; the master connection was recreated.
    ConnectionLost,
    /// No answer within the response timeout.
    Timeout,
    /// Instrument rejected the request.
    DeviceStatus,
    /// Readback mismatch or fluid switch that never converged.
    Verification,
    /// Error streak crossed the disable threshold.
    AddressDisabled,
    /// Caller supplied an invalid value.
    InvalidInput,
    /// Anything else (configuration, stopped worker, queue overflow).
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transient => "transient",
            Self::ConnectionLost => "connection_lost",
            Self::Timeout => "timeout",
            Self::DeviceStatus => "device_status",
            Self::Verification => "verification",
            Self::AddressDisabled => "address_disabled",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl FlowError {
    /// Classify this error for event reporting.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) => ErrorKind::Transient,
            Self::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::DeviceStatus { .. } => ErrorKind::DeviceStatus,
            Self::VerificationFailed { .. } => ErrorKind::Verification,
            Self::AddressDisabled { .. } => ErrorKind::AddressDisabled,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Config(_)
            | Self::UnknownPort(_)
            | Self::QueueFull(_)
            | Self::WorkerStopped(_)
            | Self::InvalidStateTransition { .. } => ErrorKind::Internal,
        }
    }

    /// Build a [`FlowError::ConnectionLost`] from an I/O error, or a
    /// [`FlowError::Timeout`] when the I/O error is a timeout.
    #[must_use]
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::TimedOut | Io::WouldBlock => Self::Timeout(format!("{context}: {err}")),
            Io::UnexpectedEof | Io::InvalidData => Self::Protocol(format!("{context}: {err}")),
            _ => Self::ConnectionLost(format!("{context}: {err}")),
        }
    }
}
