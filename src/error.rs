//! Error types for the Modbus client engine
//!
//! All failures surface to the caller of the operation that triggered them.
//! The enum is `Clone` so a single connection-level failure can reject every
//! outstanding transaction with the same error.

use thiserror::Error;

/// Result type for modbus-link operations
pub type ModbusResult<T> = std::result::Result<T, ModbusError>;

/// Modbus client errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// Input rejected before anything was sent on the wire
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation attempted while no transport is established
    #[error("Not connected")]
    NotConnected,

    /// Transport dropped while the request was outstanding
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection-level failure (refused, unreachable, attempt failed)
    #[error("Connection error: {0}")]
    Connection(String),

    /// No matching response arrived before the deadline
    #[error("Request timeout after {0} ms")]
    Timeout(u64),

    /// Remote device answered with a protocol-level exception
    #[error("Modbus exception {code}: {}", exception_description(*.code))]
    Exception {
        /// Exception code reported by the device
        code: u8,
    },

    /// Malformed or unexpected protocol traffic
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Response PDU could not be decoded
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Transport I/O failure
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::Io(err.to_string())
    }
}

impl ModbusError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ModbusError::Validation(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        ModbusError::Connection(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ModbusError::Protocol(msg.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        ModbusError::InvalidData(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        ModbusError::Io(msg.into())
    }

    pub fn exception(code: u8) -> Self {
        ModbusError::Exception { code }
    }
}

/// Standard meaning of a Modbus exception code
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}
