//! # Modbus Link - Async Modbus TCP Client Engine
//!
//! An asynchronous Modbus TCP client built on Tokio for industrial
//! automation and IoT applications. The engine multiplexes any number of
//! concurrent requests over a single connection, correlating each response
//! back to its caller by transaction id, and recovers from transport
//! failures through a configurable reconnection policy.
//!
//! ## Features
//!
//! - **Concurrent requests**: every in-flight request carries its own
//!   transaction id and timeout; completions may arrive in any order
//! - **Robust framing**: reassembly is correct regardless of how TCP
//!   chunks the stream (split or merged frames)
//! - **Automatic reconnection**: fixed-interval by default, replaceable
//!   with exponential backoff or a custom policy
//! - **Lifecycle events**: optional broadcast notifications for connect,
//!   disconnect, and connection-level errors
//!
//! ## Supported Function Codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x01 | Read Coils |
//! | 0x02 | Read Discrete Inputs |
//! | 0x03 | Read Holding Registers |
//! | 0x04 | Read Input Registers |
//! | 0x05 | Write Single Coil |
//! | 0x06 | Write Single Register |
//! | 0x0F | Write Multiple Coils |
//! | 0x10 | Write Multiple Registers |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_link::{ClientConfig, ModbusResult, ModbusTcpClient};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let client = ModbusTcpClient::new(ClientConfig::new("127.0.0.1", 502));
//!     client.connect().await?;
//!
//!     // Read 10 holding registers starting at address 0
//!     let registers = client.read_holding_registers(0, 10).await?;
//!     println!("Registers: {:?}", registers);
//!
//!     // Set a coil and write a register
//!     client.write_single_coil(0, true).await?;
//!     client.write_single_register(100, 0x1234).await?;
//!
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on the official specification
pub mod constants;

/// Request PDU encoding and response decoding
pub mod pdu;

/// MBAP framing and stream reassembly
pub mod frame;

/// Transaction id allocation and request/response correlation
pub mod transaction;

/// Connection lifecycle management and reconnection
pub mod connection;

/// Client configuration
pub mod config;

/// High-level Modbus TCP client
pub mod client;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Core client API ===
pub use client::ModbusTcpClient;
pub use config::ClientConfig;

// === Error handling ===
pub use error::{exception_description, ModbusError, ModbusResult};

// === Lifecycle ===
pub use connection::{
    ConnectionState, ExponentialBackoff, FixedInterval, LinkEvent, ReconnectPolicy,
};

// === Protocol types ===
pub use frame::{Frame, MbapHeader};
pub use pdu::{FunctionCode, ResponseData};

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};

/// Default per-request timeout (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = constants::DEFAULT_TIMEOUT_MS;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = constants::DEFAULT_TCP_PORT;

/// Default reconnect interval (5 seconds)
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = constants::DEFAULT_RECONNECT_INTERVAL_MS;
