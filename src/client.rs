//! High-level Modbus TCP client
//!
//! One method per Modbus operation. Each call validates its inputs against
//! the protocol limits (synchronously, before anything touches the wire),
//! builds the request PDU, submits it through the connection manager, and
//! unwraps the decoded response into a typed result.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use modbus_link::{ClientConfig, ModbusResult, ModbusTcpClient};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let client = ModbusTcpClient::new(ClientConfig::new("127.0.0.1", 502));
//!     client.connect().await?;
//!
//!     let registers = client.read_holding_registers(0, 10).await?;
//!     println!("Registers: {:?}", registers);
//!
//!     client.write_single_register(100, 0x1234).await?;
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState, LinkEvent, ReconnectPolicy};
use crate::constants::{
    MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{self, FunctionCode, ResponseData};

/// Async Modbus TCP client
///
/// Cheap to clone; clones share one connection and one pending-transaction
/// table, so requests from any clone are multiplexed over the same
/// transport and may be outstanding concurrently.
#[derive(Clone)]
pub struct ModbusTcpClient {
    conn: Arc<ConnectionManager>,
}

impl ModbusTcpClient {
    /// Create a client with the default fixed-interval reconnect policy
    ///
    /// No transport is opened until [`connect`](Self::connect) is called.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            conn: ConnectionManager::new(config),
        }
    }

    /// Create a client with a custom reconnect policy
    pub fn with_reconnect_policy(config: ClientConfig, policy: Box<dyn ReconnectPolicy>) -> Self {
        Self {
            conn: ConnectionManager::with_policy(config, policy),
        }
    }

    /// Establish the transport (joining an attempt already in progress)
    pub async fn connect(&self) -> ModbusResult<()> {
        self.conn.connect().await
    }

    /// Tear the transport down and disable automatic reconnection
    ///
    /// Outstanding requests are rejected with Connection-Closed. Completes
    /// as soon as teardown has been requested; it does not wait for the
    /// peer to confirm closure.
    pub async fn disconnect(&self) {
        self.conn.disconnect().await
    }

    /// Whether a transport is currently established
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Subscribe to lifecycle events (connect, disconnect, error)
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.conn.subscribe()
    }

    /// Number of requests currently awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.conn.pending_requests()
    }

    /// Connection parameters this client was built with
    pub fn config(&self) -> &ClientConfig {
        self.conn.config()
    }

    // ========================================================================
    // Read operations
    // ========================================================================

    /// Read coils (FC01)
    pub async fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        validate_quantity(quantity, MAX_READ_COILS)?;
        let pdu = pdu::encode_read(FunctionCode::ReadCoils, address, quantity);
        let response = self.conn.submit(FunctionCode::ReadCoils, pdu).await?;
        unwrap_bits(response, quantity)
    }

    /// Read discrete inputs (FC02)
    pub async fn read_discrete_inputs(
        &self,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        validate_quantity(quantity, MAX_READ_COILS)?;
        let pdu = pdu::encode_read(FunctionCode::ReadDiscreteInputs, address, quantity);
        let response = self
            .conn
            .submit(FunctionCode::ReadDiscreteInputs, pdu)
            .await?;
        unwrap_bits(response, quantity)
    }

    /// Read holding registers (FC03)
    pub async fn read_holding_registers(
        &self,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        validate_quantity(quantity, MAX_READ_REGISTERS)?;
        let pdu = pdu::encode_read(FunctionCode::ReadHoldingRegisters, address, quantity);
        let response = self
            .conn
            .submit(FunctionCode::ReadHoldingRegisters, pdu)
            .await?;
        unwrap_registers(response)
    }

    /// Read input registers (FC04)
    pub async fn read_input_registers(
        &self,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        validate_quantity(quantity, MAX_READ_REGISTERS)?;
        let pdu = pdu::encode_read(FunctionCode::ReadInputRegisters, address, quantity);
        let response = self
            .conn
            .submit(FunctionCode::ReadInputRegisters, pdu)
            .await?;
        unwrap_registers(response)
    }

    // ========================================================================
    // Write operations
    // ========================================================================

    /// Write a single coil (FC05), returning the device's resolved state
    pub async fn write_single_coil(&self, address: u16, value: bool) -> ModbusResult<bool> {
        let pdu = pdu::encode_write_single_coil(address, value);
        let response = self.conn.submit(FunctionCode::WriteSingleCoil, pdu).await?;
        match response {
            ResponseData::CoilEcho {
                address: echoed,
                value,
            } => {
                check_echo_address(address, echoed)?;
                Ok(value)
            },
            other => Err(unexpected_response(other)),
        }
    }

    /// Write a single register (FC06), returning the echoed value
    pub async fn write_single_register(&self, address: u16, value: u16) -> ModbusResult<u16> {
        let pdu = pdu::encode_write_single_register(address, value);
        let response = self
            .conn
            .submit(FunctionCode::WriteSingleRegister, pdu)
            .await?;
        match response {
            ResponseData::RegisterEcho {
                address: echoed,
                value,
            } => {
                check_echo_address(address, echoed)?;
                Ok(value)
            },
            other => Err(unexpected_response(other)),
        }
    }

    /// Write multiple coils (FC15), returning the written quantity
    pub async fn write_multiple_coils(
        &self,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<u16> {
        validate_write_count(values.len(), MAX_WRITE_COILS)?;
        let pdu = pdu::encode_write_multiple_coils(address, values);
        let response = self
            .conn
            .submit(FunctionCode::WriteMultipleCoils, pdu)
            .await?;
        unwrap_write_echo(response, address)
    }

    /// Write multiple registers (FC16), returning the written quantity
    pub async fn write_multiple_registers(
        &self,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<u16> {
        validate_write_count(values.len(), MAX_WRITE_REGISTERS)?;
        let pdu = pdu::encode_write_multiple_registers(address, values);
        let response = self
            .conn
            .submit(FunctionCode::WriteMultipleRegisters, pdu)
            .await?;
        unwrap_write_echo(response, address)
    }
}

// ============================================================================
// Validation and unwrapping helpers
// ============================================================================

fn validate_quantity(quantity: u16, max: usize) -> ModbusResult<()> {
    if quantity == 0 || quantity as usize > max {
        return Err(ModbusError::validation(format!(
            "Quantity out of range: {quantity} (allowed: 1-{max})"
        )));
    }
    Ok(())
}

fn validate_write_count(count: usize, max: usize) -> ModbusResult<()> {
    if count == 0 || count > max {
        return Err(ModbusError::validation(format!(
            "Value count out of range: {count} (allowed: 1-{max})"
        )));
    }
    Ok(())
}

fn check_echo_address(requested: u16, echoed: u16) -> ModbusResult<()> {
    if requested != echoed {
        return Err(ModbusError::invalid_data(format!(
            "Echoed address {echoed} does not match request address {requested}"
        )));
    }
    Ok(())
}

fn unwrap_bits(response: ResponseData, quantity: u16) -> ModbusResult<Vec<bool>> {
    match response {
        ResponseData::Bits(mut bits) => {
            // The device pads to whole bytes; trim back to what was asked.
            bits.truncate(quantity as usize);
            Ok(bits)
        },
        other => Err(unexpected_response(other)),
    }
}

fn unwrap_registers(response: ResponseData) -> ModbusResult<Vec<u16>> {
    match response {
        ResponseData::Registers(registers) => Ok(registers),
        other => Err(unexpected_response(other)),
    }
}

fn unwrap_write_echo(response: ResponseData, requested: u16) -> ModbusResult<u16> {
    match response {
        ResponseData::WriteEcho { address, quantity } => {
            check_echo_address(requested, address)?;
            Ok(quantity)
        },
        other => Err(unexpected_response(other)),
    }
}

fn unexpected_response(response: ResponseData) -> ModbusError {
    ModbusError::invalid_data(format!("Unexpected response shape: {response:?}"))
}
