//! Request PDU encoding and response PDU decoding
//!
//! A PDU is the function code plus its operation-specific body, independent
//! of the transport framing. Everything here is stateless: the connection
//! layer owns transaction ids and the MBAP header, this module only builds
//! and interprets PDU bytes.

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};

/// Modbus function codes supported by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    /// FC01 - Read Coils
    ReadCoils = 0x01,
    /// FC02 - Read Discrete Inputs
    ReadDiscreteInputs = 0x02,
    /// FC03 - Read Holding Registers
    ReadHoldingRegisters = 0x03,
    /// FC04 - Read Input Registers
    ReadInputRegisters = 0x04,
    /// FC05 - Write Single Coil
    WriteSingleCoil = 0x05,
    /// FC06 - Write Single Register
    WriteSingleRegister = 0x06,
    /// FC15 - Write Multiple Coils
    WriteMultipleCoils = 0x0F,
    /// FC16 - Write Multiple Registers
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Raw function code byte
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Decoded response payload, one variant per response shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseData {
    /// FC01/FC02 - unpacked bit values (not yet truncated to the request quantity)
    Bits(Vec<bool>),
    /// FC03/FC04 - 16-bit register values
    Registers(Vec<u16>),
    /// FC05 - echoed address and resolved coil state
    CoilEcho { address: u16, value: bool },
    /// FC06 - echoed address and register value
    RegisterEcho { address: u16, value: u16 },
    /// FC15/FC16 - echoed start address and written quantity
    WriteEcho { address: u16, quantity: u16 },
}

// ============================================================================
// Request encoding
// ============================================================================

/// Encode a read request (FC01-FC04): function code, address, quantity
pub fn encode_read(function: FunctionCode, address: u16, quantity: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function.to_u8());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu
}

/// Encode a write single coil request (FC05)
pub fn encode_write_single_coil(address: u16, value: bool) -> Vec<u8> {
    let sentinel = if value { COIL_ON } else { COIL_OFF };
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::WriteSingleCoil.to_u8());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&sentinel.to_be_bytes());
    pdu
}

/// Encode a write single register request (FC06)
pub fn encode_write_single_register(address: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::WriteSingleRegister.to_u8());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Encode a write multiple coils request (FC15)
///
/// Bits are packed LSB-first within each payload byte.
pub fn encode_write_multiple_coils(address: u16, values: &[bool]) -> Vec<u8> {
    let byte_count = values.len().div_ceil(8);
    let mut pdu = Vec::with_capacity(6 + byte_count);
    pdu.push(FunctionCode::WriteMultipleCoils.to_u8());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push(byte_count as u8);

    for chunk in values.chunks(8) {
        let mut byte = 0u8;
        for (i, &coil) in chunk.iter().enumerate() {
            if coil {
                byte |= 1 << i;
            }
        }
        pdu.push(byte);
    }

    pdu
}

/// Encode a write multiple registers request (FC16)
pub fn encode_write_multiple_registers(address: u16, values: &[u16]) -> Vec<u8> {
    let byte_count = values.len() * 2;
    let mut pdu = Vec::with_capacity(6 + byte_count);
    pdu.push(FunctionCode::WriteMultipleRegisters.to_u8());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push(byte_count as u8);
    for &value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    pdu
}

// ============================================================================
// Response decoding
// ============================================================================

/// Check whether a response PDU carries an exception (function code high bit set)
pub fn is_exception(pdu: &[u8]) -> bool {
    !pdu.is_empty() && (pdu[0] & 0x80) != 0
}

/// Extract the exception code from an exception response PDU
pub fn parse_exception(pdu: &[u8]) -> ModbusResult<u8> {
    if pdu.len() < 2 {
        return Err(ModbusError::invalid_data("Truncated exception response"));
    }
    Ok(pdu[1])
}

/// Decode a response PDU according to the originating request's function code
pub fn decode_response(function: FunctionCode, pdu: &[u8]) -> ModbusResult<ResponseData> {
    match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => decode_bits(pdu),
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            decode_registers(pdu)
        },
        FunctionCode::WriteSingleCoil => {
            let (address, raw) = decode_echo(pdu)?;
            Ok(ResponseData::CoilEcho {
                address,
                value: raw == COIL_ON,
            })
        },
        FunctionCode::WriteSingleRegister => {
            let (address, value) = decode_echo(pdu)?;
            Ok(ResponseData::RegisterEcho { address, value })
        },
        FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
            let (address, quantity) = decode_echo(pdu)?;
            Ok(ResponseData::WriteEcho { address, quantity })
        },
    }
}

/// FC01/FC02 response: byte count, then bits unpacked LSB-first per byte
fn decode_bits(pdu: &[u8]) -> ModbusResult<ResponseData> {
    if pdu.len() < 2 {
        return Err(ModbusError::invalid_data("Bit response too short"));
    }
    let byte_count = pdu[1] as usize;
    if pdu.len() < 2 + byte_count {
        return Err(ModbusError::invalid_data(format!(
            "Bit response truncated: declared {} bytes, got {}",
            byte_count,
            pdu.len() - 2
        )));
    }

    let mut bits = Vec::with_capacity(byte_count * 8);
    for &byte in &pdu[2..2 + byte_count] {
        for bit in 0..8 {
            bits.push((byte >> bit) & 1 != 0);
        }
    }
    Ok(ResponseData::Bits(bits))
}

/// FC03/FC04 response: byte count, then big-endian 16-bit values
fn decode_registers(pdu: &[u8]) -> ModbusResult<ResponseData> {
    if pdu.len() < 2 {
        return Err(ModbusError::invalid_data("Register response too short"));
    }
    let byte_count = pdu[1] as usize;
    if byte_count % 2 != 0 {
        return Err(ModbusError::invalid_data(format!(
            "Odd register byte count: {byte_count}"
        )));
    }
    if pdu.len() < 2 + byte_count {
        return Err(ModbusError::invalid_data(format!(
            "Register response truncated: declared {} bytes, got {}",
            byte_count,
            pdu.len() - 2
        )));
    }

    let registers = pdu[2..2 + byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(ResponseData::Registers(registers))
}

/// FC05/FC06/FC15/FC16 response: echoed address plus a 16-bit value field
fn decode_echo(pdu: &[u8]) -> ModbusResult<(u16, u16)> {
    if pdu.len() < 5 {
        return Err(ModbusError::invalid_data("Write echo response too short"));
    }
    let address = u16::from_be_bytes([pdu[1], pdu[2]]);
    let value = u16::from_be_bytes([pdu[3], pdu[4]]);
    Ok((address, value))
}
