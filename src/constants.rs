//! Modbus protocol constants based on the official specification
//!
//! Limits are derived from the maximum PDU size of 253 bytes, which Modbus
//! TCP inherits from the RS485 ADU limit of 256 bytes.

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Modbus TCP MBAP header length
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1) = 7 bytes
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum value of the MBAP length field (Unit ID + PDU)
pub const MAX_FRAME_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Protocol identifier carried in every MBAP header (always 0 for Modbus)
pub const PROTOCOL_ID: u16 = 0x0000;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04 (Read Holding/Input Registers)
///
/// Response PDU: 1 (fc) + 1 (byte count) + N * 2 <= 253, so N <= 125.
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Request PDU: 1 (fc) + 2 (address) + 2 (quantity) + 1 (byte count)
/// + N * 2 <= 253, so N <= 123.
pub const MAX_WRITE_REGISTERS: usize = 123;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum number of coils for FC01/FC02 (Read Coils/Discrete Inputs)
pub const MAX_READ_COILS: usize = 2000;

/// Maximum number of coils for FC15 (Write Multiple Coils)
pub const MAX_WRITE_COILS: usize = 1968;

// ============================================================================
// Write Single Coil Sentinels
// ============================================================================

/// Value field for switching a coil ON (FC05)
pub const COIL_ON: u16 = 0xFF00;

/// Value field for switching a coil OFF (FC05)
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Acknowledge
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;

/// Server Device Busy
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;

/// Memory Parity Error
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;

/// Gateway Path Unavailable
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;

/// Gateway Target Device Failed to Respond
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;

// ============================================================================
// Defaults
// ============================================================================

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default unit/device identifier
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Default per-request response timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default delay between automatic reconnection attempts in milliseconds
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_HEADER_LEN, 7);
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(MAX_FRAME_LENGTH, 254);
    }

    #[test]
    fn test_register_limits() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);

        let write_pdu_size = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS * 2);
        assert!(write_pdu_size <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_coil_limits() {
        let read_coil_pdu = 1 + 1 + MAX_READ_COILS.div_ceil(8);
        assert!(read_coil_pdu <= MAX_PDU_SIZE);

        let write_coil_pdu = 1 + 2 + 2 + 1 + MAX_WRITE_COILS.div_ceil(8);
        assert!(write_coil_pdu <= MAX_PDU_SIZE);
    }
}
