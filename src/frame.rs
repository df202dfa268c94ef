//! MBAP framing and stream reassembly
//!
//! Modbus TCP frames are an MBAP header followed by the PDU:
//!
//! ```text
//! [Transaction ID(2)][Protocol ID(2)][Length(2)][Unit ID(1)][PDU(N)]
//! ```
//!
//! The length field counts everything after itself: unit id + function code
//! + body. The assembler turns arbitrarily chunked reads into complete
//! frames; TCP may split one frame across many reads or merge several
//! frames into one.

use bytes::{Buf, BytesMut};
use tracing::warn;

use crate::constants::{MAX_FRAME_LENGTH, MBAP_HEADER_LEN, PROTOCOL_ID};
use crate::error::{ModbusError, ModbusResult};

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier
    pub transaction_id: u16,
    /// Protocol identifier (fixed to 0)
    pub protocol_id: u16,
    /// Length field (unit id + PDU)
    pub length: u16,
    /// Unit identifier (slave ID)
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse a header from the first 7 bytes of a frame
    pub fn parse(raw: &[u8]) -> Self {
        debug_assert!(raw.len() >= MBAP_HEADER_LEN);
        Self {
            transaction_id: u16::from_be_bytes([raw[0], raw[1]]),
            protocol_id: u16::from_be_bytes([raw[2], raw[3]]),
            length: u16::from_be_bytes([raw[4], raw[5]]),
            unit_id: raw[6],
        }
    }
}

/// One fully reassembled frame: header plus the PDU (function code + body)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MbapHeader,
    pub pdu: Vec<u8>,
}

/// Build a complete request frame from a transaction-free PDU
///
/// The length field is the PDU length plus one for the unit id byte.
pub fn build_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;

    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

/// Reassembles complete frames from a stream of raw byte chunks
///
/// Pure byte accounting: one piece of state (the buffer), no transaction
/// semantics. After each extraction the buffer shrinks by exactly the
/// extracted frame's size; a partial frame is never exposed.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: BytesMut,
}

impl FrameAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Append a received chunk and extract every complete frame it finishes
    ///
    /// Returns an empty vector while a frame is still partial (that is a
    /// suspension point, not an error). A length field of 0 or beyond the
    /// protocol maximum means the stream is desynchronized and is reported
    /// as a protocol error; frames with a non-zero protocol id are logged
    /// and discarded.
    pub fn push(&mut self, chunk: &[u8]) -> ModbusResult<Vec<Frame>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while self.buffer.len() >= MBAP_HEADER_LEN {
            let length =
                u16::from_be_bytes([self.buffer[4], self.buffer[5]]) as usize;
            if length == 0 || length > MAX_FRAME_LENGTH {
                return Err(ModbusError::protocol(format!(
                    "Invalid MBAP length field: {length}"
                )));
            }

            // Length counts unit id + PDU, so the full frame is the six
            // header bytes before the unit id plus `length` more.
            let total = MBAP_HEADER_LEN - 1 + length;
            if self.buffer.len() < total {
                break;
            }

            let raw = self.buffer.copy_to_bytes(total);
            let header = MbapHeader::parse(&raw);

            if header.protocol_id != PROTOCOL_ID {
                warn!(
                    "Discarding frame with protocol id {:#06X} (transaction {:#06X})",
                    header.protocol_id, header.transaction_id
                );
                continue;
            }

            frames.push(Frame {
                header,
                pdu: raw[MBAP_HEADER_LEN..].to_vec(),
            });
        }

        Ok(frames)
    }

    /// Number of buffered bytes not yet resolved into a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partially accumulated data
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
