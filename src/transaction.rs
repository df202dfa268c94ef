//! Transaction identifier allocation and request/response correlation
//!
//! Responses on a Modbus TCP connection may complete in any order relative
//! to submission, so every in-flight request is tracked in a pending table
//! keyed by its 16-bit transaction id. The table also carries an open/closed
//! flag: closing it (on disconnect) rejects every outstanding entry and
//! refuses new registrations in the same critical section, so no submission
//! can slip between the decision to disconnect and the bulk rejection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ModbusError, ModbusResult};
use crate::frame::Frame;
use crate::pdu::{self, FunctionCode, ResponseData};

/// One outstanding request awaiting its response
struct PendingTransaction {
    /// Operation kind, selects the response decoder
    function: FunctionCode,
    /// Completion channel back to the caller
    tx: oneshot::Sender<ModbusResult<ResponseData>>,
}

struct PendingTable {
    entries: HashMap<u16, PendingTransaction>,
    /// False once the connection decided to tear down; registrations are
    /// refused until the next successful connect reopens the table.
    open: bool,
}

/// Tracks outstanding transactions and matches incoming frames to waiters
pub struct TransactionTracker {
    pending: Mutex<PendingTable>,
    next_id: AtomicU16,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(PendingTable {
                entries: HashMap::new(),
                open: false,
            }),
            next_id: AtomicU16::new(0),
        }
    }

    /// Allocate the next transaction id
    ///
    /// Ids start at 1 and wrap through the full 16-bit range, so 0 comes
    /// back around after 65535.
    fn next_transaction_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Register a new pending transaction, returning its id and the
    /// receiver the caller awaits
    ///
    /// Fails with `NotConnected` while the table is closed. An allocated id
    /// that collides with a still-outstanding transaction (wraparound with
    /// 65536 requests in flight) is rejected explicitly rather than
    /// clobbering the older entry.
    pub fn register(
        &self,
        function: FunctionCode,
    ) -> ModbusResult<(u16, oneshot::Receiver<ModbusResult<ResponseData>>)> {
        let mut table = self.pending.lock().expect("pending table poisoned");
        if !table.open {
            return Err(ModbusError::NotConnected);
        }

        let id = self.next_transaction_id();
        if table.entries.contains_key(&id) {
            return Err(ModbusError::protocol(format!(
                "Transaction id {id} still outstanding after wraparound"
            )));
        }

        let (tx, rx) = oneshot::channel();
        table.entries.insert(id, PendingTransaction { function, tx });
        Ok((id, rx))
    }

    /// Remove a pending entry without completing it (write failure, timeout)
    pub fn abandon(&self, id: u16) {
        let mut table = self.pending.lock().expect("pending table poisoned");
        table.entries.remove(&id);
    }

    /// Route a reassembled frame to its waiter
    ///
    /// Frames with no matching pending entry are discarded silently: the
    /// transaction may have timed out already, or been abandoned by a
    /// disconnect. That is expected traffic, not a protocol error.
    pub fn complete(&self, frame: Frame) {
        let entry = {
            let mut table = self.pending.lock().expect("pending table poisoned");
            table.entries.remove(&frame.header.transaction_id)
        };

        let Some(entry) = entry else {
            debug!(
                "Discarding response for unknown transaction {:#06X}",
                frame.header.transaction_id
            );
            return;
        };

        let result = if pdu::is_exception(&frame.pdu) {
            pdu::parse_exception(&frame.pdu).and_then(|code| Err(ModbusError::exception(code)))
        } else {
            pdu::decode_response(entry.function, &frame.pdu)
        };

        // The caller may have given up (timeout raced the response); a
        // failed send is equivalent to a discarded frame.
        let _ = entry.tx.send(result);
    }

    /// Reject every outstanding transaction with the same error and close
    /// the table to new registrations
    pub fn fail_all(&self, error: ModbusError) {
        let drained: Vec<PendingTransaction> = {
            let mut table = self.pending.lock().expect("pending table poisoned");
            table.open = false;
            table.entries.drain().map(|(_, entry)| entry).collect()
        };

        for entry in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
    }

    /// Reopen the table after a successful connect
    pub fn open(&self) {
        let mut table = self.pending.lock().expect("pending table poisoned");
        table.open = true;
    }

    /// Number of currently outstanding transactions
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending table poisoned").entries.len()
    }
}

impl Default for TransactionTracker {
    fn default() -> Self {
        Self::new()
    }
}
