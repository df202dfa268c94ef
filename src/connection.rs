//! Connection lifecycle management
//!
//! The [`ConnectionManager`] owns the TCP transport and everything attached
//! to it: the connect/disconnect/reconnect state machine, the spawned reader
//! task that feeds received bytes through the [`FrameAssembler`] into the
//! [`TransactionTracker`], the single-shot reconnect timer, and the
//! lifecycle event channel.
//!
//! State transitions are published on a `watch` channel, which both lets
//! concurrent `connect()` callers join an attempt already in flight and
//! gives teardown paths a compare-and-swap: whichever actor wins the
//! Connected -> Disconnected transition performs the cleanup exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{build_frame, FrameAssembler};
use crate::pdu::{FunctionCode, ResponseData};
use crate::transaction::TransactionTracker;

/// Read buffer size for the transport reader task
const READ_CHUNK_SIZE: usize = 4096;

/// Connection state published to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport established
    #[default]
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Transport established and usable
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Lifecycle notification delivered to subscribers
///
/// Observers are optional: events sent while nobody is subscribed are
/// dropped silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Transport established
    Connected,
    /// Previously established transport dropped unexpectedly
    Disconnected,
    /// Connection-level failure (refused connect, transport error)
    Error(String),
}

/// Strategy for spacing automatic reconnection attempts
///
/// `attempt` counts failed attempts since the last successful connect,
/// starting at 0.
pub trait ReconnectPolicy: Send + Sync {
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Reconnect after the same fixed delay every time (the protocol default)
pub struct FixedInterval(pub Duration);

impl ReconnectPolicy for FixedInterval {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Doubling delay capped at a maximum
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Owns the transport and mediates its lifecycle
pub struct ConnectionManager {
    config: ClientConfig,
    tracker: TransactionTracker,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<LinkEvent>,
    writer: Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    reconnect_timer: StdMutex<Option<JoinHandle<()>>>,
    reconnect_enabled: AtomicBool,
    reconnect_attempts: AtomicU32,
    reconnect_policy: Box<dyn ReconnectPolicy>,
    /// Handed to spawned tasks; they must not keep the manager alive.
    weak_self: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a manager with the default fixed-interval reconnect policy
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let interval = config.reconnect_interval();
        Self::with_policy(config, Box::new(FixedInterval(interval)))
    }

    /// Create a manager with a custom reconnect policy
    pub fn with_policy(config: ClientConfig, policy: Box<dyn ReconnectPolicy>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(32);
        let reconnect = config.reconnect;

        Arc::new_cyclic(|weak_self| Self {
            config,
            tracker: TransactionTracker::new(),
            state_tx,
            events,
            writer: Mutex::new(None),
            reader_task: StdMutex::new(None),
            reconnect_timer: StdMutex::new(None),
            reconnect_enabled: AtomicBool::new(reconnect),
            reconnect_attempts: AtomicU32::new(0),
            reconnect_policy: policy,
            weak_self: weak_self.clone(),
        })
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Whether a transport is currently established
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Number of requests currently awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.tracker.pending_count()
    }

    /// Connection parameters this manager was built with
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn emit(&self, event: LinkEvent) {
        // No subscribers is not an error; observers are optional.
        let _ = self.events.send(event);
    }

    /// Establish the transport
    ///
    /// Succeeds immediately when already connected. When an attempt is
    /// already in flight the caller joins it, resolving or failing with
    /// that attempt's outcome, so at most one attempt runs at a time.
    pub async fn connect(&self) -> ModbusResult<()> {
        loop {
            let mut state_rx = self.state_tx.subscribe();
            let current = *state_rx.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => loop {
                    if state_rx.changed().await.is_err() {
                        return Err(ModbusError::connection("connection manager dropped"));
                    }
                    let next = *state_rx.borrow_and_update();
                    match next {
                        ConnectionState::Connected => return Ok(()),
                        ConnectionState::Disconnected => {
                            return Err(ModbusError::connection(format!(
                                "connect to {} failed",
                                self.config.endpoint()
                            )))
                        },
                        ConnectionState::Connecting => continue,
                    }
                },
                ConnectionState::Disconnected => {
                    let claimed = self.state_tx.send_if_modified(|state| {
                        if *state == ConnectionState::Disconnected {
                            *state = ConnectionState::Connecting;
                            true
                        } else {
                            false
                        }
                    });
                    if claimed {
                        return self.run_attempt().await;
                    }
                    // Lost the race to another caller; loop around and join.
                },
            }
        }
    }

    /// Open the TCP stream and wire it up, or fall back to Disconnected
    async fn run_attempt(&self) -> ModbusResult<()> {
        let endpoint = self.config.endpoint();
        debug!("TCP connecting: {}", endpoint);

        let opened = match timeout(self.config.timeout(), TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ModbusError::connection(format!(
                "Failed to connect to {endpoint}: {e}"
            ))),
            Err(_) => Err(ModbusError::connection(format!(
                "Connection to {endpoint} timed out"
            ))),
        };

        match opened {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                let (read_half, write_half) = stream.into_split();
                *self.writer.lock().await = Some(write_half);

                // A disconnect() racing this attempt wins: if the state has
                // left Connecting, drop the fresh stream instead of
                // resurrecting the connection.
                let established = self.state_tx.send_if_modified(|state| {
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Connected;
                        true
                    } else {
                        false
                    }
                });
                if !established {
                    *self.writer.lock().await = None;
                    return Err(ModbusError::ConnectionClosed);
                }

                self.cancel_reconnect();
                self.reconnect_attempts.store(0, Ordering::Relaxed);
                self.tracker.open();
                self.spawn_reader(read_half);

                info!("TCP connected: {}", endpoint);
                self.emit(LinkEvent::Connected);
                Ok(())
            },
            Err(e) => {
                self.state_tx.send_if_modified(|state| {
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
                warn!("TCP connect failed: {} - {}", endpoint, e);
                self.emit(LinkEvent::Error(e.to_string()));
                self.schedule_reconnect();
                Err(e)
            },
        }
    }

    /// Tear the transport down deliberately
    ///
    /// Cancels any scheduled reconnect and disables automatic reconnection
    /// from here on, fails every outstanding transaction with
    /// Connection-Closed, and drops the transport without waiting for the
    /// peer to acknowledge closure.
    pub async fn disconnect(&self) {
        self.reconnect_enabled.store(false, Ordering::Relaxed);
        self.cancel_reconnect();

        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.tracker.fail_all(ModbusError::ConnectionClosed);

        if let Some(handle) = self
            .reader_task
            .lock()
            .expect("reader task slot poisoned")
            .take()
        {
            handle.abort();
        }
        *self.writer.lock().await = None;
        debug!("Disconnected");
    }

    /// Encode a frame for the PDU, send it, and await the correlated response
    ///
    /// Fails synchronously with Not-Connected when no transport exists; no
    /// requests are queued while disconnected. The response timeout starts
    /// only after the frame has been written.
    pub async fn submit(
        &self,
        function: FunctionCode,
        request_pdu: Vec<u8>,
    ) -> ModbusResult<ResponseData> {
        if !self.is_connected() {
            return Err(ModbusError::NotConnected);
        }

        let (id, response_rx) = self.tracker.register(function)?;
        let frame = build_frame(id, self.config.unit_id, &request_pdu);

        {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                self.tracker.abandon(id);
                return Err(ModbusError::NotConnected);
            };
            if let Err(e) = writer.write_all(&frame).await {
                self.tracker.abandon(id);
                return Err(ModbusError::io(format!("TCP send error: {e}")));
            }
        }
        debug!(
            "TX frame: transaction={:#06X} FC={:#04X} {}B",
            id,
            function.to_u8(),
            frame.len()
        );

        match timeout(self.config.timeout(), response_rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without completing: the entry was torn down.
            Ok(Err(_)) => Err(ModbusError::ConnectionClosed),
            Err(_) => {
                // Expiry cancels exactly this transaction; a late response
                // for this id will find no entry and be discarded.
                self.tracker.abandon(id);
                Err(ModbusError::Timeout(self.config.timeout_ms))
            },
        }
    }

    /// Spawn the task that owns the read half and the receive buffer
    ///
    /// The task holds only a weak reference: once every client handle is
    /// gone the manager drops, the write half closes, and the reader winds
    /// down instead of keeping the connection alive.
    fn spawn_reader(&self, mut reader: OwnedReadHalf) {
        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            let mut assembler = FrameAssembler::new();
            let mut chunk = vec![0u8; READ_CHUNK_SIZE];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => {
                        debug!("Transport closed by peer");
                        break;
                    },
                    Ok(n) => {
                        let Some(manager) = weak.upgrade() else {
                            return;
                        };
                        match assembler.push(&chunk[..n]) {
                            Ok(frames) => {
                                for frame in frames {
                                    debug!(
                                        "RX frame: transaction={:#06X} {}B",
                                        frame.header.transaction_id,
                                        frame.pdu.len()
                                    );
                                    manager.tracker.complete(frame);
                                }
                            },
                            Err(e) => {
                                warn!("Receive stream desynchronized: {}", e);
                                manager.emit(LinkEvent::Error(e.to_string()));
                                break;
                            },
                        }
                    },
                    Err(e) => {
                        debug!("Transport read error: {}", e);
                        if let Some(manager) = weak.upgrade() {
                            manager.emit(LinkEvent::Error(e.to_string()));
                        }
                        break;
                    },
                }
            }
            if let Some(manager) = weak.upgrade() {
                manager.handle_unexpected_closure().await;
            }
        });
        *self
            .reader_task
            .lock()
            .expect("reader task slot poisoned") = Some(handle);
    }

    /// Cleanup after the transport dropped out from under us
    ///
    /// Only the actor that wins the Connected -> Disconnected transition
    /// proceeds; a deliberate disconnect that got there first already did
    /// the work.
    async fn handle_unexpected_closure(&self) {
        let transitioned = self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if !transitioned {
            return;
        }

        self.tracker.fail_all(ModbusError::ConnectionClosed);
        *self.writer.lock().await = None;

        info!("Disconnected: {}", self.config.endpoint());
        self.emit(LinkEvent::Disconnected);
        self.schedule_reconnect();
    }

    /// Schedule a single reconnect attempt after the policy delay
    ///
    /// At most one timer is pending; scheduling while one exists is a
    /// no-op. The fired timer skips silently when the connection was
    /// re-established (or another attempt started) in the meantime.
    fn schedule_reconnect(&self) {
        if !self.reconnect_enabled.load(Ordering::Relaxed) {
            return;
        }

        let mut slot = self
            .reconnect_timer
            .lock()
            .expect("reconnect timer slot poisoned");
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        let delay = self.reconnect_policy.next_delay(attempt);
        debug!("Reconnect scheduled in {:?} (attempt {})", delay, attempt + 1);

        let weak = self.weak_self.clone();
        *slot = Some(tokio::spawn(async move {
            sleep(delay).await;
            let Some(manager) = weak.upgrade() else {
                return;
            };

            // Vacate the timer slot before attempting, so the success path
            // cancelling "the pending timer" never aborts this very task.
            manager
                .reconnect_timer
                .lock()
                .expect("reconnect timer slot poisoned")
                .take();

            if !manager.reconnect_enabled.load(Ordering::Relaxed) {
                return;
            }
            if manager.state() != ConnectionState::Disconnected {
                return;
            }
            if let Err(e) = manager.connect().await {
                debug!("Reconnect attempt failed: {}", e);
            }
        }));
    }

    fn cancel_reconnect(&self) {
        if let Some(handle) = self
            .reconnect_timer
            .lock()
            .expect("reconnect timer slot poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.reconnect_timer.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        if let Ok(mut slot) = self.reader_task.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Reconnect policy tests
    // ========================================================================

    #[test]
    fn test_fixed_interval_ignores_attempt_count() {
        let policy = FixedInterval(Duration::from_secs(5));
        assert_eq!(policy.next_delay(0), Duration::from_secs(5));
        assert_eq!(policy.next_delay(100), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let policy = ExponentialBackoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        assert_eq!(policy.next_delay(0), Duration::from_secs(1));
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(4), Duration::from_secs(16));
        assert_eq!(policy.next_delay(5), Duration::from_secs(30));
        assert_eq!(policy.next_delay(60), Duration::from_secs(30));
    }

    // ========================================================================
    // State machine tests (no live transport)
    // ========================================================================

    #[test]
    fn test_initial_state_is_disconnected() {
        let manager = ConnectionManager::new(ClientConfig::default());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());
        assert_eq!(manager.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_submit_without_transport_fails_fast() {
        let manager = ConnectionManager::new(ClientConfig::default());
        let result = manager
            .submit(
                FunctionCode::ReadCoils,
                crate::pdu::encode_read(FunctionCode::ReadCoils, 0, 1),
            )
            .await;
        assert_eq!(result.unwrap_err(), ModbusError::NotConnected);
    }

    #[tokio::test]
    async fn test_connect_refused_schedules_reconnect_and_fails() {
        // Nothing listens on this port; the attempt must fail, fall back to
        // Disconnected, and notify subscribers through the error channel.
        let config = ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            timeout_ms: 1000,
            reconnect_interval_ms: 60_000,
            ..ClientConfig::default()
        };
        let manager = ConnectionManager::new(config);
        let mut events = manager.subscribe();

        let result = manager.connect().await;
        assert!(matches!(result, Err(ModbusError::Connection(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        match events.recv().await.unwrap() {
            LinkEvent::Error(_) => {},
            other => panic!("Expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_without_transport_is_idempotent() {
        let manager = ConnectionManager::new(ClientConfig::default());
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "DISCONNECTED");
        assert_eq!(ConnectionState::Connecting.to_string(), "CONNECTING");
        assert_eq!(ConnectionState::Connected.to_string(), "CONNECTED");
    }
}
