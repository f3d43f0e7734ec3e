//! Relay client with a reconnecting watchdog
//!
//! ```text
//! DISCONNECTED ──connect()──► CONNECTING ──ok──► CONNECTED
//!                                 │  ▲               │ peer closed
//!                            fail │  │ retry         ▼
//!                                 ▼  │          RECONNECTING
//!                           RECONNECTING ─exhausted─► STOPPED
//! ```
//!
//! The watchdog thread owns connect, retry and liveness polling. Audio
//! writes happen on the caller's thread against the shared connection.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::StreamTarget;
use crate::constants::LIVENESS_INTERVAL;
use crate::stream::connection::{Connector, RelayConnection, TcpConnector};
use crate::stream::handshake::{self, TrackMetadata};

/// Connection state of a [`StreamClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retries exhausted or manually disconnected
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// One state transition, sent from the watchdog thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEvent {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

struct Shared {
    state: Mutex<ConnectionState>,
    connection: Mutex<Option<Box<dyn RelayConnection>>>,
    events: Mutex<Option<Sender<StreamEvent>>>,
    bytes_sent: AtomicU64,
    /// Bumped under the `connection` lock each time a connection is installed
    connection_id: AtomicU64,
    retry_count: AtomicU32,
    connected_at: Mutex<Option<(Instant, DateTime<Utc>)>>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn set_state(&self, to: ConnectionState) {
        let from = {
            let mut state = self.state.lock();
            if *state == to {
                return;
            }
            std::mem::replace(&mut *state, to)
        };
        tracing::info!("Relay state {} -> {}", from, to);
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(StreamEvent { from, to });
        }
    }

    fn fail(&self, message: String) {
        tracing::warn!("Relay: {}", message);
        *self.last_error.lock() = Some(message);
    }
}

struct Watchdog {
    handle: JoinHandle<()>,
    /// Dropping this cancels the watchdog
    stop_tx: Sender<()>,
}

/// Source client for one relay mount
pub struct StreamClient {
    target: StreamTarget,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    watchdog: Mutex<Option<Watchdog>>,
}

impl StreamClient {
    pub fn new(target: StreamTarget) -> Self {
        Self::with_connector(target, Arc::new(TcpConnector::default()))
    }

    pub fn with_connector(target: StreamTarget, connector: Arc<dyn Connector>) -> Self {
        Self {
            target,
            connector,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                connection: Mutex::new(None),
                events: Mutex::new(None),
                bytes_sent: AtomicU64::new(0),
                connection_id: AtomicU64::new(0),
                retry_count: AtomicU32::new(0),
                connected_at: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
            watchdog: Mutex::new(None),
        }
    }

    /// Deliver every state transition to `tx`
    pub fn set_event_sender(&self, tx: Sender<StreamEvent>) {
        *self.shared.events.lock() = Some(tx);
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    /// Start the watchdog. Returns immediately; progress is reported as events.
    pub fn connect(&self) {
        let mut watchdog = self.watchdog.lock();
        if let Some(running) = watchdog.as_ref() {
            if !running.handle.is_finished() {
                return;
            }
        }
        // A finished watchdog (retries exhausted) is reaped before restarting
        if let Some(old) = watchdog.take() {
            let _ = old.handle.join();
        }

        self.shared.retry_count.store(0, Ordering::Relaxed);
        self.shared.set_state(ConnectionState::Connecting);

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let shared = self.shared.clone();
        let connector = self.connector.clone();
        let target = self.target.clone();
        let spawned = thread::Builder::new()
            .name(format!("relay-watchdog{}", target.mount.replace('/', "-")))
            .spawn(move || run_watchdog(&shared, connector.as_ref(), &target, &stop_rx));

        match spawned {
            Ok(handle) => *watchdog = Some(Watchdog { handle, stop_tx }),
            Err(e) => {
                self.shared.fail(format!("Failed to spawn watchdog: {}", e));
                self.shared.set_state(ConnectionState::Stopped);
            }
        }
    }

    /// Stop the watchdog and wait for it. Ends in `STOPPED`.
    pub fn disconnect(&self) {
        let watchdog = self.watchdog.lock().take();
        if let Some(Watchdog { handle, stop_tx }) = watchdog {
            drop(stop_tx);
            if handle.join().is_err() {
                tracing::error!("Relay watchdog panicked");
            }
        }
        self.shared.connection.lock().take();
        *self.shared.connected_at.lock() = None;
        if self.state() != ConnectionState::Disconnected {
            self.shared.set_state(ConnectionState::Stopped);
        }
    }

    /// Write encoded audio. Returns the payload length, or -1 when not connected.
    pub fn write(&self, data: &[u8]) -> i64 {
        self.write_for(self.connection_id(), data)
    }

    /// Like [`write`](Self::write), but only onto the connection numbered
    /// `connection`. Bytes meant for a connection that has since been
    /// replaced are dropped.
    pub fn write_for(&self, connection: u64, data: &[u8]) -> i64 {
        if self.state() != ConnectionState::Connected {
            return -1;
        }
        let mut slot = self.shared.connection.lock();
        if self.shared.connection_id.load(Ordering::SeqCst) != connection {
            return -1;
        }
        let Some(conn) = slot.as_mut() else {
            return -1;
        };
        match conn.send(data) {
            Ok(()) => {
                self.shared
                    .bytes_sent
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                data.len() as i64
            }
            Err(e) => {
                // The watchdog notices the missing connection and reconnects
                slot.take();
                drop(slot);
                self.shared.fail(format!("Write failed: {}", e));
                -1
            }
        }
    }

    /// Push now-playing metadata over a separate short-lived connection
    pub fn send_admin_metadata(&self, meta: &TrackMetadata) -> bool {
        let request = handshake::admin_request(&self.target, meta);
        match self.connector.request(&self.target, &request) {
            Ok(response) => {
                let ok = handshake::admin_acknowledged(&response);
                if ok {
                    tracing::debug!("Metadata updated: {}", meta.song());
                } else {
                    tracing::warn!("Relay refused metadata update for {}", self.target.mount);
                }
                ok
            }
            Err(e) => {
                tracing::warn!("Metadata update failed: {}", e);
                false
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of the current connection; 0 before the first one
    pub fn connection_id(&self) -> u64 {
        self.shared.connection_id.load(Ordering::SeqCst)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count.load(Ordering::Relaxed)
    }

    /// Wall-clock time of the current connection
    pub fn connect_time(&self) -> Option<DateTime<Utc>> {
        self.shared.connected_at.lock().map(|(_, at)| at)
    }

    pub fn uptime(&self) -> Duration {
        self.shared
            .connected_at
            .lock()
            .map(|(since, _)| since.elapsed())
            .unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if let Some(Watchdog { handle, stop_tx }) = self.watchdog.get_mut().take() {
            drop(stop_tx);
            let _ = handle.join();
        }
    }
}

/// Wait up to `duration`; true if the watchdog was cancelled meanwhile
fn cancelled_during(stop_rx: &Receiver<()>, duration: Duration) -> bool {
    !matches!(stop_rx.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
}

fn run_watchdog(
    shared: &Shared,
    connector: &dyn Connector,
    target: &StreamTarget,
    stop_rx: &Receiver<()>,
) {
    let retry_interval = Duration::from_secs(target.retry_interval_sec as u64);

    loop {
        if cancelled_during(stop_rx, Duration::ZERO) {
            break;
        }
        shared.set_state(ConnectionState::Connecting);
        tracing::info!("Connecting to {}{}", target.address(), target.mount);

        match connector.open(target) {
            Ok(connection) => {
                {
                    let mut slot = shared.connection.lock();
                    shared.connection_id.fetch_add(1, Ordering::SeqCst);
                    *slot = Some(connection);
                }
                *shared.connected_at.lock() = Some((Instant::now(), Utc::now()));
                shared.retry_count.store(0, Ordering::Relaxed);
                shared.set_state(ConnectionState::Connected);

                loop {
                    if cancelled_during(stop_rx, LIVENESS_INTERVAL) {
                        shared.connection.lock().take();
                        shared.set_state(ConnectionState::Stopped);
                        return;
                    }
                    let alive = shared
                        .connection
                        .lock()
                        .as_mut()
                        .map(|c| c.is_alive())
                        .unwrap_or(false);
                    if !alive {
                        break;
                    }
                }

                shared.connection.lock().take();
                *shared.connected_at.lock() = None;
                shared.fail(format!("Connection to {} lost", target.address()));
            }
            Err(e) => {
                shared.fail(e.to_string());
                let failures = shared.retry_count.fetch_add(1, Ordering::Relaxed) + 1;
                if target.max_retries >= 0 && failures > target.max_retries as u32 {
                    tracing::warn!(
                        "Giving up on {}{} after {} attempts",
                        target.address(),
                        target.mount,
                        failures
                    );
                    break;
                }
            }
        }

        shared.set_state(ConnectionState::Reconnecting);
        if cancelled_during(stop_rx, retry_interval) {
            break;
        }
    }

    shared.set_state(ConnectionState::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use std::sync::atomic::AtomicUsize;

    struct RefusingConnector {
        attempts: AtomicUsize,
    }

    impl Connector for RefusingConnector {
        fn open(&self, _: &StreamTarget) -> Result<Box<dyn RelayConnection>, StreamError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StreamError::ConnectionFailed("refused".to_string()))
        }

        fn request(&self, _: &StreamTarget, _: &str) -> Result<String, StreamError> {
            Err(StreamError::ConnectionFailed("refused".to_string()))
        }
    }

    /// Accepts every connection and records what was written
    #[derive(Default)]
    struct LoopbackConnector {
        written: Arc<Mutex<Vec<u8>>>,
        alive: Arc<std::sync::atomic::AtomicBool>,
    }

    struct LoopbackConnection {
        written: Arc<Mutex<Vec<u8>>>,
        alive: Arc<std::sync::atomic::AtomicBool>,
    }

    impl RelayConnection for LoopbackConnection {
        fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
            self.written.lock().extend_from_slice(data);
            Ok(())
        }

        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    impl Connector for LoopbackConnector {
        fn open(&self, _: &StreamTarget) -> Result<Box<dyn RelayConnection>, StreamError> {
            self.alive.store(true, Ordering::SeqCst);
            Ok(Box::new(LoopbackConnection {
                written: self.written.clone(),
                alive: self.alive.clone(),
            }))
        }

        fn request(&self, _: &StreamTarget, request: &str) -> Result<String, StreamError> {
            assert!(request.starts_with("GET /admin/metadata?"));
            Ok("<iceresponse><return>1</return></iceresponse>".to_string())
        }
    }

    fn target(max_retries: i32) -> StreamTarget {
        StreamTarget {
            retry_interval_sec: 0,
            max_retries,
            ..Default::default()
        }
    }

    fn wait_for(client: &StreamClient, state: ConnectionState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while client.state() != state {
            assert!(Instant::now() < deadline, "stuck in {}", client.state());
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_exhausted_retries_stop_after_three_attempts() {
        let connector = Arc::new(RefusingConnector {
            attempts: AtomicUsize::new(0),
        });
        let client = StreamClient::with_connector(target(2), connector.clone());
        let (tx, rx) = crossbeam_channel::unbounded();
        client.set_event_sender(tx);

        client.connect();
        wait_for(&client, ConnectionState::Stopped);
        client.disconnect();

        let states: Vec<_> = rx.try_iter().map(|e| e.to).collect();
        use ConnectionState::*;
        assert_eq!(
            states,
            vec![Connecting, Reconnecting, Connecting, Reconnecting, Connecting, Stopped]
        );
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert!(client.last_error().unwrap().contains("refused"));
    }

    #[test]
    fn test_no_retries_stops_on_first_failure() {
        let connector = Arc::new(RefusingConnector {
            attempts: AtomicUsize::new(0),
        });
        let client = StreamClient::with_connector(target(0), connector.clone());
        client.connect();
        wait_for(&client, ConnectionState::Stopped);
        client.disconnect();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_requires_connection() {
        let client = StreamClient::with_connector(target(0), Arc::new(LoopbackConnector::default()));
        assert_eq!(client.write(b"data"), -1);
        assert_eq!(client.bytes_sent(), 0);
    }

    #[test]
    fn test_connected_writes_are_counted() {
        let connector = Arc::new(LoopbackConnector::default());
        let written = connector.written.clone();
        let client = StreamClient::with_connector(target(-1), connector);

        client.connect();
        wait_for(&client, ConnectionState::Connected);
        assert_eq!(client.write(b"hello"), 5);
        assert_eq!(client.bytes_sent(), 5);
        assert_eq!(&*written.lock(), b"hello");
        assert!(client.connect_time().is_some());

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Stopped);
        assert_eq!(client.write(b"late"), -1);
    }

    #[test]
    fn test_lost_peer_triggers_reconnect() {
        let connector = Arc::new(LoopbackConnector::default());
        let alive = connector.alive.clone();
        let client = StreamClient::with_connector(target(-1), connector);
        let (tx, rx) = crossbeam_channel::unbounded();
        client.set_event_sender(tx);

        client.connect();
        wait_for(&client, ConnectionState::Connected);
        let first = client.connection_id();
        assert_eq!(first, 1);
        alive.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_reconnecting = false;
        let mut reconnected = false;
        while Instant::now() < deadline && !reconnected {
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
                if event.to == ConnectionState::Reconnecting {
                    saw_reconnecting = true;
                }
                if saw_reconnecting && event.to == ConnectionState::Connected {
                    reconnected = true;
                }
            }
        }
        assert!(saw_reconnecting && reconnected);
        let second = client.connection_id();
        assert!(second > first);
        // Bytes encoded for the dropped connection never reach the new one
        assert_eq!(client.write_for(first, b"stale"), -1);
        assert_eq!(client.write_for(second, b"fresh"), 5);
        client.disconnect();
    }

    #[test]
    fn test_admin_metadata_acknowledged() {
        let client = StreamClient::with_connector(target(0), Arc::new(LoopbackConnector::default()));
        assert!(client.send_admin_metadata(&TrackMetadata::new("Song", "Band")));

        let refusing = StreamClient::with_connector(
            target(0),
            Arc::new(RefusingConnector {
                attempts: AtomicUsize::new(0),
            }),
        );
        assert!(!refusing.send_admin_metadata(&TrackMetadata::new("Song", "Band")));
    }
}
