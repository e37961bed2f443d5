//! Peripheral session - owns the display link and message transport
//!
//! The session runs as a single task and is the only writer of session state.
//! Callers talk to it through a cloneable [`SessionHandle`]; radio callbacks
//! arrive on a broadcast subscription held for the session's whole lifetime.
//!
//! State machine:
//! ```text
//! Idle -> Scanning -> Connecting -> Connected -> Disconnecting -> Idle
//!   ^________|______________|___________|  (failure / peer disconnect)
//! ```
//!
//! Long radio operations (connect + service discovery, write + read-back,
//! disconnect) run as spawned tasks bounded by timeouts. Each reports back
//! tagged with the epoch it was started under; any state reset bumps the epoch
//! so late completions are ignored.

use crate::domain::message::{decode_payload, OutboundMessage};
use crate::domain::types::{PeripheralId, PeripheralIdentity};
use crate::infra::config::Config;
use crate::infra::metrics::{
    Metrics, SESSION_STATE_CONNECTED, SESSION_STATE_CONNECTING, SESSION_STATE_DISCONNECTING,
    SESSION_STATE_IDLE, SESSION_STATE_SCANNING,
};
use crate::io::radio::{GattTarget, Radio, RadioError, RadioEvent, DEVICE_NAME};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// Window for the discovery retry budget
const RETRY_WINDOW: Duration = Duration::from_secs(60);

/// Log connect / service discovery failure (cold path)
#[cold]
fn log_connect_failed(id: &PeripheralId, e: &RadioError) {
    error!(device = %id, error = %e, "peripheral_connect_failed");
}

/// Log write failure (cold path)
#[cold]
fn log_write_failed(e: &RadioError, consecutive: u32) {
    error!(error = %e, consecutive = %consecutive, "peripheral_write_failed");
}

/// Log discovery failure (cold path)
#[cold]
fn log_discovery_failed(reason: &str) {
    warn!(reason = %reason, "peripheral_discovery_failed");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Scanning => "scanning",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
        }
    }

    /// Value exported on the session state gauge
    pub fn metric_value(&self) -> u64 {
        match self {
            SessionState::Idle => SESSION_STATE_IDLE,
            SessionState::Scanning => SESSION_STATE_SCANNING,
            SessionState::Connecting => SESSION_STATE_CONNECTING,
            SessionState::Connected => SESSION_STATE_CONNECTED,
            SessionState::Disconnecting => SESSION_STATE_DISCONNECTING,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session command queue full")]
    QueueFull,
    #[error("session closed")]
    Closed,
    #[error("peripheral discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("peripheral connect failed: {0}")]
    ConnectFailed(String),
    #[error("peripheral write failed: {0}")]
    WriteFailed(String),
    #[error("discovery retry budget exhausted")]
    RetryBudgetExhausted,
    #[error("peripheral disconnected")]
    Disconnected,
}

/// Observable session activity, broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { from: SessionState, to: SessionState },
    /// Write acknowledged; `readback` is the decoded verification read, if it succeeded
    Delivered { text: String, readback: Option<String>, latency_ms: u64 },
    /// Queued message discarded without being written
    Dropped { text: String, reason: SessionError },
    WriteFailed { error: SessionError, consecutive: u32 },
    ConnectFailed(SessionError),
    DiscoveryFailed(SessionError),
    Disconnected { by_peer: bool },
}

/// Snapshot published on every state or identity change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub identity: Option<PeripheralIdentity>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Exact advertised name to connect to
    pub device_name: String,
    pub gatt: GattTarget,
    pub scan_timeout: Duration,
    /// Bound on connect + service discovery
    pub connect_timeout: Duration,
    /// Bound on each write, read-back, scan control and disconnect
    pub io_timeout: Duration,
    /// Consecutive write failures treated as link loss
    pub max_write_failures: u32,
    /// Discoveries allowed per rolling minute (0 = unlimited)
    pub max_discovery_attempts_per_minute: u32,
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_name: DEVICE_NAME.to_string(),
            gatt: GattTarget::default(),
            scan_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(5),
            max_write_failures: 3,
            max_discovery_attempts_per_minute: 6,
            command_buffer: 32,
        }
    }
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_name: config.device_name().to_string(),
            gatt: GattTarget {
                service: config.service_uuid(),
                characteristic: config.characteristic_uuid(),
            },
            scan_timeout: Duration::from_millis(config.scan_timeout_ms()),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms()),
            io_timeout: Duration::from_millis(config.io_timeout_ms()),
            max_write_failures: config.max_write_failures(),
            max_discovery_attempts_per_minute: config.max_discovery_attempts_per_minute(),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
enum Command {
    Send(OutboundMessage),
    Disconnect,
}

/// Completion of a spawned radio operation
#[derive(Debug)]
enum OpResult {
    Connected { epoch: u64, id: PeripheralId, result: Result<(), RadioError> },
    Written { epoch: u64, text: String, started: Instant, result: Result<Option<Vec<u8>>, RadioError> },
    Disconnected { epoch: u64 },
}

/// Cloneable front end of the session task
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SessionStatus>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Queue a message for delivery. Never waits on the radio.
    ///
    /// When Idle this starts discovery; while Scanning/Connecting or while a
    /// write is in flight the message replaces any not-yet-sent one.
    pub fn send(&self, message: OutboundMessage) -> Result<(), SessionError> {
        self.cmd_tx.try_send(Command::Send(message)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    /// Cancel discovery or drop the link, ending in Idle
    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.cmd_tx.try_send(Command::Disconnect).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status_rx.borrow().state
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}

pub struct PeripheralSession {
    radio: Arc<dyn Radio>,
    config: SessionConfig,
    metrics: Arc<Metrics>,
    cmd_rx: mpsc::Receiver<Command>,
    radio_rx: broadcast::Receiver<RadioEvent>,
    op_tx: mpsc::Sender<OpResult>,
    op_rx: mpsc::Receiver<OpResult>,
    status_tx: watch::Sender<SessionStatus>,
    events_tx: broadcast::Sender<SessionEvent>,
    state: SessionState,
    identity: Option<PeripheralIdentity>,
    epoch: u64,
    /// Last-message-wins slot
    pending: Option<OutboundMessage>,
    write_in_flight: bool,
    consecutive_write_failures: u32,
    scan_deadline: Option<Instant>,
    discovery_starts: VecDeque<Instant>,
    /// In-flight connect + service discovery, aborted on teardown
    connect_task: Option<JoinHandle<()>>,
}

/// Create a session and its handle
///
/// The radio subscription is taken here so no event is missed between
/// creation and the first poll of [`PeripheralSession::run`].
pub fn create_session(
    radio: Arc<dyn Radio>,
    config: SessionConfig,
    metrics: Arc<Metrics>,
) -> (SessionHandle, PeripheralSession) {
    let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
    let (op_tx, op_rx) = mpsc::channel(16);
    let (status_tx, status_rx) =
        watch::channel(SessionStatus { state: SessionState::Idle, identity: None });
    let (events_tx, _) = broadcast::channel(64);
    let radio_rx = radio.subscribe();

    metrics.set_session_state(SESSION_STATE_IDLE);

    let handle = SessionHandle { cmd_tx, status_rx, events_tx: events_tx.clone() };
    let session = PeripheralSession {
        radio,
        config,
        metrics,
        cmd_rx,
        radio_rx,
        op_tx,
        op_rx,
        status_tx,
        events_tx,
        state: SessionState::Idle,
        identity: None,
        epoch: 0,
        pending: None,
        write_in_flight: false,
        consecutive_write_failures: 0,
        scan_deadline: None,
        discovery_starts: VecDeque::new(),
        connect_task: None,
    };
    (handle, session)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl PeripheralSession {
    /// Run until shutdown or until every handle is dropped, then tear down
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(device_name = %self.config.device_name, "peripheral_session_started");

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },

                event = self.radio_rx.recv() => match event {
                    Ok(event) => self.handle_radio_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = %skipped, "radio_events_lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("radio_event_stream_closed");
                        break;
                    }
                },

                Some(op) = self.op_rx.recv() => self.handle_op(op).await,

                _ = sleep_until_opt(self.scan_deadline) => self.on_scan_timeout().await,

                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.teardown().await;
        info!("peripheral_session_stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send(message) => self.handle_send(message).await,
            Command::Disconnect => self.begin_disconnect().await,
        }
    }

    async fn handle_send(&mut self, message: OutboundMessage) {
        match self.state {
            SessionState::Idle => {
                if !self.discovery_allowed() {
                    warn!(
                        limit = %self.config.max_discovery_attempts_per_minute,
                        "discovery_retry_budget_exhausted"
                    );
                    self.emit(SessionEvent::Dropped {
                        text: message.text(),
                        reason: SessionError::RetryBudgetExhausted,
                    });
                    return;
                }
                self.pending = Some(message);
                self.start_discovery().await;
            }
            SessionState::Connected if !self.write_in_flight => self.start_write(message),
            SessionState::Scanning
            | SessionState::Connecting
            | SessionState::Connected
            | SessionState::Disconnecting => {
                if let Some(replaced) = self.pending.replace(message) {
                    debug!(replaced = %replaced.text(), state = %self.state, "pending_message_replaced");
                }
            }
        }
    }

    /// Record a discovery start if the rolling budget allows it
    fn discovery_allowed(&mut self) -> bool {
        let limit = self.config.max_discovery_attempts_per_minute as usize;
        let now = Instant::now();
        while let Some(&oldest) = self.discovery_starts.front() {
            if now.duration_since(oldest) >= RETRY_WINDOW {
                self.discovery_starts.pop_front();
            } else {
                break;
            }
        }
        if limit > 0 && self.discovery_starts.len() >= limit {
            return false;
        }
        self.discovery_starts.push_back(now);
        true
    }

    async fn start_discovery(&mut self) {
        self.set_state(SessionState::Scanning);
        self.metrics.record_scan_started();

        let result = match timeout(self.config.io_timeout, self.radio.start_scan()).await {
            Ok(result) => result,
            Err(_) => Err(RadioError::Timeout("start_scan")),
        };

        match result {
            Ok(()) => {
                self.scan_deadline = Some(Instant::now() + self.config.scan_timeout);
                info!(device_name = %self.config.device_name, "peripheral_scan_started");
            }
            Err(e) => self.fail_discovery(e.to_string()),
        }
    }

    async fn on_scan_timeout(&mut self) {
        self.scan_deadline = None;
        if self.state != SessionState::Scanning {
            return;
        }
        self.stop_scan().await;
        self.fail_discovery(format!(
            "{} not found within {}ms",
            self.config.device_name,
            self.config.scan_timeout.as_millis()
        ));
    }

    fn fail_discovery(&mut self, reason: String) {
        log_discovery_failed(&reason);
        self.metrics.record_discovery_failure();
        self.scan_deadline = None;
        self.epoch += 1;
        self.identity = None;
        self.set_state(SessionState::Idle);

        let error = SessionError::DiscoveryFailed(reason);
        self.emit(SessionEvent::DiscoveryFailed(error.clone()));
        self.drop_pending(error);
    }

    async fn stop_scan(&self) {
        match timeout(self.config.io_timeout, self.radio.stop_scan()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "peripheral_stop_scan_failed"),
            Err(_) => warn!("peripheral_stop_scan_timeout"),
        }
    }

    async fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Discovered(found) => {
                if self.state != SessionState::Scanning {
                    return;
                }
                if found.name != self.config.device_name {
                    debug!(device = %found.id, name = %found.name, "peripheral_ignored");
                    return;
                }

                info!(device = %found.id, name = %found.name, "peripheral_found");
                self.scan_deadline = None;
                self.stop_scan().await;
                self.identity = Some(found.clone());
                self.set_state(SessionState::Connecting);
                self.spawn_connect(found.id);
            }
            RadioEvent::Disconnected(id) => {
                let ours = self.identity.as_ref().is_some_and(|identity| identity.id == id);
                if !ours {
                    return;
                }
                match self.state {
                    SessionState::Disconnecting => self.on_link_down(false).await,
                    SessionState::Connecting | SessionState::Connected => {
                        self.on_link_down(true).await
                    }
                    SessionState::Idle | SessionState::Scanning => {}
                }
            }
        }
    }

    fn spawn_connect(&mut self, id: PeripheralId) {
        let radio = self.radio.clone();
        let op_tx = self.op_tx.clone();
        let epoch = self.epoch;
        let gatt = self.config.gatt;
        let bound = self.config.connect_timeout;

        let task = tokio::spawn(async move {
            let attempt = async {
                radio.connect(&id).await?;
                radio.discover(&id, gatt).await
            };
            let result = match timeout(bound, attempt).await {
                Ok(result) => result,
                Err(_) => Err(RadioError::Timeout("connect")),
            };
            let linked = result.is_ok();
            if op_tx.send(OpResult::Connected { epoch, id: id.clone(), result }).await.is_err()
                && linked
            {
                // Session gone: release the link here
                if let Ok(Err(e)) = timeout(bound, radio.disconnect(&id)).await {
                    debug!(device = %id, error = %e, "peripheral_release_failed");
                }
            }
        });
        self.connect_task = Some(task);
    }

    fn start_write(&mut self, message: OutboundMessage) {
        let Some(identity) = self.identity.as_ref() else {
            self.pending = Some(message);
            return;
        };

        let id = identity.id.clone();
        let text = message.text();
        let payload = message.encode_payload();
        debug!(text = %text, payload = %hex::encode(&payload), "peripheral_write_started");

        self.write_in_flight = true;

        let radio = self.radio.clone();
        let op_tx = self.op_tx.clone();
        let epoch = self.epoch;
        let gatt = self.config.gatt;
        let bound = self.config.io_timeout;

        tokio::spawn(async move {
            let started = Instant::now();
            let result = match timeout(bound, radio.write(&id, gatt, &payload)).await {
                Ok(Ok(())) => {
                    let readback = match timeout(bound, radio.read(&id, gatt)).await {
                        Ok(Ok(value)) => Some(value),
                        Ok(Err(e)) => {
                            warn!(error = %e, "peripheral_readback_failed");
                            None
                        }
                        Err(_) => {
                            warn!("peripheral_readback_timeout");
                            None
                        }
                    };
                    Ok(readback)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(RadioError::Timeout("write")),
            };
            let _ = op_tx.send(OpResult::Written { epoch, text, started, result }).await;
        });
    }

    async fn handle_op(&mut self, op: OpResult) {
        match op {
            OpResult::Connected { epoch, id, result } => self.on_connected(epoch, id, result),
            OpResult::Written { epoch, text, started, result } => {
                self.on_written(epoch, text, started, result).await
            }
            OpResult::Disconnected { epoch } => {
                if epoch == self.epoch && self.state == SessionState::Disconnecting {
                    self.on_link_down(false).await;
                }
            }
        }
    }

    fn on_connected(&mut self, epoch: u64, id: PeripheralId, result: Result<(), RadioError>) {
        if epoch == self.epoch {
            self.connect_task = None;
        }
        if epoch != self.epoch || self.state != SessionState::Connecting {
            debug!(device = %id, epoch = %epoch, current_epoch = %self.epoch, "stale_connect_result_ignored");
            if result.is_ok() {
                self.spawn_release(id);
            }
            return;
        }

        match result {
            Ok(()) => {
                info!(device = %id, "peripheral_connected");
                self.consecutive_write_failures = 0;
                self.set_state(SessionState::Connected);
                if let Some(message) = self.pending.take() {
                    self.start_write(message);
                }
            }
            Err(e) => {
                log_connect_failed(&id, &e);
                self.spawn_release(id);

                let error = match e {
                    RadioError::ServiceNotFound(_) | RadioError::CharacteristicNotFound(_) => {
                        self.metrics.record_discovery_failure();
                        SessionError::DiscoveryFailed(e.to_string())
                    }
                    _ => {
                        self.metrics.record_connect_failure();
                        SessionError::ConnectFailed(e.to_string())
                    }
                };

                self.epoch += 1;
                self.identity = None;
                self.set_state(SessionState::Idle);
                match &error {
                    SessionError::DiscoveryFailed(_) => {
                        self.emit(SessionEvent::DiscoveryFailed(error.clone()))
                    }
                    _ => self.emit(SessionEvent::ConnectFailed(error.clone())),
                }
                self.drop_pending(error);
            }
        }
    }

    async fn on_written(
        &mut self,
        epoch: u64,
        text: String,
        started: Instant,
        result: Result<Option<Vec<u8>>, RadioError>,
    ) {
        if epoch != self.epoch {
            debug!(text = %text, "stale_write_result_ignored");
            return;
        }
        self.write_in_flight = false;

        match result {
            Ok(readback) => {
                self.consecutive_write_failures = 0;
                let latency_ms = started.elapsed().as_millis() as u64;
                self.metrics.record_delivered(latency_ms);

                let readback = readback.and_then(|value| decode_payload(&value));
                if let Some(echo) = readback.as_deref() {
                    if echo != text {
                        warn!(sent = %text, readback = %echo, "peripheral_readback_mismatch");
                    }
                }
                info!(text = %text, latency_ms = %latency_ms, "message_delivered");
                self.emit(SessionEvent::Delivered { text, readback, latency_ms });
            }
            Err(e) => {
                self.consecutive_write_failures += 1;
                let consecutive = self.consecutive_write_failures;
                self.metrics.record_write_failure();
                log_write_failed(&e, consecutive);
                self.emit(SessionEvent::WriteFailed {
                    error: SessionError::WriteFailed(e.to_string()),
                    consecutive,
                });

                if consecutive >= self.config.max_write_failures {
                    warn!(consecutive = %consecutive, "peripheral_link_presumed_lost");
                    self.begin_disconnect().await;
                    return;
                }
            }
        }

        if self.state == SessionState::Connected {
            if let Some(message) = self.pending.take() {
                self.start_write(message);
            }
        }
    }

    /// Explicit disconnect from whatever state the session is in
    async fn begin_disconnect(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Disconnecting => {}
            SessionState::Scanning => {
                self.scan_deadline = None;
                self.stop_scan().await;
                self.epoch += 1;
                self.set_state(SessionState::Idle);
                self.drop_pending(SessionError::Disconnected);
            }
            SessionState::Connecting => {
                // The connect task is still running; its result will be stale
                self.epoch += 1;
                self.identity = None;
                self.set_state(SessionState::Idle);
                self.drop_pending(SessionError::Disconnected);
            }
            SessionState::Connected => {
                self.epoch += 1;
                self.write_in_flight = false;
                self.set_state(SessionState::Disconnecting);

                let Some(id) = self.identity.as_ref().map(|identity| identity.id.clone()) else {
                    self.on_link_down(false).await;
                    return;
                };

                let radio = self.radio.clone();
                let op_tx = self.op_tx.clone();
                let epoch = self.epoch;
                let bound = self.config.io_timeout;
                tokio::spawn(async move {
                    match timeout(bound, radio.disconnect(&id)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(device = %id, error = %e, "peripheral_disconnect_failed"),
                        Err(_) => warn!(device = %id, "peripheral_disconnect_timeout"),
                    }
                    let _ = op_tx.send(OpResult::Disconnected { epoch }).await;
                });
            }
        }
    }

    async fn on_link_down(&mut self, by_peer: bool) {
        self.epoch += 1;
        self.identity = None;
        self.write_in_flight = false;
        self.consecutive_write_failures = 0;
        self.metrics.record_disconnect();
        self.set_state(SessionState::Idle);
        self.emit(SessionEvent::Disconnected { by_peer });

        if by_peer {
            warn!("peripheral_disconnected_by_peer");
            self.drop_pending(SessionError::Disconnected);
        } else {
            info!("peripheral_disconnected");
            // A message queued while the link was going down starts a fresh discovery
            if let Some(message) = self.pending.take() {
                self.handle_send(message).await;
            }
        }
    }

    /// Best-effort disconnect of a link the session no longer tracks
    fn spawn_release(&self, id: PeripheralId) {
        let radio = self.radio.clone();
        let bound = self.config.io_timeout;
        tokio::spawn(async move {
            if let Ok(Err(e)) = timeout(bound, radio.disconnect(&id)).await {
                debug!(device = %id, error = %e, "peripheral_release_failed");
            }
        });
    }

    async fn teardown(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        match self.state {
            SessionState::Scanning => self.stop_scan().await,
            SessionState::Connecting | SessionState::Connected | SessionState::Disconnecting => {
                if let Some(identity) = self.identity.take() {
                    match timeout(self.config.io_timeout, self.radio.disconnect(&identity.id)).await {
                        Ok(Ok(())) => info!(device = %identity.id, "peripheral_released"),
                        Ok(Err(e)) => warn!(error = %e, "peripheral_disconnect_failed"),
                        Err(_) => warn!("peripheral_disconnect_timeout"),
                    }
                }
            }
            SessionState::Idle => {}
        }

        self.epoch += 1;
        self.scan_deadline = None;
        self.identity = None;
        self.write_in_flight = false;
        if let Some(message) = self.pending.take() {
            debug!(text = %message.text(), "pending_message_discarded");
        }
        self.set_state(SessionState::Idle);
    }

    fn drop_pending(&mut self, reason: SessionError) {
        if let Some(message) = self.pending.take() {
            debug!(text = %message.text(), reason = %reason, "pending_message_dropped");
            self.emit(SessionEvent::Dropped { text: message.text(), reason });
        }
    }

    fn set_state(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        self.metrics.set_session_state(to.metric_value());
        self.status_tx
            .send_replace(SessionStatus { state: to, identity: self.identity.clone() });
        info!(from = %from, to = %to, "session_state_changed");
        self.emit(SessionEvent::StateChanged { from, to });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }
}
