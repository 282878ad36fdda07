//! The node side of the control bus: bounded-time connection establishment
//! and identity registration with the harness.
//!
//! A [`ControlBusClient`] owns exactly one transport for its lifetime.
//! `start` waits — polling, with a hard upper bound — for the connection to
//! come up; an unreachable harness is reported as a terminal
//! [`BusEvent::ConnectionFailed`] rather than an error, because the owning
//! node is expected to observe it and shut down.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BusConfig;
use crate::protocol::{parse_ack, ControlOp, Param};
use crate::transport::{BusConnection, ConnectionStatus, InboundRequest};

const EVENT_CAPACITY: usize = 64;

/// Which role this node plays on the control bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    ClientController,
    ServerController,
}

/// Notifications raised by a [`ControlBusClient`].
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// The transport's connection status changed.
    StatusChanged(ConnectionStatus),
    /// Terminal: the handshake did not complete within its bound. The
    /// owning node should abort.
    ConnectionFailed,
    /// An error occurred while handling a status change (e.g. the
    /// registration request failed). The control connection can no longer
    /// be considered healthy.
    ExceptionRaised(String),
}

/// Client for the dedicated command channel between this node and the
/// harness.
pub struct ControlBusClient {
    client_id: i32,
    role: ClientRole,
    harness_address: String,
    control_port: u16,
    handshake_timeout: Duration,
    poll_interval: Duration,
    transport: Mutex<Option<Arc<BusConnection>>>,
    registrar: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<BusEvent>,
}

impl ControlBusClient {
    pub fn new(role: ClientRole, client_id: i32, config: &BusConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            client_id,
            role,
            harness_address: config.harness_address.clone(),
            control_port: config.control_port,
            handshake_timeout: config.handshake_timeout(),
            poll_interval: config.poll_interval(),
            transport: Mutex::new(None),
            registrar: Mutex::new(None),
            events,
        }
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    pub fn role(&self) -> ClientRole {
        self.role
    }

    pub fn harness_address(&self) -> &str {
        &self.harness_address
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.transport
            .lock()
            .as_ref()
            .map(|t| t.status())
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Take the inbound control-request channel. Present once the transport
    /// exists (after the first `start`); panics if taken twice.
    pub fn take_requests(&self) -> Option<mpsc::Receiver<InboundRequest>> {
        self.transport.lock().as_ref().map(|t| t.take_requests())
    }

    /// Connect to the harness and wait for the link to come up.
    ///
    /// The transport is created on the first call; a second `start` finds
    /// it already present and just re-enters the wait. The wait polls
    /// connection status on a fixed interval and gives up after the
    /// configured bound, stopping the transport and emitting exactly one
    /// terminal [`BusEvent::ConnectionFailed`].
    ///
    /// Cancelling `cancel` abandons the wait without emitting anything.
    /// `stop` does not interrupt an in-flight `start`; the token is the
    /// embedding layer's tool for that.
    pub async fn start(&self, cancel: &CancellationToken) {
        let transport = {
            let mut guard = self.transport.lock();
            match guard.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let created = Arc::new(BusConnection::connect(
                        self.harness_address.clone(),
                        self.control_port,
                    ));
                    *guard = Some(created.clone());
                    let handle = tokio::spawn(registrar_loop(
                        created.clone(),
                        self.events.clone(),
                        self.client_id,
                    ));
                    *self.registrar.lock() = Some(handle);
                    created
                }
            }
        };

        let deadline = tokio::time::Instant::now() + self.handshake_timeout;
        loop {
            if transport.status() == ConnectionStatus::Connected {
                tracing::info!(client_id = self.client_id, "control bus handshake complete");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                transport.disconnect();
                tracing::error!(
                    client_id = self.client_id,
                    address = %self.harness_address,
                    port = self.control_port,
                    timeout_ms = self.handshake_timeout.as_millis() as u64,
                    "control bus connection failed"
                );
                let _ = self.events.send(BusEvent::ConnectionFailed);
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    tracing::debug!(client_id = self.client_id, "handshake wait cancelled");
                    return;
                }
            }
        }
    }

    /// Disconnect the transport. Idempotent; there is no reconnection after
    /// an explicit stop.
    pub fn stop(&self) {
        if let Some(transport) = self.transport.lock().as_ref() {
            transport.disconnect();
        }
        if let Some(handle) = self.registrar.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for ControlBusClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Watches the transport's status. On every transition into Connected it
/// registers this node's identity with the harness — exactly once per
/// connect, however many times the status notification fires.
async fn registrar_loop(
    transport: Arc<BusConnection>,
    events: broadcast::Sender<BusEvent>,
    client_id: i32,
) {
    let mut status_rx = transport.status_changes();
    let mut registered = false;
    let mut last_emitted: Option<ConnectionStatus> = None;

    loop {
        let status = *status_rx.borrow_and_update();
        match status {
            ConnectionStatus::Connected => {
                if !registered {
                    registered = true;
                    if let Err(message) = register(&transport, client_id).await {
                        let message = format!("control bus registration failed: {}", message);
                        tracing::error!(client_id, %message);
                        let _ = events.send(BusEvent::ExceptionRaised(message));
                        return;
                    }
                    tracing::info!(client_id, "registered with harness");
                }
            }
            ConnectionStatus::Disconnected => registered = false,
            ConnectionStatus::Connecting => {}
        }

        if last_emitted != Some(status) {
            last_emitted = Some(status);
            // Ignore error - means no receivers
            let _ = events.send(BusEvent::StatusChanged(status));
        }

        if status_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn register(transport: &BusConnection, client_id: i32) -> Result<(), String> {
    let params = vec![
        Param::Int(ControlOp::ClientIsConnecting as i64),
        Param::Int(client_id as i64),
    ];
    let response = transport
        .send_request(params)
        .await
        .map_err(|e| e.to_string())?;
    parse_ack(&response)
}
