//! The server-side role object: bridges control-bus commands to the
//! lifecycle of a managed listening socket and unifies every observable
//! event behind one subscription surface.
//!
//! All listener lifecycle transitions are serialized: the inbound-request
//! dispatcher is a single consumer, and the public start/stop methods take
//! the same slot lock, so two listeners can never coexist and a stop can
//! never race a start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BusConfig;
use crate::control_bus::{BusEvent, ClientRole, ControlBusClient};
use crate::listener::{
    ListenerError, ListenerEvent, ListenerStatus, ManagedSocket, SocketServer, TraceEvent,
};
use crate::protocol::{
    ack_params, int_arg, nack_params, opcode, ControlOp, Param, ProtocolViolation,
};
use crate::transport::{ConnectionStatus, InboundRequest};

const EVENT_CAPACITY: usize = 64;

/// Notifications re-exported by a [`ServerController`]: the managed
/// listener's events passed through unmodified, plus controller-level
/// control-bus notifications.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    ListenerStatusChanged(ListenerStatus),
    Trace(TraceEvent),
    MessageReceived { client_id: u64, params: Vec<Param> },
    RequestReceived { client_id: u64, params: Vec<Param> },
    ClientsChanged(usize),
    /// Terminal: the control-bus connection could not be established or was
    /// lost. This node should abort.
    ControlBusConnectionFailed,
    ExceptionRaised(String),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Violation(#[from] ProtocolViolation),

    #[error("port {0} out of range")]
    PortOutOfRange(i64),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Builds the managed listener for a port. Swappable so tests can observe
/// lifecycle calls without binding real sockets.
pub type ListenerFactory = Box<dyn Fn(u16) -> Arc<dyn ManagedSocket> + Send + Sync>;

struct ActiveListener {
    socket: Arc<dyn ManagedSocket>,
    forward_cancel: CancellationToken,
    forwarder: JoinHandle<()>,
}

/// Controls a managed socket server on behalf of the harness.
pub struct ServerController {
    control_bus: ControlBusClient,
    listener_slot: tokio::sync::Mutex<Option<ActiveListener>>,
    port: Mutex<u16>,
    events: broadcast::Sender<ControllerEvent>,
    make_listener: ListenerFactory,
    started: AtomicBool,
    disposed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerController {
    pub fn new(client_id: i32, config: &BusConfig) -> Arc<Self> {
        Self::with_listener_factory(
            client_id,
            config,
            Box::new(|port| Arc::new(SocketServer::new(port)) as Arc<dyn ManagedSocket>),
        )
    }

    /// Must be called from within a tokio runtime: construction subscribes
    /// to the control-bus client's notifications and spawns the forwarding
    /// task, so a failure raised during the handshake is never lost.
    pub fn with_listener_factory(
        client_id: i32,
        config: &BusConfig,
        make_listener: ListenerFactory,
    ) -> Arc<Self> {
        let control_bus = ControlBusClient::new(ClientRole::ServerController, client_id, config);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut bus_events = control_bus.subscribe();
        let forwarded = events.clone();
        let bus_forwarder = tokio::spawn(async move {
            loop {
                match bus_events.recv().await {
                    Ok(BusEvent::ConnectionFailed) => {
                        let _ = forwarded.send(ControllerEvent::ControlBusConnectionFailed);
                    }
                    Ok(BusEvent::ExceptionRaised(message)) => {
                        let _ = forwarded.send(ControllerEvent::ExceptionRaised(message));
                    }
                    Ok(BusEvent::StatusChanged(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "control bus event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Arc::new(Self {
            control_bus,
            listener_slot: tokio::sync::Mutex::new(None),
            port: Mutex::new(0),
            events,
            make_listener,
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            tasks: Mutex::new(vec![bus_forwarder]),
        })
    }

    pub fn client_id(&self) -> i32 {
        self.control_bus.client_id()
    }

    /// The port the managed listener should bind. Records intent — it is
    /// independent of whether a listener is currently bound to it.
    pub fn port(&self) -> u16 {
        *self.port.lock()
    }

    pub fn set_port(&self, port: u16) {
        *self.port.lock() = port;
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.control_bus.connection_status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Status of the currently-managed listener, if any.
    pub async fn listener_status(&self) -> Option<ListenerStatus> {
        self.listener_slot
            .lock()
            .await
            .as_ref()
            .map(|active| active.socket.status())
    }

    /// Connect to the harness (see [`ControlBusClient::start`] for the
    /// blocking/timeout behavior) and begin dispatching inbound control
    /// requests.
    pub async fn start(self: &Arc<Self>, cancel: &CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            self.control_bus.start(cancel).await;
            return;
        }

        self.control_bus.start(cancel).await;

        if let Some(mut requests) = self.control_bus.take_requests() {
            let controller = self.clone();
            let handle = tokio::spawn(async move {
                while let Some(request) = requests.recv().await {
                    controller.handle_request(request).await;
                }
                tracing::debug!("control request dispatcher exited");
            });
            self.tasks.lock().push(handle);
        }
    }

    async fn handle_request(&self, request: InboundRequest) {
        let reply = match self.dispatch(&request.params).await {
            Ok(()) => ack_params(),
            Err(e) => {
                let message = e.to_string();
                tracing::error!(%message, "control request failed");
                let _ = self
                    .events
                    .send(ControllerEvent::ExceptionRaised(message.clone()));
                nack_params(&message)
            }
        };
        request.respond(reply);
    }

    /// Decode and execute one inbound control request.
    async fn dispatch(&self, params: &[Param]) -> Result<(), ControllerError> {
        let op = opcode(params)?;
        match op {
            ControlOp::SocketServerStart => {
                let raw = int_arg(params, 1, "port")?;
                let port =
                    u16::try_from(raw).map_err(|_| ControllerError::PortOutOfRange(raw))?;
                // Restart even when the port is unchanged: the harness asked
                // for a fresh listener and gets one.
                let mut slot = self.listener_slot.lock().await;
                self.stop_locked(&mut slot).await?;
                self.start_locked(&mut slot, port).await
            }
            ControlOp::SocketServerStop => {
                let mut slot = self.listener_slot.lock().await;
                self.stop_locked(&mut slot).await
            }
            other => Err(ProtocolViolation::UnsupportedOpcode(other as i64).into()),
        }
    }

    /// Start a managed listener on `port`, replacing any current one.
    pub async fn start_socket_server(&self, port: u16) -> Result<(), ControllerError> {
        let mut slot = self.listener_slot.lock().await;
        self.stop_locked(&mut slot).await?;
        self.start_locked(&mut slot, port).await
    }

    /// Stop the managed listener. No-op when none is active.
    pub async fn stop_socket_server(&self) -> Result<(), ControllerError> {
        let mut slot = self.listener_slot.lock().await;
        self.stop_locked(&mut slot).await
    }

    async fn start_locked(
        &self,
        slot: &mut Option<ActiveListener>,
        port: u16,
    ) -> Result<(), ControllerError> {
        self.set_port(port);
        let socket = (self.make_listener)(port);

        // Subscribe before starting so no lifecycle event is missed.
        let forward_cancel = CancellationToken::new();
        let forwarder = tokio::spawn(forward_listener_events(
            socket.subscribe(),
            self.events.clone(),
            forward_cancel.clone(),
        ));
        *slot = Some(ActiveListener {
            socket: socket.clone(),
            forward_cancel,
            forwarder,
        });

        socket.start().await?;
        tracing::info!(port, "managed listener started");
        Ok(())
    }

    async fn stop_locked(&self, slot: &mut Option<ActiveListener>) -> Result<(), ControllerError> {
        let Some(active) = slot.take() else {
            return Ok(());
        };

        // Unsubscribe first, unconditionally — nothing from a listener being
        // torn down may reach subscribers, even if it was never started.
        active.forward_cancel.cancel();
        let _ = active.forwarder.await;

        if active.socket.status() == ListenerStatus::Started {
            active.socket.stop().await?;
        }
        tracing::info!("managed listener stopped");
        Ok(())
    }

    /// Full shutdown: stop the control-bus connection, then the managed
    /// listener.
    pub async fn stop_all(&self) -> Result<(), ControllerError> {
        self.control_bus.stop();
        self.stop_socket_server().await
    }

    /// Idempotent teardown. Stops and releases the managed listener and the
    /// background tasks; never panics, so it is safe on any exit path.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.stop_socket_server().await {
            tracing::warn!(error = %e, "listener stop failed during shutdown");
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for ServerController {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        if let Ok(mut slot) = self.listener_slot.try_lock() {
            if let Some(active) = slot.take() {
                active.forward_cancel.cancel();
                active.forwarder.abort();
            }
        }
    }
}

async fn forward_listener_events(
    mut rx: broadcast::Receiver<ListenerEvent>,
    events: broadcast::Sender<ControllerEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = rx.recv() => {
                // Re-check: an event that raced the cancel must not leak out.
                if cancel.is_cancelled() {
                    break;
                }
                match result {
                    Ok(event) => {
                        let _ = events.send(map_listener_event(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "listener event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

fn map_listener_event(event: ListenerEvent) -> ControllerEvent {
    match event {
        ListenerEvent::StatusChanged(status) => ControllerEvent::ListenerStatusChanged(status),
        ListenerEvent::Trace(trace) => ControllerEvent::Trace(trace),
        ListenerEvent::MessageReceived { client_id, params } => {
            ControllerEvent::MessageReceived { client_id, params }
        }
        ListenerEvent::RequestReceived { client_id, params } => {
            ControllerEvent::RequestReceived { client_id, params }
        }
        ListenerEvent::ClientsChanged(count) => ControllerEvent::ClientsChanged(count),
    }
}
