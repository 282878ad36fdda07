//! The managed listening socket a server node starts and stops on command.
//!
//! [`ManagedSocket`] is the seam the controller drives its listener through;
//! [`SocketServer`] is the concrete TCP implementation. The data-plane
//! payloads reuse the control framing — their semantics belong to the test
//! scenarios running against the node, not to this crate.

use std::io;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ack_params, ControlFrame, FrameKind, Param};

const EVENT_CAPACITY: usize = 64;

/// Lifecycle status of a managed listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSeverity {
    Info,
    Warning,
    Error,
}

/// A trace log entry raised by the listener.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub severity: TraceSeverity,
    pub message: String,
}

/// Everything a managed listener can tell its owner.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    StatusChanged(ListenerStatus),
    Trace(TraceEvent),
    MessageReceived { client_id: u64, params: Vec<Param> },
    RequestReceived { client_id: u64, params: Vec<Param> },
    ClientsChanged(usize),
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("listener already started")]
    AlreadyStarted,
}

/// The listener contract the controller owns its managed socket through.
///
/// Implementations report lifecycle and traffic through a broadcast channel
/// with event-shaped payloads the controller passes through unmodified.
#[async_trait]
pub trait ManagedSocket: Send + Sync {
    /// Bind and start accepting. Bind errors surface here.
    async fn start(&self) -> Result<(), ListenerError>;

    /// Stop accepting and drop all client connections. Idempotent.
    async fn stop(&self) -> Result<(), ListenerError>;

    fn status(&self) -> ListenerStatus;

    fn subscribe(&self) -> broadcast::Receiver<ListenerEvent>;

    /// The port this listener was asked to bind.
    fn port(&self) -> u16;
}

/// TCP implementation of [`ManagedSocket`].
pub struct SocketServer {
    port: u16,
    local_port: AtomicU16,
    status: RwLock<ListenerStatus>,
    events: broadcast::Sender<ListenerEvent>,
    clients: Arc<AtomicUsize>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl SocketServer {
    pub fn new(port: u16) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            port,
            local_port: AtomicU16::new(0),
            status: RwLock::new(ListenerStatus::Stopped),
            events,
            clients: Arc::new(AtomicUsize::new(0)),
            cancel: Mutex::new(None),
        }
    }

    /// The actually-bound port. Differs from `port()` when constructed
    /// with port 0 (tests).
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Relaxed)
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: ListenerStatus) {
        *self.status.write() = status;
        // Ignore error - means no receivers
        let _ = self.events.send(ListenerEvent::StatusChanged(status));
    }
}

#[async_trait]
impl ManagedSocket for SocketServer {
    async fn start(&self) -> Result<(), ListenerError> {
        {
            let status = *self.status.read();
            if status == ListenerStatus::Started || status == ListenerStatus::Starting {
                return Err(ListenerError::AlreadyStarted);
            }
        }
        self.set_status(ListenerStatus::Starting);

        let listener = match TcpListener::bind(("0.0.0.0", self.port)).await {
            Ok(l) => l,
            Err(e) => {
                self.set_status(ListenerStatus::Stopped);
                return Err(ListenerError::Bind {
                    port: self.port,
                    source: e,
                });
            }
        };
        let local_port = listener.local_addr().map(|a| a.port()).unwrap_or(self.port);
        self.local_port.store(local_port, Ordering::Relaxed);

        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());

        self.set_status(ListenerStatus::Started);
        trace(
            &self.events,
            TraceSeverity::Info,
            format!("listening on port {}", local_port),
        );
        tracing::info!(port = local_port, "socket server listening");

        tokio::spawn(accept_loop(
            listener,
            self.events.clone(),
            self.clients.clone(),
            cancel,
        ));
        Ok(())
    }

    async fn stop(&self) -> Result<(), ListenerError> {
        // A token exists only after a successful bind; taking it makes a
        // second stop a no-op.
        let Some(token) = self.cancel.lock().take() else {
            return Ok(());
        };
        self.set_status(ListenerStatus::Stopping);
        token.cancel();
        self.set_status(ListenerStatus::Stopped);
        trace(
            &self.events,
            TraceSeverity::Info,
            format!("stopped listening on port {}", self.local_port()),
        );
        tracing::info!(port = self.local_port(), "socket server stopped");
        Ok(())
    }

    fn status(&self) -> ListenerStatus {
        *self.status.read()
    }

    fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.events.subscribe()
    }

    fn port(&self) -> u16 {
        self.port
    }
}

fn trace(events: &broadcast::Sender<ListenerEvent>, severity: TraceSeverity, message: String) {
    let _ = events.send(ListenerEvent::Trace(TraceEvent { severity, message }));
}

async fn accept_loop(
    listener: TcpListener,
    events: broadcast::Sender<ListenerEvent>,
    clients: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut next_client_id: u64 = 1;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let client_id = next_client_id;
                    next_client_id += 1;
                    let count = clients.fetch_add(1, Ordering::SeqCst) + 1;
                    let _ = events.send(ListenerEvent::ClientsChanged(count));
                    trace(
                        &events,
                        TraceSeverity::Info,
                        format!("client {} connected from {}", client_id, addr),
                    );
                    tokio::spawn(handle_client(
                        stream,
                        client_id,
                        events.clone(),
                        clients.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    trace(
                        &events,
                        TraceSeverity::Warning,
                        format!("accept failed: {}", e),
                    );
                    // Backoff to prevent a tight loop under sustained accept errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    client_id: u64,
    events: broadcast::Sender<ListenerEvent>,
    clients: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            result = ControlFrame::read_from(&mut stream) => match result {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(client_id, error = %e, "client connection ended");
                    break;
                }
            }
        };

        match frame.kind {
            FrameKind::Message => {
                let _ = events.send(ListenerEvent::MessageReceived {
                    client_id,
                    params: frame.params,
                });
            }
            FrameKind::Request => {
                let _ = events.send(ListenerEvent::RequestReceived {
                    client_id,
                    params: frame.params.clone(),
                });
                let response = ControlFrame::response(frame.id, ack_params());
                if response.write_to(&mut stream).await.is_err() {
                    break;
                }
            }
            FrameKind::Response => {
                // The node never sends data-plane requests, so a response
                // here is a confused peer.
                trace(
                    &events,
                    TraceSeverity::Warning,
                    format!("client {} sent an unexpected response frame", client_id),
                );
            }
        }
    }

    let count = clients.fetch_sub(1, Ordering::SeqCst) - 1;
    let _ = events.send(ListenerEvent::ClientsChanged(count));
    trace(
        &events,
        TraceSeverity::Info,
        format!("client {} disconnected", client_id),
    );
}
