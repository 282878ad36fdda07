//! TCP transport for the control bus.
//!
//! A [`BusConnection`] is the node side of the point-to-point command
//! channel: it dials the harness in a background task (retrying until shut
//! down), publishes connection status through a watch channel, and
//! multiplexes request/response traffic over a single framed stream.
//!
//! The transport never gives up on its own — it keeps redialing until
//! [`BusConnection::disconnect`] is called. Deciding that a connection
//! attempt has taken too long is the control-bus client's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::protocol::{ControlFrame, FrameKind, Param};

/// Delay between dial attempts while the harness is unreachable.
const DIAL_RETRY: Duration = Duration::from_millis(500);

/// How long a request waits for its response before failing.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const OUTBOUND_CAPACITY: usize = 64;
const REQUEST_CAPACITY: usize = 64;
const MESSAGE_CAPACITY: usize = 64;

/// Connection status of the transport, as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("control bus transport is closed")]
    Closed,

    #[error("control bus connection lost with a request in flight")]
    ConnectionLost,

    #[error("control bus request timed out after {0:?}")]
    RequestTimeout(Duration),
}

/// An inbound request from the peer, carrying a one-shot reply handle.
#[derive(Debug)]
pub struct InboundRequest {
    pub params: Vec<Param>,
    reply: oneshot::Sender<Vec<Param>>,
}

impl InboundRequest {
    /// Send the response parameter list back to the peer.
    ///
    /// If the connection dropped in the meantime the response is discarded.
    pub fn respond(self, params: Vec<Param>) {
        let _ = self.reply.send(params);
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Vec<Param>>>>>;

/// One outbound control-bus connection to the harness.
pub struct BusConnection {
    status_rx: watch::Receiver<ConnectionStatus>,
    outbound_tx: mpsc::Sender<ControlFrame>,
    pending: PendingMap,
    next_id: AtomicU64,
    requests_rx: Mutex<Option<mpsc::Receiver<InboundRequest>>>,
    messages_tx: broadcast::Sender<Vec<Param>>,
    cancel: CancellationToken,
}

impl BusConnection {
    /// Spawn the background connection task dialing `address:port`.
    ///
    /// Returns immediately; watch [`BusConnection::status_changes`] to see
    /// when the connection is actually up.
    pub fn connect(address: String, port: u16) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CAPACITY);
        let (messages_tx, _) = broadcast::channel(MESSAGE_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(connection_loop(
            address,
            port,
            status_tx,
            outbound_rx,
            outbound_tx.clone(),
            pending.clone(),
            requests_tx,
            messages_tx.clone(),
            cancel.clone(),
        ));

        Self {
            status_rx,
            outbound_tx,
            pending,
            next_id: AtomicU64::new(1),
            requests_rx: Mutex::new(Some(requests_rx)),
            messages_tx,
            cancel,
        }
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// A watch receiver notified on every status transition.
    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Send a fire-and-forget message.
    pub async fn send(&self, params: Vec<Param>) -> Result<(), TransportError> {
        self.outbound_tx
            .send(ControlFrame::message(params))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Send a request and wait for the peer's response parameters.
    pub async fn send_request(&self, params: Vec<Param>) -> Result<Vec<Param>, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = ControlFrame::request(id, params);
        if self.outbound_tx.send(frame).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped: the connection went down with the request in flight.
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(TransportError::RequestTimeout(REQUEST_TIMEOUT))
            }
        }
    }

    /// Take the inbound-request channel out of the connection.
    ///
    /// The dispatcher is singular — this method panics if called more than
    /// once.
    pub fn take_requests(&self) -> mpsc::Receiver<InboundRequest> {
        self.requests_rx
            .lock()
            .take()
            .expect("take_requests() called more than once")
    }

    /// Subscribe to inbound fire-and-forget messages.
    pub fn messages(&self) -> broadcast::Receiver<Vec<Param>> {
        self.messages_tx.subscribe()
    }

    /// Stop the connection task and give up the link. Idempotent; there is
    /// no reconnection after an explicit disconnect.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn connection_loop(
    address: String,
    port: u16,
    status_tx: watch::Sender<ConnectionStatus>,
    mut outbound_rx: mpsc::Receiver<ControlFrame>,
    outbound_tx: mpsc::Sender<ControlFrame>,
    pending: PendingMap,
    requests_tx: mpsc::Sender<InboundRequest>,
    messages_tx: broadcast::Sender<Vec<Param>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let _ = status_tx.send(ConnectionStatus::Connecting);

        let dialed = tokio::select! {
            result = TcpStream::connect((address.as_str(), port)) => Some(result),
            _ = cancel.cancelled() => None,
        };
        let Some(dialed) = dialed else { break };

        match dialed {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let _ = status_tx.send(ConnectionStatus::Connected);
                tracing::info!(%address, port, "control bus connected");

                let recovered = run_connected(
                    stream,
                    outbound_rx,
                    &outbound_tx,
                    &pending,
                    &requests_tx,
                    &messages_tx,
                    &cancel,
                )
                .await;
                fail_pending(&pending);

                match recovered {
                    Some(rx) => outbound_rx = rx,
                    None => break,
                }
                if cancel.is_cancelled() {
                    break;
                }
                let _ = status_tx.send(ConnectionStatus::Disconnected);
                tracing::warn!(%address, port, "control bus disconnected");
            }
            Err(e) => {
                tracing::debug!(%address, port, error = %e, "control bus dial failed");
                let _ = status_tx.send(ConnectionStatus::Disconnected);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(DIAL_RETRY) => {}
            _ = cancel.cancelled() => break,
        }
    }

    let _ = status_tx.send(ConnectionStatus::Disconnected);
    fail_pending(&pending);
    tracing::debug!(%address, port, "control bus connection task exited");
}

/// Run one established connection until it drops or the transport is
/// cancelled. Returns the outbound receiver for reuse on reconnect, or
/// `None` if the writer task was lost.
async fn run_connected(
    stream: TcpStream,
    outbound_rx: mpsc::Receiver<ControlFrame>,
    outbound_tx: &mpsc::Sender<ControlFrame>,
    pending: &PendingMap,
    requests_tx: &mpsc::Sender<InboundRequest>,
    messages_tx: &broadcast::Sender<Vec<Param>>,
    cancel: &CancellationToken,
) -> Option<mpsc::Receiver<ControlFrame>> {
    let (mut reader, writer) = stream.into_split();

    // The writer runs in its own task so a blocked read never delays
    // outbound frames; it hands the receiver back when the link closes.
    let writer_cancel = CancellationToken::new();
    let writer_task = tokio::spawn(write_loop(writer, outbound_rx, writer_cancel.clone()));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = ControlFrame::read_from(&mut reader) => match result {
                Ok(frame) => handle_inbound(frame, outbound_tx, pending, requests_tx, messages_tx),
                Err(e) => {
                    tracing::debug!(error = %e, "control bus read ended");
                    break;
                }
            }
        }
    }

    writer_cancel.cancel();
    writer_task.await.ok()
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ControlFrame>,
    cancel: CancellationToken,
) -> mpsc::Receiver<ControlFrame> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = frame.write_to(&mut writer).await {
                        tracing::debug!(error = %e, "control bus write failed");
                        break;
                    }
                }
                None => break,
            }
        }
    }
    rx
}

fn handle_inbound(
    frame: ControlFrame,
    outbound_tx: &mpsc::Sender<ControlFrame>,
    pending: &PendingMap,
    requests_tx: &mpsc::Sender<InboundRequest>,
    messages_tx: &broadcast::Sender<Vec<Param>>,
) {
    match frame.kind {
        FrameKind::Message => {
            // Ignore error - means no receivers
            let _ = messages_tx.send(frame.params);
        }
        FrameKind::Request => {
            let (reply_tx, reply_rx) = oneshot::channel();
            let inbound = InboundRequest {
                params: frame.params,
                reply: reply_tx,
            };
            match requests_tx.try_send(inbound) {
                Ok(()) => {
                    let id = frame.id;
                    let outbound = outbound_tx.clone();
                    tokio::spawn(async move {
                        if let Ok(params) = reply_rx.await {
                            let _ = outbound.send(ControlFrame::response(id, params)).await;
                        }
                    });
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(id = frame.id, "request channel full, dropping control request");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(id = frame.id, "request channel closed (dispatcher gone)");
                }
            }
        }
        FrameKind::Response => {
            let waiter = pending.lock().remove(&frame.id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(frame.params);
                }
                None => {
                    tracing::debug!(id = frame.id, "response for unknown or timed-out request");
                }
            }
        }
    }
}

fn fail_pending(pending: &PendingMap) {
    let mut map = pending.lock();
    if !map.is_empty() {
        tracing::debug!(count = map.len(), "failing in-flight control requests");
    }
    // Dropping the senders wakes every waiter with a ConnectionLost error.
    map.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ack_params, ControlOp};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn wait_for_status(conn: &BusConnection, want: ConnectionStatus) {
        timeout(Duration::from_secs(5), async {
            loop {
                if conn.status() == want {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("transport never reached status {}", want));
    }

    #[tokio::test]
    async fn connects_and_reports_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            // Hold the stream open.
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let conn = BusConnection::connect("127.0.0.1".into(), addr.port());
        wait_for_status(&conn, ConnectionStatus::Connected).await;
        conn.disconnect();
        wait_for_status(&conn, ConnectionStatus::Disconnected).await;
    }

    #[tokio::test]
    async fn stays_disconnected_when_peer_absent() {
        // Grab a port and close it again so nothing is listening there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let conn = BusConnection::connect("127.0.0.1".into(), port);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_ne!(conn.status(), ConnectionStatus::Connected);
        conn.disconnect();
    }

    #[tokio::test]
    async fn send_request_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = ControlFrame::read_from(&mut stream).await.unwrap();
            assert_eq!(frame.kind, FrameKind::Request);
            ControlFrame::response(frame.id, ack_params())
                .write_to(&mut stream)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let conn = BusConnection::connect("127.0.0.1".into(), addr.port());
        wait_for_status(&conn, ConnectionStatus::Connected).await;

        let params = vec![
            Param::Int(ControlOp::ClientIsConnecting as i64),
            Param::Int(42),
        ];
        let response = timeout(Duration::from_secs(5), conn.send_request(params))
            .await
            .unwrap()
            .unwrap();
        assert!(crate::protocol::parse_ack(&response).is_ok());
        conn.disconnect();
    }

    #[tokio::test]
    async fn inbound_request_reaches_consumer_and_response_returns() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            ControlFrame::request(9, vec![Param::Int(11)])
                .write_to(&mut stream)
                .await
                .unwrap();
            let response = ControlFrame::read_from(&mut stream).await.unwrap();
            assert_eq!(response.kind, FrameKind::Response);
            assert_eq!(response.id, 9);
            response.params
        });

        let conn = BusConnection::connect("127.0.0.1".into(), addr.port());
        let mut requests = conn.take_requests();

        let inbound = timeout(Duration::from_secs(5), requests.recv())
            .await
            .unwrap()
            .expect("request should arrive");
        assert_eq!(inbound.params, vec![Param::Int(11)]);
        inbound.respond(ack_params());

        let peer_saw = timeout(Duration::from_secs(5), peer).await.unwrap().unwrap();
        assert!(crate::protocol::parse_ack(&peer_saw).is_ok());
        conn.disconnect();
    }

    #[tokio::test]
    async fn pending_request_fails_when_connection_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Read the request, then hang up without responding.
            let _ = ControlFrame::read_from(&mut stream).await;
        });

        let conn = BusConnection::connect("127.0.0.1".into(), addr.port());
        wait_for_status(&conn, ConnectionStatus::Connected).await;

        let result = timeout(
            Duration::from_secs(5),
            conn.send_request(vec![Param::Int(1)]),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionLost)));
        conn.disconnect();
    }

    #[tokio::test]
    async fn send_delivers_fire_and_forget_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            ControlFrame::read_from(&mut stream).await.unwrap()
        });

        let conn = BusConnection::connect("127.0.0.1".into(), addr.port());
        conn.send(vec![Param::Int(7)]).await.unwrap();

        let frame = timeout(Duration::from_secs(5), peer).await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Message);
        assert_eq!(frame.id, 0);
        assert_eq!(frame.params, vec![Param::Int(7)]);
        conn.disconnect();
    }

    #[tokio::test]
    async fn inbound_message_reaches_subscriber() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            ControlFrame::message(vec![Param::Text("hello".into())])
                .write_to(&mut stream)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let conn = BusConnection::connect("127.0.0.1".into(), addr.port());
        let mut messages = conn.messages();

        let params = timeout(Duration::from_secs(5), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(params, vec![Param::Text("hello".into())]);
        conn.disconnect();
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let conn = BusConnection::connect("127.0.0.1".into(), addr.port());
        conn.disconnect();
        conn.disconnect();
        wait_for_status(&conn, ConnectionStatus::Disconnected).await;
    }

    #[tokio::test]
    #[should_panic(expected = "take_requests() called more than once")]
    async fn take_requests_panics_on_second_call() {
        let conn = BusConnection::connect("127.0.0.1".into(), 1);
        let _rx1 = conn.take_requests();
        let _rx2 = conn.take_requests();
    }
}
