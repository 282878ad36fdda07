#![allow(dead_code)]

//! Shared helpers: a fake harness speaking real control frames over TCP,
//! and a scripted managed socket for observing lifecycle calls without
//! binding real listeners.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;

use sockbus::config::BusConfig;
use sockbus::controller::ListenerFactory;
use sockbus::listener::{
    ListenerError, ListenerEvent, ListenerStatus, ManagedSocket, TraceEvent, TraceSeverity,
};
use sockbus::protocol::{ack_params, ControlFrame, FrameKind, Param};

type Command = (Vec<Param>, oneshot::Sender<Vec<Param>>);

/// A stand-in for the harness side of the control bus: accepts node
/// connections, acknowledges registration requests, and lets tests push
/// control requests at the connected node.
pub struct FakeHarness {
    addr: SocketAddr,
    registrations_rx: mpsc::Receiver<Vec<Param>>,
    conn_rx: watch::Receiver<Option<mpsc::Sender<Command>>>,
}

impl FakeHarness {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (registrations_tx, registrations_rx) = mpsc::channel(16);
        let (conn_tx, conn_rx) = watch::channel(None);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let (cmd_tx, cmd_rx) = mpsc::channel(16);
                let _ = conn_tx.send(Some(cmd_tx));
                tokio::spawn(handle_node(stream, registrations_tx.clone(), cmd_rx));
            }
        });

        Self {
            addr,
            registrations_rx,
            conn_rx,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A node config pointing at this harness, with short bounds so tests
    /// stay fast.
    pub fn node_config(&self) -> BusConfig {
        BusConfig {
            harness_address: "127.0.0.1".into(),
            control_port: self.addr.port(),
            handshake_timeout_ms: 2000,
            poll_interval_ms: 20,
        }
    }

    /// Wait until a node has connected.
    pub async fn wait_for_node(&mut self) {
        let mut rx = self.conn_rx.clone();
        timeout(Duration::from_secs(5), async move {
            while rx.borrow_and_update().is_none() {
                rx.changed().await.expect("harness accept loop died");
            }
        })
        .await
        .expect("no node connected to the fake harness");
    }

    /// Receive the next request the node sent to the harness (registration).
    pub async fn await_registration(&mut self) -> Vec<Param> {
        timeout(Duration::from_secs(5), self.registrations_rx.recv())
            .await
            .expect("timed out waiting for registration")
            .expect("harness connection closed")
    }

    /// Assert that no further node → harness request arrives within `window`.
    pub async fn assert_no_registration(&mut self, window: Duration) {
        let extra = timeout(window, self.registrations_rx.recv()).await;
        assert!(extra.is_err(), "unexpected request: {:?}", extra);
    }

    /// Send a control request to the connected node and return its response.
    pub async fn send_request(&self, params: Vec<Param>) -> Vec<Param> {
        let sender = self
            .conn_rx
            .borrow()
            .clone()
            .expect("no node connected yet");
        let (tx, rx) = oneshot::channel();
        sender
            .send((params, tx))
            .await
            .expect("harness connection handler gone");
        timeout(Duration::from_secs(5), rx)
            .await
            .expect("timed out waiting for node response")
            .expect("node connection dropped mid-request")
    }
}

async fn handle_node(
    stream: TcpStream,
    registrations_tx: mpsc::Sender<Vec<Param>>,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    let (mut reader, mut writer) = stream.into_split();

    // Frames come in through a channel so the select below stays cancel-safe.
    let (frame_tx, mut frame_rx) = mpsc::channel(32);
    tokio::spawn(async move {
        while let Ok(frame) = ControlFrame::read_from(&mut reader).await {
            if frame_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut next_id: u64 = 1;
    let mut pending: HashMap<u64, oneshot::Sender<Vec<Param>>> = HashMap::new();

    loop {
        tokio::select! {
            frame = frame_rx.recv() => match frame {
                Some(frame) => match frame.kind {
                    FrameKind::Request => {
                        let _ = registrations_tx.send(frame.params.clone()).await;
                        if ControlFrame::response(frame.id, ack_params())
                            .write_to(&mut writer)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    FrameKind::Response => {
                        if let Some(tx) = pending.remove(&frame.id) {
                            let _ = tx.send(frame.params);
                        }
                    }
                    FrameKind::Message => {}
                },
                None => break,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some((params, reply)) => {
                    let id = next_id;
                    next_id += 1;
                    pending.insert(id, reply);
                    if ControlFrame::request(id, params)
                        .write_to(&mut writer)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

/// A scripted [`ManagedSocket`] recording lifecycle calls.
pub struct FakeSocket {
    port: u16,
    fail_start: bool,
    status: parking_lot::RwLock<ListenerStatus>,
    events: broadcast::Sender<ListenerEvent>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl FakeSocket {
    pub fn new(port: u16, fail_start: bool) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            port,
            fail_start,
            status: parking_lot::RwLock::new(ListenerStatus::Stopped),
            events,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    fn set_status(&self, status: ListenerStatus) {
        *self.status.write() = status;
        let _ = self.events.send(ListenerEvent::StatusChanged(status));
    }

    /// Emit an arbitrary event, as a listener would during its own shutdown.
    pub fn emit(&self, event: ListenerEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_trace(&self, message: &str) {
        self.emit(ListenerEvent::Trace(TraceEvent {
            severity: TraceSeverity::Info,
            message: message.to_string(),
        }));
    }
}

#[async_trait]
impl ManagedSocket for FakeSocket {
    async fn start(&self) -> Result<(), ListenerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(ListenerError::Bind {
                port: self.port,
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
            });
        }
        self.set_status(ListenerStatus::Starting);
        self.set_status(ListenerStatus::Started);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ListenerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.set_status(ListenerStatus::Stopping);
        self.set_status(ListenerStatus::Stopped);
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

/// Tracks every socket a [`ListenerFactory`] built, so tests can inspect
/// old instances after the controller has replaced them.
#[derive(Clone)]
pub struct FakeSocketRegistry {
    pub created: Arc<parking_lot::Mutex<Vec<Arc<FakeSocket>>>>,
    fail_start: bool,
}

impl FakeSocketRegistry {
    pub fn new() -> Self {
        Self {
            created: Arc::new(parking_lot::Mutex::new(Vec::new())),
            fail_start: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            created: Arc::new(parking_lot::Mutex::new(Vec::new())),
            fail_start: true,
        }
    }

    pub fn factory(&self) -> ListenerFactory {
        let created = self.created.clone();
        let fail_start = self.fail_start;
        Box::new(move |port| {
            let socket = Arc::new(FakeSocket::new(port, fail_start));
            created.lock().push(socket.clone());
            socket as Arc<dyn ManagedSocket>
        })
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn socket(&self, index: usize) -> Arc<FakeSocket> {
        self.created.lock()[index].clone()
    }
}
