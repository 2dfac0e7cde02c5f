// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! TCP streaming session.
//!
//! One session owns one socket. Outbound frames go through a latest-wins
//! [`FrameQueue`] drained by a sender task; inbound bytes are read one at a
//! time by a receiver task and handed to the current [`InboundValues`]
//! consumer, if any.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::queue::{FrameQueue, Outbound, Push};
use crate::codec;
use crate::error::{ConnectError, ErrorDescriptor, IoOp, TransportIoError};
use crate::state::{StateStore, StreamingSessionState, Versioned};

/// Buffered inbound values per consumer.
const INBOUND_CAPACITY: usize = 64;

/// Result of a successful [`StreamingSession::connect`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new connection was opened and its loops started.
    Connected,
    /// A session was already active; nothing was done.
    AlreadyConnected,
}

/// Handle to the streaming session. Cheap to clone.
#[derive(Clone)]
pub struct StreamingSession {
    inner: Arc<Inner>,
}

struct Inner {
    state: StateStore<StreamingSessionState>,
    active: tokio::sync::Mutex<Option<ActiveLink>>,
    outbound: parking_lot::Mutex<Option<Arc<FrameQueue>>>,
    inbound: parking_lot::Mutex<Option<Arc<InboundHub>>>,
    generation: AtomicU64,
}

/// Resources of one open connection.
struct ActiveLink {
    generation: u64,
    queue: Arc<FrameQueue>,
    shutdown: Arc<Notify>,
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

impl Default for StreamingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingSession {
    /// Create a disconnected session.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: StateStore::new(StreamingSessionState::default()),
                active: tokio::sync::Mutex::new(None),
                outbound: parking_lot::Mutex::new(None),
                inbound: parking_lot::Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> Versioned<StreamingSessionState> {
        self.inner.state.snapshot()
    }

    /// Observe state changes.
    pub fn watch(&self) -> watch::Receiver<Versioned<StreamingSessionState>> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.snapshot().connected
    }

    /// Open the connection and start the sender and receiver loops.
    pub async fn connect(
        &self,
        host: &str,
        port: &str,
        timeout: Duration,
    ) -> Result<ConnectOutcome, ConnectError> {
        let mut active = self.inner.active.lock().await;
        if active.is_some() {
            info!("Stream already connected, ignoring connect request");
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        self.inner.state.update(|s| s.last_error = None);
        info!("Connecting stream to {}:{}", host, port);

        let stream = match open(host, port, timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Stream connect failed: {}", e);
                let desc = ErrorDescriptor::from(&e);
                self.inner.state.update(|s| {
                    s.connected = false;
                    s.last_error = Some(desc);
                });
                return Err(e);
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (reader, writer) = stream.into_split();
        let queue = Arc::new(FrameQueue::new());
        let hub = Arc::new(InboundHub::new());
        let shutdown = Arc::new(Notify::new());

        let sender = tokio::spawn(sender_loop(
            self.inner.clone(),
            generation,
            queue.clone(),
            writer,
        ));
        let receiver = tokio::spawn(receiver_loop(
            self.inner.clone(),
            generation,
            hub.clone(),
            shutdown.clone(),
            reader,
        ));

        *self.inner.outbound.lock() = Some(queue.clone());
        *self.inner.inbound.lock() = Some(hub);
        *active = Some(ActiveLink {
            generation,
            queue,
            shutdown,
            sender,
            receiver,
        });
        self.inner.state.update(|s| s.connected = true);

        info!("Stream connected (session {})", generation);
        Ok(ConnectOutcome::Connected)
    }

    /// Enqueue bytes for sending. Never blocks.
    ///
    /// Dropped silently when no session is active. Only the newest pending
    /// payload is kept; see [`FrameQueue`].
    pub fn send(&self, payload: Vec<u8>) {
        if payload.is_empty() {
            return;
        }
        let queue = self.inner.outbound.lock().clone();
        match queue {
            Some(queue) => match queue.push(payload) {
                Push::Queued => {}
                Push::Superseded => {
                    trace!("Pending frame superseded");
                    self.inner.state.update(|s| s.frames_superseded += 1);
                }
                Push::Rejected => trace!("Session stopping, payload dropped"),
            },
            None => trace!("No active session, payload dropped"),
        }
    }

    /// Encode a camera frame and enqueue it.
    pub fn send_frame(&self, width: u32, height: u32, payload: &[u8]) {
        match codec::encode(width, height, payload) {
            Ok(message) => self.send(message),
            Err(e) => warn!("Frame dropped: {}", e),
        }
    }

    /// Register as the consumer of inbound bytes for the current connection.
    ///
    /// Replaces any previous consumer. Returns `None` when not connected.
    /// The sequence ends when the connection closes.
    pub fn inbound_values(&self) -> Option<InboundValues> {
        let hub = self.inner.inbound.lock().clone()?;
        hub.register()
    }

    /// Stop both loops, release the socket, and mark the session disconnected.
    ///
    /// Safe to call repeatedly or without ever connecting.
    pub async fn close(&self) {
        self.inner.close_generation(None).await;
    }
}

impl Inner {
    /// Tear down the active connection. With `only` set, do nothing unless the
    /// active connection is that generation.
    async fn close_generation(&self, only: Option<u64>) {
        let mut active = self.active.lock().await;
        let link = match active.take() {
            Some(link) if only.map_or(true, |g| g == link.generation) => link,
            other => {
                *active = other;
                if only.is_none() && self.state.snapshot().connected {
                    self.state.update(|s| s.connected = false);
                }
                return;
            }
        };

        info!("Closing stream session {}", link.generation);
        *self.outbound.lock() = None;
        *self.inbound.lock() = None;

        link.queue.stop();
        if let Err(e) = link.sender.await {
            warn!("Sender task ended abnormally: {}", e);
        }
        link.shutdown.notify_one();
        if let Err(e) = link.receiver.await {
            warn!("Receiver task ended abnormally: {}", e);
        }

        self.state.update(|s| s.connected = false);
        info!("Stream session {} closed", link.generation);
    }

    /// Record a loop failure and schedule teardown of that connection.
    fn fail(self: &Arc<Self>, generation: u64, err: &TransportIoError) {
        let desc = ErrorDescriptor::from(err);
        self.state.update(|s| s.last_error = Some(desc));
        self.request_close(generation);
    }

    /// Loops cannot join themselves, so teardown runs on its own task.
    fn request_close(self: &Arc<Self>, generation: u64) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.close_generation(Some(generation)).await;
        });
    }
}

async fn open(host: &str, port: &str, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ConnectError::InvalidAddress("empty host".to_string()));
    }
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|_| ConnectError::InvalidAddress(format!("invalid port '{}'", port)))?;

    let attempt = async {
        let addr = lookup_host((host, port))
            .await
            .map_err(|e| ConnectError::InvalidAddress(format!("{}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| ConnectError::InvalidAddress(format!("{}:{} did not resolve", host, port)))?;
        TcpStream::connect(addr)
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| ConnectError::Timeout(timeout))?
}

async fn sender_loop(
    inner: Arc<Inner>,
    generation: u64,
    queue: Arc<FrameQueue>,
    mut writer: OwnedWriteHalf,
) {
    debug!("Sender loop started (session {})", generation);

    loop {
        let frame = match queue.pop().await {
            Outbound::Frame(frame) => frame,
            Outbound::Stop => break,
        };

        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                trace!("Sent {} bytes", frame.len());
                inner.state.update(|s| s.frames_sent += 1);
            }
            Err(source) => {
                let err = TransportIoError {
                    op: IoOp::Write,
                    source,
                };
                error!("{}", err);
                inner.fail(generation, &err);
                break;
            }
        }
    }

    debug!("Sender loop stopped (session {})", generation);
}

async fn receiver_loop(
    inner: Arc<Inner>,
    generation: u64,
    hub: Arc<InboundHub>,
    shutdown: Arc<Notify>,
    reader: OwnedReadHalf,
) {
    debug!("Receiver loop started (session {})", generation);
    let mut reader = BufReader::new(reader);

    loop {
        let read = tokio::select! {
            _ = shutdown.notified() => break,
            read = reader.read_u8() => read,
        };

        match read {
            Ok(value) => {
                debug!("Received value {}", value);
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = hub.deliver(value) => {}
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("Stream closed by remote");
                inner.request_close(generation);
                break;
            }
            Err(source) => {
                let err = TransportIoError {
                    op: IoOp::Read,
                    source,
                };
                error!("{}", err);
                inner.fail(generation, &err);
                break;
            }
        }
    }

    hub.close();
    debug!("Receiver loop stopped (session {})", generation);
}

/// Fan-in point between the receiver loop and its single consumer.
struct InboundHub {
    consumer: parking_lot::Mutex<Option<mpsc::Sender<u8>>>,
    closed: AtomicBool,
}

impl InboundHub {
    fn new() -> Self {
        Self {
            consumer: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn register(&self) -> Option<InboundValues> {
        let mut consumer = self.consumer.lock();
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        *consumer = Some(tx);
        Some(InboundValues { rx })
    }

    async fn deliver(&self, value: u8) {
        let tx = self.consumer.lock().clone();
        match tx {
            Some(tx) => {
                if tx.send(value).await.is_err() {
                    trace!("Inbound consumer gone, value {} dropped", value);
                }
            }
            None => trace!("No inbound consumer, value {} dropped", value),
        }
    }

    fn close(&self) {
        let mut consumer = self.consumer.lock();
        self.closed.store(true, Ordering::SeqCst);
        *consumer = None;
    }
}

/// Inbound bytes of one connection, in arrival order.
#[derive(Debug)]
pub struct InboundValues {
    rx: mpsc::Receiver<u8>,
}

impl InboundValues {
    /// Next value, or `None` once the connection has closed.
    pub async fn next_value(&mut self) -> Option<u8> {
        self.rx.recv().await
    }

    /// A value that has already arrived, without waiting.
    pub fn try_next_value(&mut self) -> Option<u8> {
        self.rx.try_recv().ok()
    }
}

impl Stream for InboundValues {
    type Item = u8;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<u8>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(2);

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        (listener, port)
    }

    #[tokio::test]
    async fn test_close_without_connect() {
        let session = StreamingSession::new();
        session.close().await;
        session.close().await;
        let state = session.state();
        assert!(!state.connected);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_invalid_port() {
        let session = StreamingSession::new();
        let err = session
            .connect("127.0.0.1", "not-a-port", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::InvalidAddress(_)));

        let state = session.state();
        assert!(!state.connected);
        assert_eq!(
            state.last_error.as_ref().map(|e| e.kind),
            Some(ErrorKind::InvalidAddress)
        );
    }

    #[tokio::test]
    async fn test_empty_host() {
        let session = StreamingSession::new();
        let err = session.connect("  ", "80", TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ConnectError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let (listener, port) = listener().await;
            drop(listener);
            port
        };

        let session = StreamingSession::new();
        let err = session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ConnectError::Transport(_)));
        assert!(!session.is_connected());
        assert_eq!(
            session.state().last_error.as_ref().map(|e| e.kind),
            Some(ErrorKind::Transport)
        );
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let (listener, port) = listener().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let session = StreamingSession::new();
        assert_eq!(
            session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap(),
            ConnectOutcome::Connected
        );
        let _peer = accept.await.unwrap();

        assert_eq!(
            session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap(),
            ConnectOutcome::AlreadyConnected
        );
        assert!(session.is_connected());

        session.close().await;
        session.close().await;
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let session = StreamingSession::new();
        session.send(vec![1, 2, 3]);
        assert_eq!(session.state().frames_sent, 0);
        assert!(session.inbound_values().is_none());
    }

    #[tokio::test]
    async fn test_peer_eof_disconnects_without_error() {
        let (listener, port) = listener().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let session = StreamingSession::new();
        session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap();
        let mut values = session.inbound_values().unwrap();

        let (peer, _) = accept.await.unwrap();
        drop(peer);

        let end = tokio::time::timeout(TIMEOUT, values.next_value()).await.unwrap();
        assert_eq!(end, None);

        let mut rx = session.watch();
        tokio::time::timeout(TIMEOUT, rx.wait_for(|s| !s.connected))
            .await
            .unwrap()
            .unwrap();
        assert!(session.state().last_error.is_none());
    }
}
