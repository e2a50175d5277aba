//! Connecting role: a client of an external WebSocket server.
//!
//! Outgoing frames are written inline on the caller's task with a few
//! retries; incoming frames are read by a dedicated task. A lost connection
//! is re-established by a bounded reconnect loop shared by both paths; once
//! the bound is exceeded the transport marks itself `Failed` and stops.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{WebSocketStream, client_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnectingConfig;
use crate::error::{TransportError, is_connection_closed};
use crate::frame::Frame;
use crate::state::ConnectionState;
use crate::stats::{ConnectingCounters, TransportStats};
use crate::transport::{Transport, TransportCore, lock};

type WsStream = WebSocketStream<TcpStream>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Transport that dials `ws://<host>/<path>?simulation_id=..&read_index=..`.
pub struct ConnectingTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectingConfig,
    url: String,
    core: Arc<TransportCore>,
    link: Link,
}

/// The live socket halves and the bookkeeping around replacing them.
struct Link {
    sink: tokio::sync::Mutex<Option<WsSink>>,
    /// Read half waiting to be picked up by the read task, tagged with the
    /// generation it belongs to
    source: Mutex<Option<(u64, WsSource)>>,
    source_ready: Notify,
    /// Serializes reconnects between the read task and senders
    reconnect_lock: tokio::sync::Mutex<()>,
    /// Bumped each time a new socket is installed
    generation: AtomicU64,
    consecutive_failures: AtomicU32,
    counters: ConnectingCounters,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectingTransport {
    /// Build the transport. The endpoint URL is validated here; nothing is
    /// dialed until `start`.
    pub fn new(config: ConnectingConfig) -> Result<Self, TransportError> {
        let url = config.endpoint_url();
        url.as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(format!("{url}: {e}")))?;

        let core = Arc::new(TransportCore::new(&config.queue));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                url,
                core,
                link: Link {
                    sink: tokio::sync::Mutex::new(None),
                    source: Mutex::new(None),
                    source_ready: Notify::new(),
                    reconnect_lock: tokio::sync::Mutex::new(()),
                    generation: AtomicU64::new(0),
                    consecutive_failures: AtomicU32::new(0),
                    counters: ConnectingCounters::default(),
                    reader: Mutex::new(None),
                },
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.link.consecutive_failures.load(Ordering::SeqCst)
    }
}

impl Transport for ConnectingTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.inner.core.begin()?;
        self.inner.link.consecutive_failures.store(0, Ordering::SeqCst);
        info!(url = %self.inner.url, "connecting transport starting");
        self.inner.reconnect(None).await
    }

    async fn stop(&self) {
        let inner = &self.inner;
        let stopped = inner.core.halt().await;

        let sink = inner.link.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "error closing websocket");
            }
        }
        lock(&inner.link.source).take();

        let reader = lock(&inner.link.reader).take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                error!(error = %e, "read loop ended abnormally");
            }
        }

        if stopped {
            info!(url = %inner.url, "connecting transport stopped");
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.inner.send(frame).await;
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        let link = &self.inner.link;
        self.inner.core.snapshot(
            link.counters
                .snapshot(link.consecutive_failures.load(Ordering::SeqCst)),
        )
    }

    fn core(&self) -> &TransportCore {
        &self.inner.core
    }
}

impl Inner {
    /// Write a frame, retrying a bounded number of times. Never fails: a
    /// frame that cannot be delivered is logged and dropped.
    async fn send(self: &Arc<Self>, frame: Frame) {
        let bytes = frame.len();

        if self.core.state() != ConnectionState::Connected {
            if let Err(e) = self.reconnect(None).await {
                warn!(bytes, error = %e, "not connected, dropping frame");
                self.link.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let message = frame.into_message();
        let shutdown = self.core.shutdown_token();

        for attempt in 0..self.config.send_retries {
            if attempt > 0 {
                self.link.counters.retries.fetch_add(1, Ordering::Relaxed);
                debug!(attempt, "retrying send");
            }

            let (generation, result) = {
                let mut sink = self.link.sink.lock().await;
                let generation = self.link.generation.load(Ordering::SeqCst);
                let result = match sink.as_mut() {
                    Some(sink) => sink
                        .send(message.clone())
                        .await
                        .map_err(TransportError::from_tungstenite),
                    None => Err(TransportError::ConnectionClosed),
                };
                (generation, result)
            };

            match result {
                Ok(()) => {
                    self.link.counters.outgoing.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(TransportError::ConnectionClosed) => {
                    warn!(attempt, "connection closed while sending, reconnecting");
                    if let Err(e) = self.reconnect(Some(generation)).await {
                        debug!(error = %e, "reconnect from send path failed");
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "send failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
            }
        }

        let exhausted = TransportError::SendRetryExhausted {
            attempts: self.config.send_retries,
        };
        error!(bytes, error = %exhausted, "failed to send frame");
        self.link.counters.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Re-establish the connection.
    ///
    /// `seen` is the generation the caller found broken; if another task has
    /// already replaced it, this returns at once. `None` means "make sure
    /// there is a connection".
    async fn reconnect(self: &Arc<Self>, seen: Option<u64>) -> Result<(), TransportError> {
        let _guard = self.link.reconnect_lock.lock().await;

        let current = self.link.generation.load(Ordering::SeqCst);
        let already_replaced = match seen {
            Some(generation) => generation != current,
            None => self.link.sink.lock().await.is_some(),
        };
        if already_replaced {
            return Ok(());
        }

        // Drop the broken halves; the read task notices on its own.
        self.link.sink.lock().await.take();
        lock(&self.link.source).take();

        let shutdown = self.core.shutdown_token();
        let max_attempts = self.config.max_reconnect_attempts;

        loop {
            if !self.core.is_running() {
                return Err(TransportError::NotRunning);
            }

            let failures = self.link.consecutive_failures.load(Ordering::SeqCst);
            if failures >= max_attempts {
                error!(
                    url = %self.url,
                    attempts = failures,
                    "max reconnection attempts reached, stopping transport"
                );
                self.core.signal_stop(ConnectionState::Failed);
                return Err(TransportError::MaxReconnectExceeded { attempts: failures });
            }

            let attempt = failures + 1;
            self.link.consecutive_failures.store(attempt, Ordering::SeqCst);
            self.link
                .counters
                .reconnect_attempts
                .fetch_add(1, Ordering::Relaxed);
            if self.core.state() != ConnectionState::Starting {
                self.core.set_state(ConnectionState::Reconnecting);
            }
            info!(url = %self.url, attempt, max_attempts, "connecting");

            let dialed = tokio::select! {
                _ = shutdown.cancelled() => return Err(TransportError::NotRunning),
                dialed = self.dial() => dialed,
            };

            match dialed {
                Ok(ws) => {
                    self.install(ws).await;
                    self.link.consecutive_failures.store(0, Ordering::SeqCst);
                    self.ensure_reader();
                    self.core.set_state(ConnectionState::Connected);
                    self.core.ready().set();
                    info!(url = %self.url, "connected");
                    return Ok(());
                }
                Err(e) => {
                    error!(url = %self.url, attempt, error = %e, "connection attempt failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(TransportError::NotRunning),
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                    }
                }
            }
        }
    }

    /// Open a TCP socket with the configured buffer sizes and run the
    /// WebSocket client handshake over it.
    async fn dial(&self) -> Result<WsStream, TransportError> {
        let connect_io = |e: std::io::Error| TransportError::Connect(tungstenite::Error::Io(e));

        let request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(TransportError::Connect)?;
        let uri = request.uri();
        let host = uri
            .host()
            .ok_or_else(|| TransportError::InvalidUrl(self.url.clone()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(80);

        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(connect_io)?
            .next()
            .ok_or_else(|| {
                connect_io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address found for {host}"),
                ))
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(connect_io)?;
        if let Err(e) = socket.set_recv_buffer_size(self.config.recv_buffer_bytes) {
            warn!(error = %e, "failed to set socket receive buffer size");
        }
        if let Err(e) = socket.set_send_buffer_size(self.config.send_buffer_bytes) {
            warn!(error = %e, "failed to set socket send buffer size");
        }

        let stream = socket.connect(addr).await.map_err(connect_io)?;
        let (ws, _response) = client_async(request, stream)
            .await
            .map_err(TransportError::Connect)?;
        Ok(ws)
    }

    /// Make a freshly dialed socket the current one.
    async fn install(&self, ws: WsStream) {
        let (sink, source) = ws.split();
        let generation = {
            let mut slot = self.link.sink.lock().await;
            let generation = self.link.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *slot = Some(sink);
            generation
        };
        *lock(&self.link.source) = Some((generation, source));
        self.link.source_ready.notify_waiters();
        debug!(generation, "installed new connection");
    }

    /// Spawn the read task unless one is already alive.
    fn ensure_reader(self: &Arc<Self>) {
        let mut reader = lock(&self.link.reader);
        if reader.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let shutdown = self.core.shutdown_token();
        *reader = Some(tokio::spawn(read_loop(Arc::clone(self), shutdown)));
    }
}

/// How one socket's read phase ended.
enum ReadEnd {
    Shutdown,
    Replaced,
    Closed,
    Failed(tungstenite::Error),
}

async fn read_loop(inner: Arc<Inner>, shutdown: CancellationToken) {
    info!("starting connection read loop");

    while inner.core.is_running() {
        let notified = inner.link.source_ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let taken = lock(&inner.link.source).take();
        let Some((generation, mut source)) = taken else {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = &mut notified => continue,
            }
        };

        let end = read_socket(&inner, generation, &mut source, &shutdown).await;
        match end {
            ReadEnd::Shutdown => break,
            ReadEnd::Replaced => debug!(generation, "switching to newer connection"),
            ReadEnd::Closed => {
                warn!(generation, "connection closed by server");
                drop(source);
                if inner.reconnect(Some(generation)).await.is_err() {
                    break;
                }
            }
            ReadEnd::Failed(e) => {
                error!(generation, error = %e, "error reading from websocket");
                break;
            }
        }
    }

    info!("connection read loop stopped");
}

/// Read frames from one socket until it ends or a newer one is installed.
async fn read_socket(
    inner: &Inner,
    generation: u64,
    source: &mut WsSource,
    shutdown: &CancellationToken,
) -> ReadEnd {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return ReadEnd::Shutdown,
            next = tokio::time::timeout(inner.config.poll_timeout, source.next()) => next,
        };

        match next {
            Err(_) => {
                if inner.link.generation.load(Ordering::SeqCst) != generation {
                    return ReadEnd::Replaced;
                }
            }
            Ok(Some(Ok(msg))) => {
                let Some(frame) = Frame::from_message(msg) else {
                    continue;
                };
                if let Err(e) = inner.core.receive_message(frame) {
                    error!(error = %e, "incoming frame raised an overflow alarm");
                }
            }
            Ok(Some(Err(e))) if is_connection_closed(&e) => return ReadEnd::Closed,
            Ok(Some(Err(e))) => return ReadEnd::Failed(e),
            Ok(None) => return ReadEnd::Closed,
        }
    }
}
