//! Hosting role: listen for a peer and serve it.
//!
//! The transport binds a WebSocket listener and treats the most recently
//! accepted connection as "the peer". Outgoing frames sit in a bounded queue
//! until a peer is attached; each connection runs a drain loop (queue →
//! socket, plus keepalive pings) and a read loop (socket → incoming queue).
//! A newly accepted peer replaces the previous one without closing it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HostingConfig;
use crate::error::{Direction, TransportError, is_connection_closed};
use crate::frame::Frame;
use crate::queue::BoundedQueue;
use crate::state::ConnectionState;
use crate::stats::{HostingCounters, TransportStats};
use crate::transport::{Transport, TransportCore, lock};

type PeerSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type PeerStream = SplitStream<WebSocketStream<TcpStream>>;

/// Depth above which every `send` reports the outgoing queue size.
const OUTGOING_LOG_DEPTH: usize = 5;

/// No peer attached.
const NO_PEER: u64 = 0;

/// Transport that listens on `ws://<host>:<port>` and serves one peer.
pub struct HostingTransport {
    config: HostingConfig,
    core: Arc<TransportCore>,
    shared: Arc<HostingShared>,
    server: Mutex<Option<Server>>,
}

/// Listener task of the current run.
struct Server {
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// State the accept and per-connection tasks share with the transport.
struct HostingShared {
    outgoing: Mutex<BoundedQueue<Frame>>,
    /// Woken on every `send` and on peer changes
    outgoing_ready: Notify,
    active_peer: AtomicU64,
    next_peer_id: AtomicU64,
    counters: HostingCounters,
    ping_interval: Duration,
    ping_timeout: Duration,
}

impl HostingShared {
    fn attach_peer(&self) -> u64 {
        let id = self.next_peer_id.fetch_add(1, Ordering::SeqCst);
        let previous = self.active_peer.swap(id, Ordering::SeqCst);
        if previous != NO_PEER {
            info!(previous, peer = id, "new peer replaces the attached one");
        }
        self.counters.peers_accepted.fetch_add(1, Ordering::Relaxed);
        self.outgoing_ready.notify_waiters();
        id
    }

    fn detach_peer(&self, id: u64) {
        let _ = self
            .active_peer
            .compare_exchange(id, NO_PEER, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn is_attached(&self, id: u64) -> bool {
        self.active_peer.load(Ordering::SeqCst) == id
    }

    fn has_peer(&self) -> bool {
        self.active_peer.load(Ordering::SeqCst) != NO_PEER
    }

    fn pop_outgoing(&self) -> Option<Frame> {
        lock(&self.outgoing).pop()
    }

    fn pending_outgoing(&self) -> usize {
        lock(&self.outgoing).len()
    }
}

impl HostingTransport {
    pub fn new(config: HostingConfig) -> Self {
        let core = Arc::new(TransportCore::new(&config.queue));
        let shared = Arc::new(HostingShared {
            outgoing: Mutex::new(BoundedQueue::new(
                config.queue.capacity,
                config.queue.alarm_stride,
            )),
            outgoing_ready: Notify::new(),
            active_peer: AtomicU64::new(NO_PEER),
            next_peer_id: AtomicU64::new(1),
            counters: HostingCounters::default(),
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
        });
        Self {
            config,
            core,
            shared,
            server: Mutex::new(None),
        }
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.server).as_ref().map(|server| server.local_addr)
    }

    /// `ws://` URL peers should dial, once started.
    pub fn url(&self) -> Option<String> {
        self.local_addr().map(|addr| format!("ws://{addr}"))
    }

    pub fn peer_attached(&self) -> bool {
        self.shared.has_peer()
    }

    /// Frames waiting for a peer, oldest first.
    pub fn pending_outgoing(&self) -> Vec<Frame> {
        lock(&self.shared.outgoing).snapshot()
    }

    /// Queue a frame for the peer without waiting.
    ///
    /// The frame is kept even when an overflow alarm is returned.
    pub fn enqueue(&self, frame: Frame) -> Result<(), TransportError> {
        debug!(bytes = frame.len(), "queueing outgoing frame");
        self.shared.counters.outgoing.fetch_add(1, Ordering::Relaxed);

        let (outcome, depth) = {
            let mut queue = lock(&self.shared.outgoing);
            let outcome = queue.push(frame);
            (outcome, queue.len())
        };
        self.shared.outgoing_ready.notify_waiters();

        if depth > OUTGOING_LOG_DEPTH {
            info!(depth, "outgoing queue size");
        }
        self.core.check_push(Direction::Outgoing, outcome)
    }
}

impl Transport for HostingTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let shutdown = self.core.begin()?;

        let bind_addr = format!("{}:{}", self.config.host, self.config.port);
        let bound = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind websocket listener");
                self.core.halt().await;
                return Err(TransportError::Bind(e));
            }
        };

        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.core.clone(),
            self.shared.clone(),
            shutdown,
        ));
        *lock(&self.server) = Some(Server {
            accept_task,
            local_addr,
        });

        info!("websocket server started at ws://{}", local_addr);
        self.core.set_state(ConnectionState::Connected);
        self.core.ready().set();
        info!("server is ready to accept frames");
        Ok(())
    }

    async fn stop(&self) {
        if self.core.is_running() {
            info!("stopping hosting transport");
        }
        self.core.halt().await;

        let server = lock(&self.server).take();
        if let Some(server) = server {
            if let Err(e) = server.accept_task.await {
                error!(error = %e, "accept loop ended abnormally");
            }
            info!(addr = %server.local_addr, "websocket server closed");
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.enqueue(frame)
    }

    fn stats(&self) -> TransportStats {
        self.core.snapshot(
            self.shared
                .counters
                .snapshot(self.shared.pending_outgoing(), self.shared.has_peer()),
        )
    }

    fn core(&self) -> &TransportCore {
        &self.core
    }
}

async fn accept_loop(
    listener: TcpListener,
    core: Arc<TransportCore>,
    shared: Arc<HostingShared>,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    connections.spawn(serve_peer(
                        stream,
                        peer_addr,
                        core.clone(),
                        shared.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => warn!(error = %e, "failed to accept connection"),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "connection task ended abnormally");
                }
            }
        }
    }

    // Every connection task watches the same token, so this drains quickly.
    while connections.join_next().await.is_some() {}
    drop(listener);
}

async fn serve_peer(
    stream: TcpStream,
    peer_addr: SocketAddr,
    core: Arc<TransportCore>,
    shared: Arc<HostingShared>,
    conn: CancellationToken,
) {
    let ws = tokio::select! {
        _ = conn.cancelled() => return,
        ws = accept_async(stream) => match ws {
            Ok(ws) => ws,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "websocket handshake failed");
                return;
            }
        },
    };

    let peer_id = shared.attach_peer();
    info!(peer = %peer_addr, "client connected");

    let (sink, stream) = ws.split();
    let last_inbound = Mutex::new(Instant::now());

    tokio::join!(
        drain_outgoing(sink, &shared, peer_id, &last_inbound, &conn),
        read_incoming(stream, &core, &last_inbound, &conn),
    );

    shared.detach_peer(peer_id);
    info!(peer = %peer_addr, "client disconnected");
}

/// Write queued frames to the peer while it is the attached one, and keep the
/// connection alive with pings.
async fn drain_outgoing(
    mut sink: PeerSink,
    shared: &HostingShared,
    peer_id: u64,
    last_inbound: &Mutex<Instant>,
    conn: &CancellationToken,
) {
    // A zero interval turns keepalive off.
    let keepalive = !shared.ping_interval.is_zero();
    let period = if keepalive {
        shared.ping_interval
    } else {
        Duration::from_secs(3600)
    };
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    let mut ping_sent_at: Option<Instant> = None;

    loop {
        if conn.is_cancelled() {
            break;
        }

        // Register interest before looking at the queue so a send that lands
        // in between still wakes us.
        let notified = shared.outgoing_ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if shared.is_attached(peer_id) {
            if let Some(frame) = shared.pop_outgoing() {
                let started = Instant::now();
                if let Err(e) = sink.send(frame.into_message()).await {
                    if is_connection_closed(&e) {
                        debug!("peer closed while sending");
                    } else {
                        warn!(error = %e, "failed to send frame to peer");
                    }
                    break;
                }
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "sent frame");
                shared
                    .counters
                    .processed_outgoing
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }

        let pong_deadline = ping_sent_at.map(|sent| sent + shared.ping_timeout);
        tokio::select! {
            _ = conn.cancelled() => break,
            _ = &mut notified => {}
            _ = ping.tick(), if keepalive => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                if ping_sent_at.is_none() {
                    ping_sent_at = Some(Instant::now());
                }
            }
            _ = sleep_until_opt(pong_deadline), if pong_deadline.is_some() => {
                let sent = ping_sent_at.take().unwrap_or_else(Instant::now);
                if *lock(last_inbound) < sent {
                    warn!("peer did not answer keepalive ping, closing connection");
                    break;
                }
            }
        }
    }

    conn.cancel();
    let _ = sink.close().await;
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Forward every data frame from the peer into the incoming queue.
async fn read_incoming(
    mut stream: PeerStream,
    core: &TransportCore,
    last_inbound: &Mutex<Instant>,
    conn: &CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = conn.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(msg)) => {
                *lock(last_inbound) = Instant::now();
                let Some(frame) = Frame::from_message(msg) else {
                    continue;
                };
                if let Err(e) = core.receive_message(frame) {
                    error!(error = %e, "incoming frame raised an overflow alarm");
                }
            }
            Some(Err(e)) => {
                if is_connection_closed(&e) {
                    debug!("peer connection closed");
                } else {
                    warn!(error = %e, "error reading from peer");
                }
                break;
            }
            None => break,
        }
    }

    conn.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;

    fn test_config() -> HostingConfig {
        HostingConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            queue: QueueConfig {
                capacity: 5,
                alarm_stride: 5,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn send_without_peer_keeps_frames() {
        let transport = HostingTransport::new(test_config());
        transport.start().await.unwrap();

        transport.send(Frame::from("a")).await.unwrap();
        transport.send(Frame::from("b")).await.unwrap();

        assert_eq!(
            transport.pending_outgoing(),
            vec![Frame::from("a"), Frame::from("b")]
        );
        let stats = transport.stats();
        assert_eq!(stats.outgoing(), 2);
        assert!(!transport.peer_attached());
        transport.stop().await;
    }

    #[tokio::test]
    async fn outgoing_overflow_alarm_reaches_sender() {
        let transport = HostingTransport::new(test_config());
        transport.start().await.unwrap();

        for i in 1..=4 {
            transport.send(Frame::Text(i.to_string())).await.unwrap();
        }
        let err = transport.send(Frame::from("5")).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::QueueOverflow {
                direction: Direction::Outgoing,
                depth: 5
            }
        ));
        // evicting pushes stay silent
        for i in 6..=10 {
            transport.send(Frame::Text(i.to_string())).await.unwrap();
        }
        assert_eq!(transport.pending_outgoing().len(), 5);
        assert_eq!(transport.pending_outgoing()[0], Frame::from("6"));
        transport.stop().await;
    }

    #[tokio::test]
    async fn start_sets_ready_and_url() {
        let transport = HostingTransport::new(test_config());
        assert!(transport.url().is_none());
        transport.start().await.unwrap();

        assert!(transport.wait_for_ready(Some(Duration::from_secs(1))).await);
        assert_eq!(transport.state(), ConnectionState::Connected);
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(transport.url().unwrap(), format!("ws://{addr}"));
        transport.stop().await;
    }

    #[tokio::test]
    async fn bind_failure_leaves_transport_stopped() {
        let first = HostingTransport::new(test_config());
        first.start().await.unwrap();
        let taken = first.local_addr().unwrap();

        let second = HostingTransport::new(HostingConfig {
            port: taken.port(),
            ..test_config()
        });
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, TransportError::Bind(_)));
        assert!(!second.is_running());
        assert_eq!(second.state(), ConnectionState::Stopped);

        first.stop().await;
    }

    #[tokio::test]
    async fn zero_ping_interval_disables_keepalive() {
        let transport = HostingTransport::new(HostingConfig {
            ping_interval: Duration::ZERO,
            ..test_config()
        });
        transport.start().await.unwrap();
        transport.send(Frame::from("queued")).await.unwrap();

        let url = transport.url().unwrap();
        let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(Frame::from_message(msg), Some(Frame::from("queued")));
        assert!(transport.peer_attached());

        // No pings arrive and the connection stays up.
        assert!(
            tokio::time::timeout(Duration::from_millis(100), client.next())
                .await
                .is_err()
        );
        assert!(transport.peer_attached());
        transport.stop().await;
    }

    #[tokio::test]
    async fn stop_twice_is_quiet() {
        let transport = HostingTransport::new(test_config());
        transport.start().await.unwrap();
        transport.stop().await;
        transport.stop().await;
        assert!(!transport.is_running());
        assert!(transport.local_addr().is_none());
        assert_eq!(transport.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let transport = HostingTransport::new(test_config());
        transport.start().await.unwrap();
        transport.stop().await;
        transport.start().await.unwrap();
        assert!(transport.is_running());
        assert!(matches!(
            transport.start().await,
            Err(TransportError::AlreadyRunning)
        ));
        transport.stop().await;
    }
}
