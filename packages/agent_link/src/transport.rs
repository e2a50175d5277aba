//! The transport contract and the state every role shares.
//!
//! Both roles embed a [`TransportCore`]: the running flag, the lifecycle
//! state, the readiness latch, the incoming queue and the dispatch loop that
//! drains it into the registered handler. The roles add their own I/O tasks
//! on top and implement [`Transport`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{Direction, TransportError};
use crate::frame::Frame;
use crate::latch::ReadinessLatch;
use crate::queue::{BoundedQueue, PushOutcome};
use crate::state::ConnectionState;
use crate::stats::{CoreCounters, RoleStats, TransportStats};

/// Callback receiving every incoming frame, in order, on the dispatch task.
///
/// It must not block for long: the next frame is not dispatched until it
/// returns.
pub type MessageHandler = Arc<dyn Fn(Frame) + Send + Sync + 'static>;

/// Lifecycle contract implemented by both roles.
///
/// Delivery guarantees differ by role and callers must account for it:
/// the hosting role queues outgoing frames until a peer can take them and
/// reports an overflow alarm from `send`; the connecting role writes inline
/// and silently drops a frame once its retries are exhausted.
pub trait Transport: Send + Sync {
    /// Bring the transport up. Fails if it is already running.
    fn start(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Shut everything down and wait for background tasks. Safe to call
    /// repeatedly; later calls do nothing.
    fn stop(&self) -> impl Future<Output = ()> + Send;

    /// Hand a frame to the transport for delivery to the peer.
    fn send(&self, frame: Frame) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Snapshot of base and role-specific counters.
    fn stats(&self) -> TransportStats;

    fn core(&self) -> &TransportCore;

    /// Register the single consumer of incoming frames.
    ///
    /// Only the first registration takes effect; later ones are logged and
    /// ignored. Returns whether this handler was installed.
    fn set_message_handler<F>(&self, handler: F) -> bool
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        self.core().set_message_handler(handler)
    }

    /// Feed a frame into the incoming queue as if it had arrived on the socket.
    fn receive_message(&self, frame: Frame) -> Result<(), TransportError> {
        self.core().receive_message(frame)
    }

    /// Wait until the transport is ready to exchange frames. `None` waits
    /// without a deadline.
    fn wait_for_ready(&self, timeout: Option<Duration>) -> impl Future<Output = bool> + Send {
        info!("waiting for the transport to be ready");
        self.core().ready().wait(timeout)
    }

    fn is_running(&self) -> bool {
        self.core().is_running()
    }

    fn state(&self) -> ConnectionState {
        self.core().state()
    }

    /// Frames received but not yet handed to the handler, oldest first.
    fn pending_incoming(&self) -> Vec<Frame> {
        self.core().pending_incoming()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by both roles.
pub struct TransportCore {
    running: AtomicBool,
    state: watch::Sender<ConnectionState>,
    ready: ReadinessLatch,
    incoming: Mutex<BoundedQueue<Frame>>,
    incoming_ready: Notify,
    handler: OnceLock<MessageHandler>,
    shutdown: Mutex<CancellationToken>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    counters: CoreCounters,
}

impl TransportCore {
    pub fn new(queue: &QueueConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Stopped);
        Self {
            running: AtomicBool::new(false),
            state,
            ready: ReadinessLatch::new(),
            incoming: Mutex::new(BoundedQueue::new(queue.capacity, queue.alarm_stride)),
            incoming_ready: Notify::new(),
            handler: OnceLock::new(),
            shutdown: Mutex::new(CancellationToken::new()),
            dispatcher: Mutex::new(None),
            counters: CoreCounters::default(),
        }
    }

    /// The one accessor every worker polls to decide whether to keep going.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "transport state changed");
        }
    }

    /// Wait until the state satisfies `pred`, or `timeout` elapses.
    pub async fn wait_for_state<P>(&self, pred: P, timeout: Duration) -> bool
    where
        P: Fn(ConnectionState) -> bool,
    {
        let mut rx = self.state.subscribe();
        let reached = async move { rx.wait_for(|state| pred(*state)).await.is_ok() };
        tokio::time::timeout(timeout, reached).await.unwrap_or(false)
    }

    pub fn ready(&self) -> &ReadinessLatch {
        &self.ready
    }

    pub fn counters(&self) -> &CoreCounters {
        &self.counters
    }

    /// Token cancelled when the current run ends.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        lock(&self.shutdown).clone()
    }

    pub fn set_message_handler<F>(&self, handler: F) -> bool
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        if self.handler.set(Arc::new(handler)).is_err() {
            warn!("a message handler is already set, skipping");
            return false;
        }
        self.incoming_ready.notify_one();
        true
    }

    /// Enqueue a frame read from the socket.
    ///
    /// The frame is always enqueued (evicting the oldest one if the queue is
    /// full); an error means the push landed on an overflow checkpoint.
    pub fn receive_message(&self, frame: Frame) -> Result<(), TransportError> {
        self.counters.frame_received();
        let outcome = lock(&self.incoming).push(frame);
        self.incoming_ready.notify_one();
        self.check_push(Direction::Incoming, outcome)
    }

    /// Turn a push outcome into the caller-visible result.
    pub(crate) fn check_push(
        &self,
        direction: Direction,
        outcome: PushOutcome<Frame>,
    ) -> Result<(), TransportError> {
        match outcome {
            PushOutcome::Inserted => Ok(()),
            PushOutcome::InsertedWithEviction(evicted) => {
                self.counters.frame_evicted();
                debug!(
                    %direction,
                    bytes = evicted.len(),
                    "queue full, evicted oldest frame"
                );
                Ok(())
            }
            PushOutcome::InsertedAtAlarmThreshold { depth } => {
                if !self.is_running() {
                    return Ok(());
                }
                self.counters.overflow_alarm();
                warn!(%direction, depth, "queue is long, the consumer may be stuck");
                Err(TransportError::QueueOverflow { direction, depth })
            }
        }
    }

    pub fn pending_incoming(&self) -> Vec<Frame> {
        lock(&self.incoming).snapshot()
    }

    pub fn pending_incoming_len(&self) -> usize {
        lock(&self.incoming).len()
    }

    fn pop_incoming(&self) -> Option<Frame> {
        lock(&self.incoming).pop()
    }

    /// Mark the transport running and spawn the dispatch loop.
    ///
    /// Returns the cancellation token for this run.
    pub(crate) fn begin(self: &Arc<Self>) -> Result<CancellationToken, TransportError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        *lock(&self.shutdown) = token.clone();
        self.set_state(ConnectionState::Starting);

        let core = Arc::clone(self);
        let handle = tokio::spawn(core.dispatch_loop(token.clone()));
        *lock(&self.dispatcher) = Some(handle);
        Ok(token)
    }

    /// Signal every worker to stop without waiting for any of them.
    ///
    /// Safe to call from inside a worker (this is how a transport stops
    /// itself). `Failed` is sticky: a later plain stop does not erase it.
    pub(crate) fn signal_stop(&self, final_state: ConnectionState) {
        self.running.store(false, Ordering::SeqCst);
        lock(&self.shutdown).cancel();
        if self.state() != ConnectionState::Failed {
            self.set_state(final_state);
        }
    }

    /// Stop the run and join the dispatch loop.
    ///
    /// Returns `false` if there was nothing left to stop.
    pub(crate) async fn halt(&self) -> bool {
        let was_running = self.is_running();
        self.signal_stop(ConnectionState::Stopped);

        let dispatcher = lock(&self.dispatcher).take();
        let Some(dispatcher) = dispatcher else {
            return was_running;
        };
        if let Err(e) = dispatcher.await {
            error!(error = %e, "dispatch loop ended abnormally");
        }
        true
    }

    /// Merge base counters with a role-specific section.
    pub fn snapshot(&self, role: RoleStats) -> TransportStats {
        TransportStats {
            running: self.is_running(),
            state: self.state(),
            incoming: self.counters.received.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            pending_incoming: self.pending_incoming_len(),
            overflow_alarms: self.counters.overflow_alarms.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            role,
        }
    }

    async fn dispatch_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!("starting incoming frame dispatch loop");
        while self.is_running() {
            let next = self
                .handler
                .get()
                .and_then(|handler| self.pop_incoming().map(|frame| (handler, frame)));

            match next {
                Some((handler, frame)) => {
                    handler(frame);
                    self.counters.frame_dispatched();
                    tokio::task::yield_now().await;
                }
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = self.incoming_ready.notified() => {}
                    }
                }
            }
        }
        info!("incoming frame dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn small_core(capacity: usize, alarm_stride: usize) -> Arc<TransportCore> {
        Arc::new(TransportCore::new(&QueueConfig {
            capacity,
            alarm_stride,
        }))
    }

    #[tokio::test]
    async fn dispatches_in_receipt_order() {
        let core = small_core(100, 10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        core.set_message_handler(move |frame| {
            let _ = tx.send(frame);
        });
        core.begin().unwrap();

        for i in 0..20 {
            core.receive_message(Frame::Text(i.to_string())).unwrap();
        }
        for i in 0..20 {
            let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame, Frame::Text(i.to_string()));
        }

        core.halt().await;
        let stats = core.snapshot(crate::stats::HostingCounters::default().snapshot(0, false));
        assert_eq!(stats.incoming, 20);
        assert_eq!(stats.dispatched, 20);
        assert_eq!(stats.pending_incoming, 0);
    }

    #[tokio::test]
    async fn frames_wait_for_late_handler() {
        let core = small_core(10, 10);
        core.begin().unwrap();
        core.receive_message(Frame::from("early")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(core.pending_incoming(), vec![Frame::from("early")]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        core.set_message_handler(move |frame| {
            let _ = tx.send(frame);
        });
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::from("early"));
        core.halt().await;
    }

    #[tokio::test]
    async fn second_handler_is_ignored() {
        let core = small_core(10, 10);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        assert!(core.set_message_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = second.clone();
        assert!(!core.set_message_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        core.begin().unwrap();
        core.receive_message(Frame::from("x")).unwrap();
        for _ in 0..100 {
            if first.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        core.halt().await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn overflow_alarm_only_while_running() {
        let core = small_core(5, 5);
        for i in 0..5 {
            core.receive_message(Frame::Text(i.to_string())).unwrap();
        }
        assert_eq!(core.counters().overflow_alarms.load(Ordering::Relaxed), 0);

        let core = small_core(5, 5);
        core.begin().unwrap();
        for i in 1..=4 {
            core.receive_message(Frame::Text(i.to_string())).unwrap();
        }
        let err = core.receive_message(Frame::from("5")).unwrap_err();
        assert!(matches!(
            err,
            TransportError::QueueOverflow {
                direction: Direction::Incoming,
                depth: 5
            }
        ));
        for i in 6..=10 {
            core.receive_message(Frame::Text(i.to_string())).unwrap();
        }

        let pending: Vec<_> = core
            .pending_incoming()
            .into_iter()
            .map(|f| f.as_text().unwrap_or_default().to_string())
            .collect();
        assert_eq!(pending, vec!["6", "7", "8", "9", "10"]);
        assert_eq!(core.counters().evicted.load(Ordering::Relaxed), 5);
        assert_eq!(core.counters().overflow_alarms.load(Ordering::Relaxed), 1);
        core.halt().await;
    }

    #[tokio::test]
    async fn wait_for_state_observes_transitions() {
        let core = small_core(10, 10);
        assert!(!core.wait_for_state(|s| s == ConnectionState::Starting, Duration::from_millis(10)).await);
        core.begin().unwrap();
        assert!(core.wait_for_state(|s| s == ConnectionState::Starting, Duration::from_millis(10)).await);
        core.halt().await;
    }

    #[tokio::test]
    async fn begin_twice_is_rejected() {
        let core = small_core(10, 10);
        core.begin().unwrap();
        assert!(matches!(core.begin(), Err(TransportError::AlreadyRunning)));
        assert_eq!(core.state(), ConnectionState::Starting);
        core.halt().await;
    }

    #[tokio::test]
    async fn halt_is_idempotent() {
        let core = small_core(10, 10);
        core.begin().unwrap();
        assert!(core.halt().await);
        assert!(!core.halt().await);
        assert!(!core.is_running());
        assert_eq!(core.state(), ConnectionState::Stopped);
        assert!(core.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn failed_state_survives_stop() {
        let core = small_core(10, 10);
        core.begin().unwrap();
        core.signal_stop(ConnectionState::Failed);
        assert!(!core.is_running());
        core.halt().await;
        assert_eq!(core.state(), ConnectionState::Failed);
    }
}
