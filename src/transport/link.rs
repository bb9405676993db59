use super::{Connection, Connector, Inbound, LinkStatus, Outbound, Transport};
use crate::error::QueueError;
use crate::network::NetworkReadiness;
use crate::sync::{BoundedQueue, Condition, DEFAULT_QUEUE_CAPACITY, Mutex, MutexGuard};
use crate::thread::ManagedThread;
use crate::utils::CancelToken;
use crate::{error_throttled, warn_throttled};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const STATUS_POLL: Duration = Duration::from_millis(500);
const INBOUND_PUT_POLL: Duration = Duration::from_millis(200);
const LOG_EVERY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Pause between failed reconnect attempts.
    pub reconnect_delay: Duration,
    pub inbound_capacity: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(10),
            inbound_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Reconnecting cloud link over any [`Connector`].
///
/// Owns the current connection (if any), an inbound queue fed by a listener
/// thread, and a single-flight reconnect thread. Connection state changes
/// are published on `state`; anyone waiting for the link to come back waits
/// there.
///
/// The connection slot is swapped atomically, so `send` and
/// `is_status_ok` never take a lock and may briefly see a stale view.
pub struct CloudLink<C: Connector> {
    connector: C,
    conn: ArcSwapOption<C::Conn>,
    state: Condition<LinkStatus>,
    reconnect_guard: Mutex<()>,
    reconnector: ManagedThread<()>,
    listener: ManagedThread<()>,
    inbound: BoundedQueue<Inbound>,
    opts: LinkOptions,
    closed: AtomicBool,
}

impl<C: Connector> CloudLink<C> {
    pub fn new(connector: C, readiness: Arc<dyn NetworkReadiness>, opts: LinkOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let name = connector.name().to_string();

            let reconnector = ManagedThread::new(format!("{name}-reconnect"), {
                let weak = weak.clone();
                let delay = opts.reconnect_delay;
                move |cancel: &CancelToken| {
                    Self::reconnect_loop(&weak, readiness.as_ref(), delay, cancel);
                    Ok(())
                }
            });

            let listener = ManagedThread::new(format!("{name}-listen"), {
                let weak = weak.clone();
                move |cancel: &CancelToken| {
                    while !cancel.is_cancelled() {
                        let Some(link) = weak.upgrade() else {
                            break;
                        };
                        link.listen_step(cancel);
                    }
                    Ok(())
                }
            });

            Self {
                connector,
                conn: ArcSwapOption::empty(),
                state: Condition::new(LinkStatus::Disconnected),
                reconnect_guard: Mutex::new(()),
                reconnector,
                listener,
                inbound: BoundedQueue::new(opts.inbound_capacity),
                opts,
                closed: AtomicBool::new(false),
            }
        })
    }

    pub fn options(&self) -> &LinkOptions {
        &self.opts
    }

    /// Units received but not yet taken by `recv`.
    pub fn pending_inbound(&self) -> usize {
        self.inbound.size()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn reconnect_loop(weak: &Weak<Self>, readiness: &dyn NetworkReadiness, delay: Duration, cancel: &CancelToken) {
        loop {
            if !readiness.wait_network_ready(cancel) {
                return;
            }
            let Some(link) = weak.upgrade() else {
                return;
            };
            if cancel.is_cancelled() || link.is_closed() {
                return;
            }

            tracing::info!("[{}] connecting...", link.name());
            link.disconnect();
            if link.connect() {
                tracing::info!("[{}] reconnected", link.name());
                return;
            }
            tracing::warn!("[{}] reconnect failed, retrying in {:?}", link.name(), delay);
            drop(link);

            if !cancel.sleep_cancellable(delay) {
                return;
            }
        }
    }

    /// One listener iteration: receive, enqueue, or recover from a broken link.
    fn listen_step(&self, cancel: &CancelToken) {
        let Some(conn) = self.conn.load_full() else {
            self.reconnect();
            self.wait_until_connected(cancel);
            return;
        };

        match conn.receive() {
            Ok(Some(unit)) => self.enqueue(unit, cancel),
            Ok(None) => {}
            Err(err) => {
                tracing::error!("[{}] receive failed: {:#}", self.name(), err);
                self.mark_down(&conn);
                self.reconnect();
                self.wait_until_connected(cancel);
            }
        }
    }

    fn enqueue(&self, mut unit: Inbound, cancel: &CancelToken) {
        loop {
            match self.inbound.put(unit, true, Some(INBOUND_PUT_POLL)) {
                Ok(()) => return,
                Err(rejected) if rejected.reason == QueueError::Full && !cancel.is_cancelled() => {
                    warn_throttled!(LOG_EVERY, "[{}] inbound queue full, receiver is lagging", self.name());
                    unit = rejected.into_inner();
                }
                Err(rejected) => {
                    tracing::debug!("[{}] dropping inbound unit: {}", self.name(), rejected.reason);
                    return;
                }
            }
        }
    }

    fn wait_until_connected(&self, cancel: &CancelToken) {
        let mut state = self.state.lock();
        while !cancel.is_cancelled() {
            let up = self
                .state
                .wait_for(&mut state, |s| *s == LinkStatus::Connected, Some(STATUS_POLL));
            if matches!(up, Ok(true)) {
                return;
            }
            // A reconnect requested while the previous run was still exiting
            // was refused; ask again so the link cannot stay down.
            MutexGuard::unlocked(&mut state, || self.reconnect());
        }
    }

    /// Drop `failed` if it is still the current connection. A newer
    /// connection installed meanwhile is left alone.
    fn mark_down(&self, failed: &Arc<C::Conn>) {
        let mut state = self.state.lock();
        let current = self.conn.load_full();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, failed)) {
            self.conn.store(None);
            failed.shutdown();
            *state = LinkStatus::Disconnected;
            let _ = self.state.notify_all(&state);
        }
    }

    fn disconnect(&self) {
        let mut state = self.state.lock();
        self.disconnect_locked(&mut state);
    }

    fn disconnect_locked(&self, state: &mut MutexGuard<'_, LinkStatus>) {
        if let Some(old) = self.conn.swap(None) {
            old.shutdown();
            tracing::debug!("[{}] disconnected", self.name());
        }
        **state = LinkStatus::Disconnected;
        let _ = self.state.notify_all(state);
    }

    fn install(&self, conn: C::Conn) -> bool {
        let conn = Arc::new(conn);
        let mut state = self.state.lock();
        if self.is_closed() {
            conn.shutdown();
            return false;
        }
        if let Some(old) = self.conn.swap(Some(conn)) {
            old.shutdown();
        }
        *state = LinkStatus::Connected;
        let _ = self.state.notify_all(&state);
        true
    }
}

impl<C: Connector> Transport for CloudLink<C> {
    fn name(&self) -> &str {
        self.connector.name()
    }

    fn connect(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut state = self.state.lock();
            if *state != LinkStatus::Connected {
                *state = LinkStatus::Connecting;
            }
        }

        // Opening may block for the connect timeout; the state lock is not
        // held so status readers and waiters are not stalled.
        match self.connector.open() {
            Ok(conn) => {
                let installed = self.install(conn);
                if installed {
                    tracing::info!("[{}] connected", self.name());
                }
                installed
            }
            Err(err) => {
                tracing::error!("[{}] connect failed: {:#}", self.name(), err);
                let mut state = self.state.lock();
                if *state == LinkStatus::Connecting {
                    *state = LinkStatus::Disconnected;
                }
                false
            }
        }
    }

    fn listen(&self) {
        if self.is_closed() {
            return;
        }
        if self.listener.start(Duration::ZERO).is_some() {
            tracing::info!("[{}] listener started", self.name());
        }
    }

    fn reconnect(&self) {
        let _guard = self.reconnect_guard.lock();
        if self.is_closed() {
            return;
        }
        if self.reconnector.start(Duration::ZERO).is_some() {
            tracing::info!("[{}] reconnect started", self.name());
        }
    }

    fn send(&self, unit: Outbound) -> bool {
        match self.conn.load_full() {
            Some(conn) if conn.is_healthy() => match conn.write(&unit) {
                Ok(sent) => sent,
                Err(err) => {
                    error_throttled!(LOG_EVERY, "[{}] send failed: {:#}", self.name(), err);
                    self.mark_down(&conn);
                    self.reconnect();
                    false
                }
            },
            _ => {
                warn_throttled!(
                    LOG_EVERY,
                    "[{}] link down, dropped {} bytes",
                    self.name(),
                    unit.payload().len()
                );
                self.reconnect();
                false
            }
        }
    }

    fn recv(&self) -> Result<Inbound, QueueError> {
        self.inbound.get(true, None)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Inbound, QueueError> {
        if timeout.is_zero() {
            return self.inbound.try_get();
        }
        self.inbound.get(true, Some(timeout))
    }

    fn is_status_ok(&self) -> bool {
        self.conn.load_full().is_some_and(|conn| conn.is_healthy())
    }

    fn status(&self) -> LinkStatus {
        *self.state.lock()
    }

    fn wait_connected(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        matches!(
            self.state
                .wait_for(&mut state, |s| *s == LinkStatus::Connected, timeout),
            Ok(true)
        )
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listener.stop();
        self.reconnector.stop();
        self.disconnect();
        self.inbound.close();
        self.listener.join();
        self.reconnector.join();
        tracing::info!("[{}] closed", self.name());
    }

    fn frame(&self, payload: Bytes) -> Outbound {
        self.connector.frame(payload)
    }
}

impl<C: Connector> Drop for CloudLink<C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::AlwaysReady;
    use crate::utils::HealthFlag;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// In-memory connection: inbound units are fed through a queue, writes
    /// are recorded.
    struct MockConn {
        health: HealthFlag,
        feed: Arc<BoundedQueue<anyhow::Result<Inbound>>>,
        written: Arc<parking_lot::Mutex<Vec<Outbound>>>,
        write_result: bool,
        broken: bool,
    }

    impl Connection for MockConn {
        fn receive(&self) -> anyhow::Result<Option<Inbound>> {
            if self.broken {
                self.health.down();
                anyhow::bail!("connection reset by peer");
            }
            match self.feed.get(true, Some(Duration::from_millis(20))) {
                Ok(item) => item.map(Some),
                Err(QueueError::Closed) => anyhow::bail!("connection closed"),
                Err(_) => Ok(None),
            }
        }

        fn write(&self, unit: &Outbound) -> anyhow::Result<bool> {
            self.written.lock().push(unit.clone());
            Ok(self.write_result)
        }

        fn is_healthy(&self) -> bool {
            self.health.get()
        }

        fn shutdown(&self) {
            self.health.down();
        }
    }

    #[derive(Clone)]
    struct MockConnector {
        opens: Arc<AtomicUsize>,
        fail_first: usize,
        feed: Arc<BoundedQueue<anyhow::Result<Inbound>>>,
        written: Arc<parking_lot::Mutex<Vec<Outbound>>>,
        open_delay: Duration,
        /// Connections opened before this count fail on their first receive.
        broken_first: usize,
    }

    impl MockConnector {
        fn new(fail_first: usize) -> Self {
            Self {
                opens: Arc::new(AtomicUsize::new(0)),
                fail_first,
                feed: Arc::new(BoundedQueue::new(16)),
                written: Arc::new(parking_lot::Mutex::new(Vec::new())),
                open_delay: Duration::ZERO,
                broken_first: 0,
            }
        }
    }

    impl Connector for MockConnector {
        type Conn = MockConn;

        fn name(&self) -> &str {
            "MockLink"
        }

        fn open(&self) -> anyhow::Result<MockConn> {
            std::thread::sleep(self.open_delay);
            let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                anyhow::bail!("refused (attempt {attempt})");
            }
            Ok(MockConn {
                health: HealthFlag::new(true),
                feed: self.feed.clone(),
                written: self.written.clone(),
                write_result: true,
                broken: attempt < self.broken_first,
            })
        }

        fn frame(&self, payload: Bytes) -> Outbound {
            Outbound::Raw(payload)
        }
    }

    fn fast_opts() -> LinkOptions {
        LinkOptions {
            reconnect_delay: Duration::from_millis(20),
            inbound_capacity: 4,
        }
    }

    #[test]
    fn connect_failure_is_a_false_not_an_error() {
        let link = CloudLink::new(MockConnector::new(1), Arc::new(AlwaysReady), fast_opts());
        assert!(!link.connect());
        assert_eq!(link.status(), LinkStatus::Disconnected);
        assert!(link.connect());
        assert_eq!(link.status(), LinkStatus::Connected);
        assert!(link.is_status_ok());
    }

    #[test]
    fn reconnect_retries_until_success() {
        let connector = MockConnector::new(3);
        let opens = connector.opens.clone();
        let link = CloudLink::new(connector, Arc::new(AlwaysReady), fast_opts());

        link.reconnect();
        assert!(link.wait_connected(Some(Duration::from_secs(5))));
        assert_eq!(opens.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn reconnect_is_single_flight() {
        let mut connector = MockConnector::new(0);
        connector.open_delay = Duration::from_millis(100);
        let opens = connector.opens.clone();
        let link = CloudLink::new(connector, Arc::new(AlwaysReady), fast_opts());

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let link = link.clone();
                std::thread::spawn(move || link.reconnect())
            })
            .collect();
        for c in callers {
            c.join().unwrap();
        }
        assert!(link.wait_connected(Some(Duration::from_secs(5))));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_feeds_recv_in_order() {
        let connector = MockConnector::new(0);
        let feed = connector.feed.clone();
        let link = CloudLink::new(connector, Arc::new(AlwaysReady), fast_opts());
        assert!(link.connect());
        link.listen();

        for p in [&b"one"[..], b"two", b"three"] {
            feed.put(Ok(Inbound::raw(Bytes::copy_from_slice(p))), true, None).unwrap();
        }
        for p in [&b"one"[..], b"two", b"three"] {
            let unit = link.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(unit.payload, Bytes::copy_from_slice(p));
        }
    }

    #[test]
    fn receive_error_marks_down_and_recovers() {
        let connector = MockConnector::new(0);
        let feed = connector.feed.clone();
        let opens = connector.opens.clone();
        let link = CloudLink::new(connector, Arc::new(AlwaysReady), fast_opts());
        assert!(link.connect());
        link.listen();

        feed.put(Err(anyhow::anyhow!("connection reset")), true, None).unwrap();

        let start = Instant::now();
        while opens.load(Ordering::SeqCst) < 2 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert!(link.wait_connected(Some(Duration::from_secs(5))));

        // The listener is back on the new connection.
        feed.put(Ok(Inbound::raw(Bytes::from_static(b"after"))), true, None).unwrap();
        let unit = link.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(unit.payload, Bytes::from_static(b"after"));
    }

    #[test]
    fn close_unblocks_recv_and_refuses_reconnect() {
        let connector = MockConnector::new(0);
        let opens = connector.opens.clone();
        let link = CloudLink::new(connector, Arc::new(AlwaysReady), fast_opts());
        assert!(link.connect());
        link.listen();

        let receiver = {
            let link = link.clone();
            std::thread::spawn(move || link.recv())
        };
        std::thread::sleep(Duration::from_millis(30));
        link.close();

        assert_eq!(receiver.join().unwrap(), Err(QueueError::Closed));
        assert!(!link.is_status_ok());
        assert_eq!(link.status(), LinkStatus::Disconnected);

        assert!(!link.send(Outbound::Raw(Bytes::from_static(b"late"))));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_keeps_recovering_from_back_to_back_drops() {
        const DROPS: usize = 40;
        let links: Vec<_> = (0..8)
            .map(|_| {
                let mut connector = MockConnector::new(0);
                connector.broken_first = DROPS;
                let opens = connector.opens.clone();
                let opts = LinkOptions {
                    reconnect_delay: Duration::from_millis(1),
                    inbound_capacity: 4,
                };
                let link = CloudLink::new(connector, Arc::new(AlwaysReady), opts);
                assert!(link.connect());
                link.listen();
                (link, opens)
            })
            .collect();

        for (link, opens) in &links {
            let start = Instant::now();
            while opens.load(Ordering::SeqCst) <= DROPS && start.elapsed() < Duration::from_secs(30) {
                std::thread::sleep(Duration::from_millis(5));
            }
            assert!(opens.load(Ordering::SeqCst) > DROPS, "listener stopped reconnecting");
            assert!(link.wait_connected(Some(Duration::from_secs(5))));
            assert!(link.is_status_ok());
        }
    }
}
