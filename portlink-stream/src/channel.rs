//! The reliable channel: session lifecycle, sliding-window transfer,
//! retransmission, heartbeats, and file streaming over any [`Transport`].
//!
//! Four cooperating workers run as tasks on the runtime:
//!
//! 1. the receive worker drains transport bytes through the codec and
//!    dispatches completed frames,
//! 2. the send worker admits queued frames into the send window and writes
//!    them out,
//! 3. the retransmit driver rescans the window on a `timeout_base / 2`
//!    cadence,
//! 4. the heartbeat worker emits keepalives on idle and polices peer
//!    liveness.
//!
//! Lock order, where two are ever held together: state before send before
//! receive. Application callbacks always fire with no channel lock held.

use crate::codec::FrameCodec;
use crate::frame::{self, FrameKind, StartMetadata};
use crate::rtt::RttEstimator;
use crate::stats::{ChannelStats, StatsCells};
use crate::window::{RecvOutcome, RecvWindow, SendWindow};
use bytes::Bytes;
use portlink_core::{ChannelConfig, Error, SessionId};
use portlink_transport::{Transport, TransportState};
use rand::{rngs::SmallRng, SeedableRng};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Reported per delivered chunk as `(bytes_transferred, bytes_total)`;
/// a zero total means the total is unknown.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;
/// Fired for every payload delivered in order, alongside the pull-style
/// [`ReliableChannel::receive`].
pub type DeliveryCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Fired with `true` when a session establishes and `false` when it ends.
pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;
/// Fired for every error the channel records.
pub type ChannelErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Session lifecycle. `Failed` is reachable from any live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Handshaking,
    Established,
    Closing,
    Closed,
    Failed,
}

/// Capacity of the application send queue, in frames. Deliberately shallow
/// so a large `send` back-pressures against the window instead of being
/// swallowed whole before a failure can surface.
const SEND_QUEUE_LIMIT: usize = 64;
/// Capacity of the raw-byte queue between the transport callback and the
/// receive worker.
const RECV_QUEUE_LIMIT: usize = 1024;
/// Fallback poll period for condition waits; bounds the cost of a missed
/// notification.
const WAIT_TICK: Duration = Duration::from_millis(20);
/// Minimum spacing between duplicate-ACK fast retransmits of one slot.
const FAST_RETRANSMIT_GAP: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A sequenced frame queued for the send worker.
struct SendItem {
    kind: FrameKind,
    payload: Bytes,
}

/// Sequenced arrivals flowing through the receive window.
enum Inbound {
    Data(Bytes),
    Start(StartMetadata),
    End,
}

struct StateCell {
    session: SessionState,
    session_id: Option<SessionId>,
}

struct RecvState {
    window: RecvWindow<Inbound>,
    /// In-order payloads awaiting application `receive`.
    ready: VecDeque<Bytes>,
    remote_closed: bool,
    /// Metadata of a START that announced a file, until claimed by
    /// `receive_file`.
    incoming_file: Option<StartMetadata>,
}

struct Shared {
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<StateCell>,
    send: Mutex<SendWindow>,
    recv: Mutex<RecvState>,
    rtt: Mutex<RttEstimator>,
    stats: StatsCells,
    /// Heartbeats use their own wrapping counter, separate from the DATA
    /// sequence space.
    heartbeat_seq: AtomicU16,
    queued_items: AtomicUsize,
    file_active: AtomicBool,
    last_send: Mutex<Instant>,
    last_recv: Mutex<Instant>,
    last_error: Mutex<Option<Error>>,
    state_notify: Notify,
    window_notify: Notify,
    ready_notify: Notify,
    delivery_cb: Mutex<Option<DeliveryCallback>>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    error_cb: Mutex<Option<ChannelErrorCallback>>,
    cancel: CancellationToken,
}

impl Shared {
    fn session(&self) -> SessionState {
        lock(&self.state).session
    }

    /// Write pre-encoded frame bytes to the transport. Must never be called
    /// with a channel lock held: a write failure escalates through `fail`,
    /// which takes the state lock.
    fn write_wire(&self, wire: &[u8]) -> bool {
        match self.transport.write(wire) {
            Ok(()) => {
                *lock(&self.last_send) = Instant::now();
                true
            }
            Err(err) => {
                self.fail(Error::transport(err.to_string()));
                false
            }
        }
    }

    fn write_control(&self, kind: FrameKind, sequence: u16) {
        let wire = frame::encode(kind, sequence, &[], self.config.max_payload_size);
        let _ = self.write_wire(&wire);
    }

    /// Record a non-fatal error: counted, retained, reported.
    fn record_error(&self, err: Error) {
        self.stats.add(&self.stats.errors, 1);
        *lock(&self.last_error) = Some(err.clone());
        let cb = lock(&self.error_cb).clone();
        if let Some(cb) = cb {
            cb(&err);
        }
    }

    fn protocol_error(&self, err: Error) {
        debug!(%err, "protocol error");
        self.record_error(err);
    }

    /// Fatal escalation: the session moves to `Failed`, every waiter wakes,
    /// pending operations observe the failure.
    fn fail(&self, err: Error) {
        let was_connected = {
            let mut st = lock(&self.state);
            match st.session {
                SessionState::Failed | SessionState::Closed => {
                    drop(st);
                    self.record_error(err);
                    return;
                }
                current => {
                    st.session = SessionState::Failed;
                    matches!(
                        current,
                        SessionState::Established | SessionState::Closing
                    )
                }
            }
        };
        warn!(%err, "channel failed");
        self.record_error(err);
        self.state_notify.notify_waiters();
        self.window_notify.notify_waiters();
        self.ready_notify.notify_waiters();
        if was_connected {
            self.notify_connection(false);
        }
    }

    fn notify_connection(&self, connected: bool) {
        let cb = lock(&self.connection_cb).clone();
        if let Some(cb) = cb {
            cb(connected);
        }
    }
}

/// Full-duplex reliable channel over an abstract byte pipe.
pub struct ReliableChannel {
    inner: Arc<Shared>,
    item_tx: mpsc::Sender<SendItem>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReliableChannel {
    /// Bind to a transport: validate the configuration, install the
    /// transport callbacks, allocate windows and codec, and start the
    /// worker tasks. Must run inside a tokio runtime.
    pub fn initialize(
        transport: Arc<dyn Transport>,
        config: ChannelConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        let now = Instant::now();
        let inner = Arc::new(Shared {
            state: Mutex::new(StateCell {
                session: SessionState::Idle,
                session_id: None,
            }),
            send: Mutex::new(SendWindow::new(config.initial_sequence, config.window_size)),
            recv: Mutex::new(RecvState {
                window: RecvWindow::new(0, config.window_size),
                ready: VecDeque::new(),
                remote_closed: false,
                incoming_file: None,
            }),
            rtt: Mutex::new(RttEstimator::new(config.timeout_base(), config.timeout_max())),
            stats: StatsCells::default(),
            heartbeat_seq: AtomicU16::new(0),
            queued_items: AtomicUsize::new(0),
            file_active: AtomicBool::new(false),
            last_send: Mutex::new(now),
            last_recv: Mutex::new(now),
            last_error: Mutex::new(None),
            state_notify: Notify::new(),
            window_notify: Notify::new(),
            ready_notify: Notify::new(),
            delivery_cb: Mutex::new(None),
            connection_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
            cancel: CancellationToken::new(),
            transport: Arc::clone(&transport),
            config,
        });

        // The transport callback must stay cheap: it hands bytes to the
        // receive worker through a bounded queue and returns.
        let (bytes_tx, bytes_rx) = mpsc::channel::<Vec<u8>>(RECV_QUEUE_LIMIT);
        transport.set_data_callback(Some(Arc::new(move |bytes: &[u8]| {
            if bytes_tx.try_send(bytes.to_vec()).is_err() {
                // Receive worker backlogged; the codec resynchronizes past
                // the gap and the sender retransmits.
                warn!(len = bytes.len(), "inbound bytes dropped: receive queue full");
            }
        })));
        let weak: Weak<Shared> = Arc::downgrade(&inner);
        transport.set_error_callback(Some(Arc::new(move |err| {
            if let Some(shared) = weak.upgrade() {
                shared.record_error(Error::transport(err.to_string()));
            }
        })));
        let weak: Weak<Shared> = Arc::downgrade(&inner);
        transport.set_state_callback(Some(Arc::new(move |state| {
            if !matches!(state, TransportState::Closed | TransportState::Error) {
                return;
            }
            if let Some(shared) = weak.upgrade() {
                if matches!(
                    shared.session(),
                    SessionState::Handshaking | SessionState::Established | SessionState::Closing
                ) {
                    shared.fail(Error::transport("transport closed mid-session"));
                }
            }
        })));

        let (item_tx, item_rx) = mpsc::channel::<SendItem>(SEND_QUEUE_LIMIT);
        let workers = vec![
            tokio::spawn(recv_loop(Arc::clone(&inner), bytes_rx)),
            tokio::spawn(send_loop(Arc::clone(&inner), item_rx)),
            tokio::spawn(retransmit_loop(Arc::clone(&inner))),
            tokio::spawn(heartbeat_loop(Arc::clone(&inner))),
        ];

        Ok(Self {
            inner,
            item_tx,
            workers: Mutex::new(workers),
        })
    }

    /// Perform the handshake as initiator. Returns once both sides are
    /// established or the attempt timed out, in which case the channel is
    /// failed.
    pub async fn connect(&self) -> bool {
        enum Plan {
            Initiate(StartMetadata),
            WaitOnly,
            Done(bool),
        }
        let plan = {
            let mut st = lock(&self.inner.state);
            match st.session {
                SessionState::Established => Plan::Done(true),
                SessionState::Handshaking => Plan::WaitOnly,
                SessionState::Idle => {
                    let mut rng = SmallRng::from_entropy();
                    let session_id = SessionId::generate(&mut rng);
                    st.session = SessionState::Handshaking;
                    st.session_id = Some(session_id);
                    Plan::Initiate(StartMetadata::bare(self.inner.config.version, session_id))
                }
                _ => Plan::Done(false),
            }
        };
        match plan {
            Plan::Done(ok) => {
                if !ok {
                    self.inner
                        .record_error(Error::protocol("connect on a finished channel"));
                }
                ok
            }
            Plan::WaitOnly => self.wait_established().await,
            Plan::Initiate(meta) => {
                info!(session = %meta.session_id, "handshake initiated");
                self.start_handshake(meta).await
            }
        }
    }

    async fn start_handshake(&self, meta: StartMetadata) -> bool {
        let payload = meta.encode();
        if payload.len() > self.inner.config.max_payload_size {
            self.inner
                .record_error(Error::config("start metadata exceeds max_payload_size"));
            return false;
        }
        if !self.enqueue(FrameKind::Start, payload).await {
            return false;
        }
        let ok = self.wait_established().await;
        if !ok && self.inner.session() == SessionState::Handshaking {
            self.inner.fail(Error::timeout("handshake timed out"));
        }
        ok
    }

    async fn wait_established(&self) -> bool {
        let deadline = Instant::now() + self.inner.config.timeout_max();
        loop {
            match self.inner.session() {
                SessionState::Established => return true,
                SessionState::Handshaking => {}
                _ => return false,
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(WAIT_TICK);
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return false,
                _ = self.inner.state_notify.notified() => {}
                _ = sleep(wait) => {}
            }
        }
    }

    /// Close the session: END is sequenced after everything already queued,
    /// and the call waits for its acknowledgment, tolerating stalls up to
    /// `timeout_max`. The workers are torn down afterwards either way.
    pub async fn disconnect(&self) -> bool {
        enum Plan {
            SendEnd,
            WaitOnly,
            Done(bool),
        }
        let plan = {
            let mut st = lock(&self.inner.state);
            match st.session {
                SessionState::Established | SessionState::Handshaking => {
                    st.session = SessionState::Closing;
                    Plan::SendEnd
                }
                SessionState::Closing => Plan::WaitOnly,
                SessionState::Idle | SessionState::Closed => Plan::Done(true),
                SessionState::Failed => Plan::Done(false),
            }
        };
        let ok = match plan {
            Plan::Done(ok) => ok,
            Plan::SendEnd => {
                info!("disconnect: sending end");
                if self.enqueue(FrameKind::End, Bytes::new()).await {
                    self.wait_closed().await
                } else {
                    false
                }
            }
            Plan::WaitOnly => self.wait_closed().await,
        };
        self.shutdown().await;
        ok
    }

    /// Wait for the session to reach `Closed`. The deadline restarts
    /// whenever the send pipeline makes progress, so a large backlog drains
    /// as long as acknowledgments keep arriving; a full `timeout_max` of
    /// stall forces the teardown.
    async fn wait_closed(&self) -> bool {
        let stall_limit = self.inner.config.timeout_max();
        let mut deadline = Instant::now() + stall_limit;
        let mut progress_mark = self.progress_mark();
        loop {
            match self.inner.session() {
                SessionState::Closed => return true,
                SessionState::Failed => return false,
                _ => {}
            }
            let mark = self.progress_mark();
            let now = Instant::now();
            if mark != progress_mark {
                progress_mark = mark;
                deadline = now + stall_limit;
            }
            if now >= deadline {
                {
                    let mut st = lock(&self.inner.state);
                    if st.session != SessionState::Failed {
                        st.session = SessionState::Closed;
                    }
                }
                self.inner
                    .record_error(Error::timeout("end acknowledgment timed out"));
                self.inner.state_notify.notify_waiters();
                return false;
            }
            let wait = (deadline - now).min(WAIT_TICK);
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return false,
                _ = self.inner.state_notify.notified() => {}
                _ = sleep(wait) => {}
            }
        }
    }

    fn progress_mark(&self) -> (usize, u16, usize) {
        let queued = self.inner.queued_items.load(Ordering::Relaxed);
        let w = lock(&self.inner.send);
        (queued, w.base(), w.in_flight())
    }

    /// Queue payload bytes for reliable delivery. The call returns once
    /// every chunk has been accepted into the send pipeline, which may
    /// suspend briefly while the window and queue are full; delivery
    /// confirmation is the peer's acknowledgments, not this return value.
    pub async fn send(&self, data: &[u8]) -> bool {
        if self.inner.session() != SessionState::Established {
            self.inner.record_error(Error::protocol("send while not connected"));
            return false;
        }
        let max = self.inner.config.max_payload_size;
        if data.is_empty() {
            return self.enqueue(FrameKind::Data, Bytes::new()).await;
        }
        for chunk in data.chunks(max) {
            match self.inner.session() {
                SessionState::Established => {}
                // A fatal error already set last_error; leave it visible.
                SessionState::Failed => return false,
                SessionState::Closing | SessionState::Closed => {
                    self.inner.record_error(Error::Cancelled);
                    return false;
                }
                _ => return false,
            }
            if !self
                .enqueue(FrameKind::Data, Bytes::copy_from_slice(chunk))
                .await
            {
                return false;
            }
        }
        true
    }

    async fn enqueue(&self, kind: FrameKind, payload: Bytes) -> bool {
        let item = SendItem { kind, payload };
        // Counted before the hand-off so the worker's decrement can never
        // observe a stale zero.
        self.inner.queued_items.fetch_add(1, Ordering::Relaxed);
        tokio::select! {
            _ = self.inner.cancel.cancelled() => {
                self.inner.queued_items.fetch_sub(1, Ordering::Relaxed);
                self.inner.record_error(Error::Cancelled);
                false
            }
            res = self.item_tx.send(item) => {
                if res.is_ok() {
                    true
                } else {
                    self.inner.queued_items.fetch_sub(1, Ordering::Relaxed);
                    self.inner.record_error(Error::Cancelled);
                    false
                }
            }
        }
    }

    /// Take the next in-order payload, waiting up to `timeout`. `None`
    /// means the timeout elapsed, the peer closed, or the channel failed.
    pub async fn receive(&self, timeout: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut rx = lock(&self.inner.recv);
                if let Some(payload) = rx.ready.pop_front() {
                    return Some(payload);
                }
                if rx.remote_closed {
                    return None;
                }
            }
            if matches!(
                self.inner.session(),
                SessionState::Failed | SessionState::Closed
            ) {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wait = (deadline - now).min(WAIT_TICK);
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return None,
                _ = self.inner.ready_notify.notified() => {}
                _ = sleep(wait) => {}
            }
        }
    }

    /// Stream a file: START carrying its metadata, chunked DATA, then END.
    /// Progress fires per chunk with `(bytes_sent, total)`. The session is
    /// closed (and the workers torn down) once the transfer completes.
    pub async fn send_file<P: AsRef<Path>>(
        &self,
        path: P,
        progress: Option<ProgressCallback>,
    ) -> bool {
        let path = path.as_ref();
        let meta_fs = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(err) => {
                self.inner.record_error(err.into());
                return false;
            }
        };
        let total = meta_fs.len();
        let modify_time = meta_fs
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let file_name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (needs_handshake, session_id) = {
            let mut st = lock(&self.inner.state);
            match st.session {
                SessionState::Idle => {
                    let mut rng = SmallRng::from_entropy();
                    let session_id = SessionId::generate(&mut rng);
                    st.session = SessionState::Handshaking;
                    st.session_id = Some(session_id);
                    (true, session_id)
                }
                SessionState::Established => match st.session_id {
                    Some(id) => (false, id),
                    None => (false, SessionId(0)),
                },
                _ => {
                    drop(st);
                    self.inner
                        .record_error(Error::protocol("send_file on a finished channel"));
                    return false;
                }
            }
        };
        let meta = StartMetadata {
            version: self.inner.config.version,
            flags: 0,
            file_name,
            file_size: total,
            modify_time,
            session_id,
        };
        info!(file = %meta.file_name, size = total, session = %session_id, "file send starting");

        self.inner.file_active.store(true, Ordering::Relaxed);
        let streamed = self
            .stream_file_out(path, meta, needs_handshake, total, progress)
            .await;
        let ok = if streamed { self.disconnect().await } else { streamed };
        self.inner.file_active.store(false, Ordering::Relaxed);
        ok
    }

    async fn stream_file_out(
        &self,
        path: &Path,
        meta: StartMetadata,
        handshake: bool,
        total: u64,
        progress: Option<ProgressCallback>,
    ) -> bool {
        let payload = meta.encode();
        if payload.len() > self.inner.config.max_payload_size {
            self.inner
                .record_error(Error::config("start metadata exceeds max_payload_size"));
            return false;
        }
        if handshake {
            if !self.enqueue(FrameKind::Start, payload).await {
                return false;
            }
            if !self.wait_established().await {
                if self.inner.session() == SessionState::Handshaking {
                    self.inner.fail(Error::timeout("handshake timed out"));
                }
                return false;
            }
        } else if !self.enqueue(FrameKind::Start, payload).await {
            return false;
        }

        let mut file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(err) => {
                self.inner.record_error(err.into());
                return false;
            }
        };
        if let Some(cb) = &progress {
            cb(0, total);
        }
        let mut sent: u64 = 0;
        let mut buf = vec![0u8; self.inner.config.max_payload_size];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    self.inner.record_error(err.into());
                    return false;
                }
            };
            if n == 0 {
                break;
            }
            if !self.send(&buf[..n]).await {
                return false;
            }
            sent += n as u64;
            if let Some(cb) = &progress {
                cb(sent, total);
            }
        }
        true
    }

    /// Receive one file announced by the peer's START metadata, writing it
    /// to `path`. Accumulation stops exactly at the declared size; a
    /// truncated transfer leaves the partial file on disk and returns
    /// false.
    pub async fn receive_file<P: AsRef<Path>>(
        &self,
        path: P,
        progress: Option<ProgressCallback>,
    ) -> bool {
        let meta = match self.wait_incoming_file().await {
            Some(meta) => meta,
            None => {
                self.inner
                    .record_error(Error::timeout("no incoming file announced"));
                return false;
            }
        };
        let total = meta.file_size;
        info!(file = %meta.file_name, size = total, "file receive starting");
        self.inner.file_active.store(true, Ordering::Relaxed);

        let mut file = match tokio::fs::File::create(path.as_ref()).await {
            Ok(f) => f,
            Err(err) => {
                self.inner.record_error(err.into());
                self.inner.file_active.store(false, Ordering::Relaxed);
                return false;
            }
        };
        if let Some(cb) = &progress {
            cb(0, total);
        }
        let mut written: u64 = 0;
        let mut ok = true;
        while written < total {
            let Some(chunk) = self.receive(self.inner.config.timeout_max()).await else {
                self.inner
                    .record_error(Error::timeout("file stream stalled; partial file retained"));
                ok = false;
                break;
            };
            let remaining = total - written;
            if chunk.len() as u64 > remaining {
                // Peer sent past the announced size.
                self.inner.protocol_error(Error::protocol(
                    "file stream overran declared size",
                ));
                let take = remaining as usize;
                if file.write_all(&chunk[..take]).await.is_err() {
                    self.inner.record_error(Error::Io("short write".into()));
                }
                ok = false;
                break;
            }
            if let Err(err) = file.write_all(&chunk).await {
                self.inner.record_error(err.into());
                ok = false;
                break;
            }
            written += chunk.len() as u64;
            if let Some(cb) = &progress {
                cb(written, total);
            }
        }
        if file.flush().await.is_err() {
            ok = false;
        }
        {
            let mut rx = lock(&self.inner.recv);
            rx.incoming_file = None;
        }
        self.inner.file_active.store(false, Ordering::Relaxed);
        ok
    }

    async fn wait_incoming_file(&self) -> Option<StartMetadata> {
        let deadline = Instant::now() + self.inner.config.timeout_max();
        loop {
            {
                let rx = lock(&self.inner.recv);
                if let Some(meta) = rx.incoming_file.clone() {
                    return Some(meta);
                }
            }
            if matches!(
                self.inner.session(),
                SessionState::Failed | SessionState::Closed
            ) {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wait = (deadline - now).min(WAIT_TICK);
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return None,
                _ = self.inner.ready_notify.notified() => {}
                _ = self.inner.state_notify.notified() => {}
                _ = sleep(wait) => {}
            }
        }
    }

    /// Stop the workers and detach from the transport. The transport itself
    /// stays open for reuse. Idempotent; also invoked by `disconnect`.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.state_notify.notify_waiters();
        self.inner.window_notify.notify_waiters();
        self.inner.ready_notify.notify_waiters();
        self.inner.transport.set_data_callback(None);
        self.inner.transport.set_error_callback(None);
        self.inner.transport.set_state_callback(None);
        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    // ---- observability ----------------------------------------------------

    pub fn get_stats(&self) -> ChannelStats {
        let (srtt_ms, rto) = {
            let rtt = lock(&self.inner.rtt);
            (rtt.srtt_ms(), rtt.initial_rto())
        };
        self.inner.stats.snapshot(srtt_ms, rto.as_millis() as u64)
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    pub fn state(&self) -> SessionState {
        self.inner.session()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session() == SessionState::Established
    }

    pub fn last_error(&self) -> Option<Error> {
        lock(&self.inner.last_error).clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        lock(&self.inner.state).session_id
    }

    /// Next sequence this side will allocate.
    pub fn local_sequence(&self) -> u16 {
        lock(&self.inner.send).next_sequence()
    }

    /// Next in-order sequence expected from the peer.
    pub fn remote_sequence(&self) -> u16 {
        lock(&self.inner.recv).window.next_sequence()
    }

    /// Heartbeats issued so far.
    pub fn heartbeat_sequence(&self) -> u16 {
        self.inner.heartbeat_seq.load(Ordering::Relaxed)
    }

    pub fn send_queue_len(&self) -> usize {
        self.inner.queued_items.load(Ordering::Relaxed)
    }

    pub fn receive_queue_len(&self) -> usize {
        lock(&self.inner.recv).ready.len()
    }

    pub fn is_file_transfer_active(&self) -> bool {
        self.inner.file_active.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn set_delivery_callback(&self, cb: Option<DeliveryCallback>) {
        *lock(&self.inner.delivery_cb) = cb;
    }

    pub fn set_connection_callback(&self, cb: Option<ConnectionCallback>) {
        *lock(&self.inner.connection_cb) = cb;
    }

    pub fn set_error_callback(&self, cb: Option<ChannelErrorCallback>) {
        *lock(&self.inner.error_cb) = cb;
    }
}

impl Drop for ReliableChannel {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        for handle in lock(&self.workers).drain(..) {
            handle.abort();
        }
    }
}

// ---- workers --------------------------------------------------------------

async fn recv_loop(inner: Arc<Shared>, mut bytes_rx: mpsc::Receiver<Vec<u8>>) {
    let mut codec = FrameCodec::new(inner.config.max_payload_size);
    loop {
        let bytes = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            chunk = bytes_rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };
        codec.append(&bytes);
        while let Some(result) = codec.try_next_frame() {
            match result {
                Ok(frame) => on_frame(&inner, frame),
                Err(err) => {
                    inner.stats.add(&inner.stats.packets_invalid, 1);
                    debug!(%err, "invalid frame discarded");
                }
            }
        }
    }
}

fn on_frame(inner: &Arc<Shared>, frame: frame::Frame) {
    *lock(&inner.last_recv) = Instant::now();
    trace!(kind = ?frame.kind, seq = frame.sequence, "frame in");
    match frame.kind {
        FrameKind::Start => on_start(inner, frame),
        FrameKind::Data => on_sequenced(inner, frame.sequence, Inbound::Data(frame.payload)),
        FrameKind::End => on_sequenced(inner, frame.sequence, Inbound::End),
        FrameKind::Ack => on_ack(inner, frame.sequence),
        FrameKind::Nak => on_nak(inner, frame.sequence),
        FrameKind::Heartbeat => {}
    }
}

fn on_start(inner: &Arc<Shared>, frame: frame::Frame) {
    let meta = match StartMetadata::decode(&frame.payload) {
        Ok(meta) => meta,
        Err(err) => {
            inner.protocol_error(err);
            return;
        }
    };
    enum Action {
        Establish,
        Windowed,
        Mismatch,
        Drop,
    }
    let action = {
        let mut st = lock(&inner.state);
        match st.session {
            SessionState::Idle => {
                st.session = SessionState::Established;
                st.session_id = Some(meta.session_id);
                Action::Establish
            }
            SessionState::Handshaking
            | SessionState::Established
            | SessionState::Closing
            | SessionState::Closed => {
                if st.session_id == Some(meta.session_id) {
                    Action::Windowed
                } else {
                    Action::Mismatch
                }
            }
            SessionState::Failed => Action::Drop,
        }
    };
    match action {
        Action::Establish => {
            {
                let mut rx = lock(&inner.recv);
                rx.window.rebase(frame.sequence.wrapping_add(1));
                if meta.has_file() {
                    rx.incoming_file = Some(meta.clone());
                }
            }
            info!(session = %meta.session_id, seq = frame.sequence, "session established");
            inner.write_control(FrameKind::Ack, frame.sequence);
            inner.state_notify.notify_waiters();
            inner.ready_notify.notify_waiters();
            inner.notify_connection(true);
        }
        Action::Windowed => on_sequenced(inner, frame.sequence, Inbound::Start(meta)),
        Action::Mismatch => inner.protocol_error(Error::protocol(format!(
            "start collision: session {} does not match ours",
            meta.session_id
        ))),
        Action::Drop => {}
    }
}

fn on_sequenced(inner: &Arc<Shared>, seq: u16, item: Inbound) {
    // Closed stays in the gate so a retransmitted END (its ACK was lost)
    // still draws a fresh acknowledgment instead of stranding the peer.
    if !matches!(
        inner.session(),
        SessionState::Established | SessionState::Closing | SessionState::Closed
    ) {
        return;
    }
    if matches!(item, Inbound::Data(_)) {
        inner.stats.add(&inner.stats.packets_received, 1);
    }
    let outcome = lock(&inner.recv).window.accept(seq, item);
    match outcome {
        RecvOutcome::Delivered(run) => {
            // ACK the tail of the contiguous run; the acknowledgment is
            // cumulative on the send side.
            if let Some((last, _)) = run.last() {
                inner.write_control(FrameKind::Ack, *last);
            }
            deliver_run(inner, run);
        }
        RecvOutcome::Buffered | RecvOutcome::BufferedDuplicate => {
            // Out-of-order: duplicate-ACK the last in-order sequence, which
            // doubles as the fast-retransmit hint for the gap.
            let last_in_order = lock(&inner.recv).window.next_sequence().wrapping_sub(1);
            inner.write_control(FrameKind::Ack, last_in_order);
        }
        RecvOutcome::DuplicateBelow => {
            // Already delivered; the peer missed our ACK.
            inner.write_control(FrameKind::Ack, seq);
        }
        RecvOutcome::OutOfWindow => {
            debug!(seq, "sequence outside receive window; dropped");
        }
    }
}

fn deliver_run(inner: &Arc<Shared>, run: Vec<(u16, Inbound)>) {
    for (seq, item) in run {
        match item {
            Inbound::Data(payload) => {
                inner
                    .stats
                    .add(&inner.stats.bytes_received, payload.len() as u64);
                {
                    let mut rx = lock(&inner.recv);
                    rx.ready.push_back(payload.clone());
                }
                inner.ready_notify.notify_one();
                let cb = lock(&inner.delivery_cb).clone();
                if let Some(cb) = cb {
                    cb(&payload);
                }
            }
            Inbound::Start(meta) => {
                debug!(session = %meta.session_id, seq, "in-session start");
                if meta.has_file() {
                    let mut rx = lock(&inner.recv);
                    rx.incoming_file = Some(meta);
                }
                inner.ready_notify.notify_waiters();
            }
            Inbound::End => {
                info!(seq, "peer ended session");
                let was_connected = {
                    let mut st = lock(&inner.state);
                    let was = matches!(
                        st.session,
                        SessionState::Established | SessionState::Closing
                    );
                    if was {
                        st.session = SessionState::Closed;
                    }
                    was
                };
                {
                    let mut rx = lock(&inner.recv);
                    rx.remote_closed = true;
                }
                inner.state_notify.notify_waiters();
                inner.ready_notify.notify_waiters();
                if was_connected {
                    inner.notify_connection(false);
                }
            }
        }
    }
}

fn on_ack(inner: &Arc<Shared>, seq: u16) {
    let now = Instant::now();
    let retired = lock(&inner.send).ack_cumulative(seq);
    if retired.is_empty() {
        fast_retransmit_on_duplicate(inner, seq, now);
        return;
    }
    {
        let mut rtt = lock(&inner.rtt);
        for slot in &retired {
            if slot.retries == 0 {
                rtt.on_sample(now.duration_since(slot.first_sent));
            }
        }
    }
    // notify_one buffers a permit, so the send worker cannot lose a wake
    // that lands between its window check and its await.
    inner.window_notify.notify_one();

    let mut start_acked = false;
    let mut end_acked = false;
    for slot in &retired {
        match slot.kind {
            FrameKind::Start => start_acked = true,
            FrameKind::End => end_acked = true,
            _ => {}
        }
    }
    if start_acked {
        let fire = {
            let mut st = lock(&inner.state);
            if st.session == SessionState::Handshaking {
                st.session = SessionState::Established;
                true
            } else {
                false
            }
        };
        if fire {
            info!("session established");
            inner.state_notify.notify_waiters();
            inner.notify_connection(true);
        }
    }
    if end_acked {
        let fire = {
            let mut st = lock(&inner.state);
            if st.session == SessionState::Closing {
                st.session = SessionState::Closed;
                true
            } else {
                false
            }
        };
        if fire {
            info!("session closed");
            inner.state_notify.notify_waiters();
            inner.ready_notify.notify_waiters();
            inner.notify_connection(false);
        }
    }
}

/// A duplicate cumulative ACK for the sequence just below the window base
/// signals a gap at the base; reissue the base frame without waiting for
/// its RTO.
fn fast_retransmit_on_duplicate(inner: &Arc<Shared>, seq: u16, now: Instant) {
    let max_retries = inner.config.max_retries;
    let wire = {
        let mut w = lock(&inner.send);
        if w.base().wrapping_sub(1) != seq {
            return;
        }
        let Some(slot) = w.slot_mut(seq.wrapping_add(1)) else {
            return;
        };
        if slot.retries >= max_retries
            || now.duration_since(slot.last_sent) < FAST_RETRANSMIT_GAP
        {
            return;
        }
        slot.retries += 1;
        slot.last_sent = now;
        debug!(seq = slot.sequence, "fast retransmit on duplicate ack");
        slot.wire.clone()
    };
    inner.stats.add(&inner.stats.packets_retransmitted, 1);
    let _ = inner.write_wire(&wire);
}

fn on_nak(inner: &Arc<Shared>, seq: u16) {
    let now = Instant::now();
    let wire = {
        let mut w = lock(&inner.send);
        match w.slot_mut(seq) {
            Some(slot) => {
                slot.retries += 1;
                slot.last_sent = now;
                Some(slot.wire.clone())
            }
            None => None,
        }
    };
    if let Some(wire) = wire {
        debug!(seq, "retransmit on nak");
        inner.stats.add(&inner.stats.packets_retransmitted, 1);
        let _ = inner.write_wire(&wire);
    }
}

async fn send_loop(inner: Arc<Shared>, mut items: mpsc::Receiver<SendItem>) {
    loop {
        let item = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            item = items.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        inner.queued_items.fetch_sub(1, Ordering::Relaxed);
        if !admit_and_write(&inner, item).await {
            // Session finished or failed; drop the remaining queue.
            continue;
        }
    }
}

/// Block until the item fits the send window, then allocate its sequence,
/// record the slot, and write it out.
async fn admit_and_write(inner: &Arc<Shared>, item: SendItem) -> bool {
    loop {
        match inner.session() {
            SessionState::Failed | SessionState::Closed | SessionState::Idle => return false,
            _ => {}
        }
        let now = Instant::now();
        let rto = lock(&inner.rtt).initial_rto();
        let admitted = {
            let mut w = lock(&inner.send);
            if w.has_space() {
                let sequence = w.next_sequence();
                let wire = frame::encode(
                    item.kind,
                    sequence,
                    &item.payload,
                    inner.config.max_payload_size,
                );
                w.push(item.kind, wire.clone(), item.payload.len(), now, rto);
                Some((sequence, wire))
            } else {
                None
            }
        };
        match admitted {
            Some((sequence, wire)) => {
                if item.kind == FrameKind::Data {
                    inner.stats.add(&inner.stats.packets_sent, 1);
                    inner
                        .stats
                        .add(&inner.stats.bytes_sent, item.payload.len() as u64);
                }
                trace!(kind = ?item.kind, seq = sequence, "frame out");
                return inner.write_wire(&wire);
            }
            None => {
                tokio::select! {
                    _ = inner.cancel.cancelled() => return false,
                    _ = inner.window_notify.notified() => {}
                    _ = sleep(WAIT_TICK) => {}
                }
            }
        }
    }
}

async fn retransmit_loop(inner: Arc<Shared>) {
    let period = inner.config.timeout_base() / 2;
    let mut tick = tokio::time::interval(period.max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        if !matches!(
            inner.session(),
            SessionState::Handshaking | SessionState::Established | SessionState::Closing
        ) {
            continue;
        }
        let now = Instant::now();
        let timeout_max = inner.config.timeout_max();
        let max_retries = inner.config.max_retries;
        let mut due: Vec<Bytes> = Vec::new();
        let mut exhausted = None;
        {
            let mut w = lock(&inner.send);
            for slot in w.iter_mut() {
                if now.duration_since(slot.last_sent) < slot.rto {
                    continue;
                }
                if slot.retries >= max_retries {
                    exhausted = Some(slot.sequence);
                    break;
                }
                slot.retries += 1;
                slot.last_sent = now;
                slot.rto = (slot.rto * 2).min(timeout_max);
                debug!(seq = slot.sequence, retries = slot.retries, "retransmit on timeout");
                due.push(slot.wire.clone());
            }
        }
        if let Some(seq) = exhausted {
            inner.stats.add(&inner.stats.timeouts, 1);
            inner.fail(Error::timeout(format!(
                "retries exhausted for sequence {seq}"
            )));
            continue;
        }
        if !due.is_empty() {
            inner.stats.add(&inner.stats.timeouts, due.len() as u64);
            inner
                .stats
                .add(&inner.stats.packets_retransmitted, due.len() as u64);
            for wire in due {
                if !inner.write_wire(&wire) {
                    break;
                }
            }
        }
    }
}

async fn heartbeat_loop(inner: Arc<Shared>) {
    let interval = inner.config.heartbeat_interval();
    let mut tick = tokio::time::interval((interval / 2).max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        if inner.session() != SessionState::Established {
            continue;
        }
        let now = Instant::now();
        let idle_send = now.duration_since(*lock(&inner.last_send));
        if idle_send >= interval {
            let seq = inner.heartbeat_seq.fetch_add(1, Ordering::Relaxed);
            trace!(seq, "heartbeat out");
            inner.write_control(FrameKind::Heartbeat, seq);
        }
        let idle_recv = now.duration_since(*lock(&inner.last_recv));
        if idle_recv > inner.config.liveness_timeout() {
            inner.fail(Error::timeout("peer unreachable"));
        }
    }
}
