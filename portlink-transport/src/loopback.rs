//! In-process paired transport with explicit fault injection.
//!
//! Two endpoints are cross-linked; every write to one side is queued,
//! delayed, run through the loss/corruption dice, and then handed to the
//! peer's data callback by a single worker task per direction. With all
//! fault knobs at zero every write is delivered exactly once, in order,
//! which makes the pair the deterministic ground truth for channel tests.

use crate::{
    DataCallback, ErrorCallback, Result, StateCallback, Transport, TransportError, TransportState,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::Deserialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
    Arc, Mutex, OnceLock, Weak,
};
use tokio::{sync::mpsc, task::JoinHandle, time::Duration};
use tracing::{debug, trace};

/// Loopback behavior knobs. Loss and corruption are independent Bernoulli
/// draws per queued unit; corruption flips a single random byte and never
/// changes length.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Fixed forwarding delay applied before each delivery.
    pub delay_ms: u64,
    /// Extra uniform random delay in `[0, jitter_max_ms]`.
    pub jitter_max_ms: u64,
    /// Per-unit drop probability, percent.
    pub loss_rate_percent: u8,
    /// Per-unit single-byte corruption probability, percent.
    pub error_rate_percent: u8,
    /// Upper bound on queued in-flight units; overflow rejects the write.
    pub max_queue_size: usize,
    /// Seed for the fault dice. `None` draws from entropy; tests pin this
    /// for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            delay_ms: 10,
            jitter_max_ms: 0,
            loss_rate_percent: 0,
            error_rate_percent: 0,
            max_queue_size: 10_000,
            seed: None,
        }
    }
}

impl LoopbackConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(&path)
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        let cfg = toml::from_str::<LoopbackConfig>(&data)
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.loss_rate_percent > 100 {
            return Err(TransportError::InvalidConfig(format!(
                "loss_rate_percent {} above 100",
                self.loss_rate_percent
            )));
        }
        if self.error_rate_percent > 100 {
            return Err(TransportError::InvalidConfig(format!(
                "error_rate_percent {} above 100",
                self.error_rate_percent
            )));
        }
        if self.max_queue_size == 0 {
            return Err(TransportError::InvalidConfig(
                "max_queue_size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Monotonic per-endpoint counters, observable while the pair runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    /// Units accepted by `write`.
    pub units_written: u64,
    /// Units handed to the peer's data callback.
    pub units_delivered: u64,
    /// Units discarded by the loss dice or forced drops.
    pub units_dropped: u64,
    /// Units delivered with an injected byte flip.
    pub units_corrupted: u64,
    /// Writes rejected because the queue was full.
    pub units_rejected: u64,
    pub bytes_written: u64,
    pub bytes_delivered: u64,
}

#[derive(Default)]
struct StatsCells {
    written: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    corrupted: AtomicU64,
    rejected: AtomicU64,
    bytes_written: AtomicU64,
    bytes_delivered: AtomicU64,
}

impl StatsCells {
    fn snapshot(&self) -> LoopbackStats {
        LoopbackStats {
            units_written: self.written.load(Ordering::Relaxed),
            units_delivered: self.delivered.load(Ordering::Relaxed),
            units_dropped: self.dropped.load(Ordering::Relaxed),
            units_corrupted: self.corrupted.load(Ordering::Relaxed),
            units_rejected: self.rejected.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.written.store(0, Ordering::Relaxed);
        self.delivered.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.corrupted.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.bytes_delivered.store(0, Ordering::Relaxed);
    }
}

struct Inner {
    label: &'static str,
    config: LoopbackConfig,
    // Live-tunable dice; reads happen on the worker per unit.
    loss_rate: AtomicU8,
    error_rate: AtomicU8,
    force_drop: AtomicBool,
    force_corrupt: AtomicBool,
    state: Mutex<TransportState>,
    data_cb: Mutex<Option<DataCallback>>,
    state_cb: Mutex<Option<StateCallback>>,
    error_cb: Mutex<Option<ErrorCallback>>,
    peer: OnceLock<Weak<Inner>>,
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: StatsCells,
}

impl Inner {
    fn set_state(&self, next: TransportState) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == next {
                return;
            }
            *state = next;
        }
        trace!(endpoint = self.label, state = %next, "loopback state");
        let cb = self
            .state_cb
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(cb) = cb {
            cb(next);
        }
    }

    fn current_state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report(&self, err: &TransportError) {
        let cb = self
            .error_cb
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(cb) = cb {
            cb(err);
        }
    }
}

/// One endpoint of an in-process loopback pair.
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl LoopbackTransport {
    /// Build a cross-linked endpoint pair. Neither side is open yet.
    pub fn pair(
        config_a: LoopbackConfig,
        config_b: LoopbackConfig,
    ) -> (LoopbackTransport, LoopbackTransport) {
        let a = Arc::new(Inner {
            label: "a",
            config: config_a,
            loss_rate: AtomicU8::new(0),
            error_rate: AtomicU8::new(0),
            force_drop: AtomicBool::new(false),
            force_corrupt: AtomicBool::new(false),
            state: Mutex::new(TransportState::Closed),
            data_cb: Mutex::new(None),
            state_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
            peer: OnceLock::new(),
            tx: Mutex::new(None),
            worker: Mutex::new(None),
            stats: StatsCells::default(),
        });
        let b = Arc::new(Inner {
            label: "b",
            config: config_b,
            loss_rate: AtomicU8::new(0),
            error_rate: AtomicU8::new(0),
            force_drop: AtomicBool::new(false),
            force_corrupt: AtomicBool::new(false),
            state: Mutex::new(TransportState::Closed),
            data_cb: Mutex::new(None),
            state_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
            peer: OnceLock::new(),
            tx: Mutex::new(None),
            worker: Mutex::new(None),
            stats: StatsCells::default(),
        });
        a.loss_rate
            .store(a.config.loss_rate_percent, Ordering::Relaxed);
        a.error_rate
            .store(a.config.error_rate_percent, Ordering::Relaxed);
        b.loss_rate
            .store(b.config.loss_rate_percent, Ordering::Relaxed);
        b.error_rate
            .store(b.config.error_rate_percent, Ordering::Relaxed);
        let _ = a.peer.set(Arc::downgrade(&b));
        let _ = b.peer.set(Arc::downgrade(&a));
        (LoopbackTransport { inner: a }, LoopbackTransport { inner: b })
    }

    /// Per-endpoint forwarding statistics.
    pub fn stats(&self) -> LoopbackStats {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    /// Force the next queued unit to be dropped.
    pub fn inject_loss(&self) {
        self.inner.force_drop.store(true, Ordering::Relaxed);
    }

    /// Force a single-byte flip on the next queued unit.
    pub fn inject_corruption(&self) {
        self.inner.force_corrupt.store(true, Ordering::Relaxed);
    }

    /// Retune the drop probability while the pair runs. Clamped to 100.
    pub fn set_loss_rate(&self, percent: u8) {
        self.inner
            .loss_rate
            .store(percent.min(100), Ordering::Relaxed);
    }

    /// Retune the corruption probability while the pair runs. Clamped to 100.
    pub fn set_error_rate(&self, percent: u8) {
        self.inner
            .error_rate
            .store(percent.min(100), Ordering::Relaxed);
    }

    fn spawn_worker(&self, mut rx: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut rng = match inner.config.seed {
                Some(seed) => SmallRng::seed_from_u64(seed),
                None => SmallRng::from_entropy(),
            };
            while let Some(mut unit) = rx.recv().await {
                let jitter = inner.config.jitter_max_ms;
                let delay = inner.config.delay_ms
                    + if jitter > 0 { rng.gen_range(0..=jitter) } else { 0 };
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                if inner.current_state() != TransportState::Open {
                    // Closed mid-flight; discard the remainder of the queue.
                    continue;
                }
                let loss = inner.loss_rate.load(Ordering::Relaxed);
                if inner.force_drop.swap(false, Ordering::Relaxed)
                    || (loss > 0 && rng.gen_range(0u8..100) < loss)
                {
                    inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(endpoint = inner.label, len = unit.len(), "loopback drop");
                    continue;
                }
                let err_rate = inner.error_rate.load(Ordering::Relaxed);
                if !unit.is_empty()
                    && (inner.force_corrupt.swap(false, Ordering::Relaxed)
                        || (err_rate > 0 && rng.gen_range(0u8..100) < err_rate))
                {
                    let idx = rng.gen_range(0..unit.len());
                    unit[idx] ^= 1u8 << rng.gen_range(0..8);
                    inner.stats.corrupted.fetch_add(1, Ordering::Relaxed);
                    debug!(endpoint = inner.label, idx, "loopback corrupt");
                }
                let Some(peer) = inner.peer.get().and_then(Weak::upgrade) else {
                    break;
                };
                if peer.current_state() != TransportState::Open {
                    continue;
                }
                let cb = peer
                    .data_cb
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(cb) = cb {
                    cb(&unit);
                    inner.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    inner
                        .stats
                        .bytes_delivered
                        .fetch_add(unit.len() as u64, Ordering::Relaxed);
                }
            }
        })
    }
}

impl Transport for LoopbackTransport {
    fn open(&self) -> Result<()> {
        {
            let state = self.inner.current_state();
            if matches!(state, TransportState::Open | TransportState::Opening) {
                return Err(TransportError::AlreadyOpen);
            }
        }
        self.inner.config.validate()?;
        self.inner.set_state(TransportState::Opening);
        let (tx, rx) = mpsc::channel(self.inner.config.max_queue_size);
        *self.inner.tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        let handle = self.spawn_worker(rx);
        let old = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(old) = old {
            old.abort();
        }
        self.inner.set_state(TransportState::Open);
        Ok(())
    }

    fn close(&self) {
        if self.inner.current_state() == TransportState::Closed {
            return;
        }
        self.inner.set_state(TransportState::Closing);
        // Dropping the sender lets the worker drain and exit on its own.
        *self.inner.tx.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.inner.set_state(TransportState::Closed);
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.inner.current_state() != TransportState::Open {
            return Err(TransportError::NotOpen);
        }
        let tx = self
            .inner
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(tx) = tx else {
            return Err(TransportError::NotOpen);
        };
        match tx.try_send(bytes.to_vec()) {
            Ok(()) => {
                self.inner.stats.written.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .stats
                    .bytes_written
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.stats.rejected.fetch_add(1, Ordering::Relaxed);
                let err = TransportError::WriteFailed("loopback queue full".into());
                self.inner.report(&err);
                Err(err)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::NotOpen),
        }
    }

    fn set_data_callback(&self, cb: Option<DataCallback>) {
        *self.inner.data_cb.lock().unwrap_or_else(|e| e.into_inner()) = cb;
    }

    fn set_state_callback(&self, cb: Option<StateCallback>) {
        *self
            .inner
            .state_cb
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = cb;
    }

    fn set_error_callback(&self, cb: Option<ErrorCallback>) {
        *self
            .inner
            .error_cb
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = cb;
    }

    fn state(&self) -> TransportState {
        self.inner.current_state()
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}
