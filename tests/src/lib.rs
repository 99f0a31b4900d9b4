#![forbid(unsafe_code)]

//! Shared harness for the end-to-end loopback scenarios.

use portlink_core::ChannelConfig;
use portlink_stream::ReliableChannel;
use portlink_transport::{LoopbackConfig, LoopbackTransport, Transport};
use rand::{rngs::SmallRng, RngCore, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

pub type TestResult<T = ()> = anyhow::Result<T>;

/// One fully wired link: two open loopback endpoints with a channel bound
/// to each. `a` writes through `ta`, `b` through `tb`.
pub struct TestLink {
    pub a: Arc<ReliableChannel>,
    pub b: Arc<ReliableChannel>,
    pub ta: Arc<LoopbackTransport>,
    pub tb: Arc<LoopbackTransport>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .try_init();
}

/// Wire up a channel pair over a loopback pair. Transports are opened and
/// both channels initialized; no handshake has happened yet.
pub fn link(
    cfg_a: ChannelConfig,
    cfg_b: ChannelConfig,
    loop_a: LoopbackConfig,
    loop_b: LoopbackConfig,
) -> TestResult<TestLink> {
    let (ta, tb) = LoopbackTransport::pair(loop_a, loop_b);
    let (ta, tb) = (Arc::new(ta), Arc::new(tb));
    ta.open().map_err(|e| anyhow::anyhow!("open a: {e}"))?;
    tb.open().map_err(|e| anyhow::anyhow!("open b: {e}"))?;
    let a = Arc::new(ReliableChannel::initialize(
        Arc::clone(&ta) as Arc<dyn Transport>,
        cfg_a,
    )?);
    let b = Arc::new(ReliableChannel::initialize(
        Arc::clone(&tb) as Arc<dyn Transport>,
        cfg_b,
    )?);
    Ok(TestLink { a, b, ta, tb })
}

/// Fast, fault-free loopback with a pinned fault-dice seed.
pub fn quiet_loopback(seed: u64) -> LoopbackConfig {
    LoopbackConfig {
        delay_ms: 0,
        seed: Some(seed),
        ..Default::default()
    }
}

/// Deterministic pseudo-random payload.
pub fn random_payload(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

/// Drain `total` bytes from a channel, chunk by chunk.
pub async fn receive_exactly(
    chan: &ReliableChannel,
    total: usize,
    per_chunk_timeout: Duration,
) -> TestResult<Vec<u8>> {
    let mut collected = Vec::with_capacity(total);
    while collected.len() < total {
        match chan.receive(per_chunk_timeout).await {
            Some(chunk) => collected.extend_from_slice(&chunk),
            None => anyhow::bail!(
                "stream ended early: {} of {total} bytes received",
                collected.len()
            ),
        }
    }
    Ok(collected)
}
