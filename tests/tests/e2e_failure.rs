// Failure-path scenarios: a peer that vanishes mid-stream, a handshake
// whose acknowledgments never arrive, and re-initialization afterwards.

use portlink_core::{ChannelConfig, Error};
use portlink_integration_tests::{init_tracing, link, quiet_loopback, random_payload, TestResult};
use portlink_stream::{ReliableChannel, SessionState};
use portlink_transport::{LoopbackConfig, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

async fn wait_for_state(chan: &ReliableChannel, want: SessionState, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if chan.state() == want {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    chan.state() == want
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sender_fails_when_peer_vanishes_mid_stream() -> TestResult {
    init_tracing();
    const TOTAL: usize = 1_048_576;
    const RECEIVED_BEFORE_VANISHING: usize = 65_536;
    let cfg = ChannelConfig {
        window_size: 4,
        max_retries: 3,
        timeout_base_ms: 50,
        timeout_max_ms: 200,
        heartbeat_interval_ms: 60_000,
        ..Default::default()
    };
    let l = link(
        cfg.clone(),
        cfg.clone(),
        quiet_loopback(0xF0),
        quiet_loopback(0xF1),
    )?;

    assert!(l.a.connect().await);

    let payload = random_payload(4, TOTAL);
    let sender = {
        let a = Arc::clone(&l.a);
        tokio::spawn(async move { a.send(&payload).await })
    };

    // Consume 64 KiB, then pull the plug on the receiving side.
    let mut seen = 0usize;
    while seen < RECEIVED_BEFORE_VANISHING {
        let chunk = l
            .b
            .receive(Duration::from_secs(5))
            .await
            .expect("chunk before vanish");
        seen += chunk.len();
    }
    tracing::info!(received = seen, "receiver vanishing now");
    l.tb.close();
    l.b.shutdown().await;

    // Retries exhaust within max_retries * timeout_max, plus slack.
    let fail_budget = Duration::from_millis(
        cfg.timeout_max_ms * u64::from(cfg.max_retries) + 2_000,
    );
    assert!(
        wait_for_state(&l.a, SessionState::Failed, fail_budget).await,
        "sender never failed after peer vanished"
    );
    assert!(!sender.await?, "send must report failure");
    assert!(
        matches!(l.a.last_error(), Some(Error::Timeout(_))),
        "failure reason should be a timeout, got {:?}",
        l.a.last_error()
    );

    l.a.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn handshake_times_out_when_acks_are_dropped() -> TestResult {
    init_tracing();
    let cfg = ChannelConfig {
        timeout_base_ms: 100,
        timeout_max_ms: 400,
        heartbeat_interval_ms: 60_000,
        ..Default::default()
    };
    // The responder's outbound direction eats every unit: START arrives,
    // its ACK never does.
    let ack_eater = LoopbackConfig {
        delay_ms: 0,
        loss_rate_percent: 100,
        seed: Some(0xF2),
        ..Default::default()
    };
    let l = link(
        cfg.clone(),
        cfg.clone(),
        quiet_loopback(0xF3),
        ack_eater,
    )?;

    let started = Instant::now();
    assert!(!l.a.connect().await, "connect must fail without an ACK");
    assert!(
        started.elapsed() < Duration::from_millis(cfg.timeout_max_ms + 500),
        "connect overran timeout_max"
    );
    assert_eq!(l.a.state(), SessionState::Failed);
    assert!(matches!(l.a.last_error(), Some(Error::Timeout(_))));

    // The responder side did see the START and established.
    assert!(l.b.is_connected());

    // Recovery without process restart: stop the failed channels, heal the
    // link, and bind fresh channels to the same open transports.
    l.a.shutdown().await;
    l.b.shutdown().await;
    l.tb.set_loss_rate(0);

    let a2 = ReliableChannel::initialize(
        Arc::clone(&l.ta) as Arc<dyn Transport>,
        cfg.clone(),
    )?;
    let b2 = ReliableChannel::initialize(Arc::clone(&l.tb) as Arc<dyn Transport>, cfg)?;
    assert!(a2.connect().await, "reconnect after failure must succeed");
    assert!(a2.send(b"alive again").await);
    let got = b2.receive(Duration::from_secs(2)).await.expect("payload");
    assert_eq!(&got[..], b"alive again");

    a2.shutdown().await;
    b2.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn disconnect_is_idempotent_and_closes_peer() -> TestResult {
    init_tracing();
    let cfg = ChannelConfig {
        heartbeat_interval_ms: 60_000,
        ..Default::default()
    };
    let l = link(
        cfg.clone(),
        cfg,
        quiet_loopback(0xF4),
        quiet_loopback(0xF5),
    )?;

    assert!(l.a.connect().await);
    assert!(l.a.send(b"last words").await);
    let got = l.b.receive(Duration::from_secs(2)).await.expect("payload");
    assert_eq!(&got[..], b"last words");

    assert!(l.a.disconnect().await, "first disconnect");
    assert!(l.a.disconnect().await, "second disconnect is a no-op");
    assert_eq!(l.a.state(), SessionState::Closed);

    // The peer saw END: its session closed and receive drains to None.
    assert!(wait_for_state(&l.b, SessionState::Closed, Duration::from_secs(2)).await);
    assert!(l.b.receive(Duration::from_millis(100)).await.is_none());

    l.b.shutdown().await;
    Ok(())
}
