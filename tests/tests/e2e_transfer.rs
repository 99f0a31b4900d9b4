// End-to-end transfer scenarios over the loopback bench: clean bulk
// transfer, payload boundary cases, loss recovery, corruption recovery.

use portlink_core::ChannelConfig;
use portlink_integration_tests::{
    init_tracing, link, quiet_loopback, random_payload, receive_exactly, TestResult,
};
use portlink_transport::LoopbackConfig;
use std::sync::Arc;
use std::time::Duration;

fn bulk_config(window_size: u16) -> ChannelConfig {
    ChannelConfig {
        window_size,
        timeout_base_ms: 500,
        timeout_max_ms: 2000,
        // Long heartbeat so liveness never interferes with throughput runs.
        heartbeat_interval_ms: 60_000,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clean_transfer_one_mebibyte() -> TestResult {
    init_tracing();
    const TOTAL: usize = 1_048_576;
    let l = link(
        bulk_config(4),
        bulk_config(4),
        quiet_loopback(0xC0),
        quiet_loopback(0xC1),
    )?;

    let payload = random_payload(1, TOTAL);
    let expected = payload.clone();

    let receiver = {
        let b = Arc::clone(&l.b);
        tokio::spawn(async move { receive_exactly(&b, TOTAL, Duration::from_secs(10)).await })
    };

    assert!(l.a.connect().await, "handshake failed");
    assert!(l.a.send(&payload).await, "send failed");

    let got = receiver.await??;
    tracing::info!(bytes = got.len(), "clean transfer drained");
    assert_eq!(got, expected, "delivered bytes differ from sent bytes");

    let sent = l.a.get_stats();
    let recv = l.b.get_stats();
    assert_eq!(sent.packets_retransmitted, 0, "clean link must not retransmit");
    assert_eq!(sent.bytes_sent, TOTAL as u64);
    assert_eq!(recv.bytes_received, TOTAL as u64);
    assert_eq!(sent.packets_sent, (TOTAL / 1024) as u64);

    l.a.shutdown().await;
    l.b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn boundary_payloads_roundtrip() -> TestResult {
    init_tracing();
    let l = link(
        bulk_config(4),
        bulk_config(4),
        quiet_loopback(0xC2),
        quiet_loopback(0xC3),
    )?;
    assert!(l.a.connect().await);

    // Empty payload DATA frame.
    assert!(l.a.send(&[]).await);
    let empty = l.b.receive(Duration::from_secs(2)).await.expect("empty frame");
    assert!(empty.is_empty());

    // Single byte.
    assert!(l.a.send(&[0x42]).await);
    let one = l.b.receive(Duration::from_secs(2)).await.expect("one byte");
    assert_eq!(&one[..], &[0x42]);

    // Exactly max payload: one frame, no split.
    let max = l.a.config().max_payload_size;
    let full = random_payload(7, max);
    assert!(l.a.send(&full).await);
    let got = l.b.receive(Duration::from_secs(2)).await.expect("max frame");
    assert_eq!(&got[..], &full[..]);

    // One byte past max payload: two frames, reassembled by the caller.
    let over = random_payload(8, max + 1);
    assert!(l.a.send(&over).await);
    let got = receive_exactly(&l.b, max + 1, Duration::from_secs(2)).await?;
    assert_eq!(got, over);

    let stats = l.a.get_stats();
    assert_eq!(stats.packets_sent, 5);

    l.a.shutdown().await;
    l.b.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lossy_link_recovers_bit_exact() -> TestResult {
    init_tracing();
    const TOTAL: usize = 102_400;
    let cfg = ChannelConfig {
        window_size: 16,
        max_retries: 10,
        timeout_base_ms: 60,
        timeout_max_ms: 2000,
        heartbeat_interval_ms: 60_000,
        ..Default::default()
    };
    let lossy = |seed| LoopbackConfig {
        delay_ms: 0,
        loss_rate_percent: 10,
        seed: Some(seed),
        ..Default::default()
    };
    let l = link(cfg.clone(), cfg, lossy(0xD0), lossy(0xD1))?;

    let payload = random_payload(2, TOTAL);
    let expected = payload.clone();
    let receiver = {
        let b = Arc::clone(&l.b);
        tokio::spawn(async move { receive_exactly(&b, TOTAL, Duration::from_secs(20)).await })
    };

    assert!(l.a.connect().await, "handshake failed under loss");
    assert!(l.a.send(&payload).await, "send failed under loss");

    let got = receiver.await??;
    tracing::info!(retransmitted = l.a.get_stats().packets_retransmitted, "lossy transfer drained");
    assert_eq!(got, expected, "loss recovery corrupted the stream");
    assert!(
        l.a.get_stats().packets_retransmitted > 0,
        "a 10% lossy link must retransmit"
    );

    l.a.shutdown().await;
    l.b.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn corrupting_link_recovers_bit_exact() -> TestResult {
    init_tracing();
    const TOTAL: usize = 262_144;
    let cfg = ChannelConfig {
        window_size: 16,
        max_retries: 10,
        timeout_base_ms: 60,
        timeout_max_ms: 2000,
        heartbeat_interval_ms: 60_000,
        ..Default::default()
    };
    let noisy = |seed| LoopbackConfig {
        delay_ms: 0,
        error_rate_percent: 5,
        seed: Some(seed),
        ..Default::default()
    };
    let l = link(cfg.clone(), cfg, noisy(0xE0), noisy(0xE1))?;

    let payload = random_payload(3, TOTAL);
    let expected = payload.clone();
    let receiver = {
        let b = Arc::clone(&l.b);
        tokio::spawn(async move { receive_exactly(&b, TOTAL, Duration::from_secs(20)).await })
    };

    assert!(l.a.connect().await, "handshake failed under corruption");
    assert!(l.a.send(&payload).await, "send failed under corruption");

    let got = receiver.await??;
    tracing::info!(invalid = l.b.get_stats().packets_invalid, "corrupted transfer drained");
    assert_eq!(got, expected, "corruption leaked into delivered bytes");
    assert!(
        l.b.get_stats().packets_invalid > 0,
        "5% corruption must be caught by the integrity check"
    );
    assert!(l.a.get_stats().packets_retransmitted > 0);

    l.a.shutdown().await;
    l.b.shutdown().await;
    Ok(())
}
