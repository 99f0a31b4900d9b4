// Sequence wraparound: force the sender's sequence space across
// 65535 -> 0 mid-session and verify ordering and accounting survive.

use portlink_core::ChannelConfig;
use portlink_integration_tests::{init_tracing, link, quiet_loopback, TestResult};
use std::time::Duration;

#[tokio::test]
async fn twenty_payloads_across_the_wrap_point() -> TestResult {
    init_tracing();
    let cfg_a = ChannelConfig {
        window_size: 8,
        initial_sequence: 65_530,
        heartbeat_interval_ms: 60_000,
        ..Default::default()
    };
    let cfg_b = ChannelConfig {
        window_size: 8,
        heartbeat_interval_ms: 60_000,
        ..Default::default()
    };
    let l = link(cfg_a, cfg_b, quiet_loopback(0xA0), quiet_loopback(0xA1))?;

    assert!(l.a.connect().await);
    // Handshake consumed 65530; the peer expects 65531 next.
    assert_eq!(l.b.remote_sequence(), 65_531);

    for i in 0..20u8 {
        assert!(l.a.send(&[i]).await, "send {i} failed");
    }
    let mut delivered = Vec::new();
    for _ in 0..20 {
        let chunk = l.b.receive(Duration::from_secs(2)).await.expect("payload");
        assert_eq!(chunk.len(), 1);
        delivered.push(chunk[0]);
    }
    assert_eq!(delivered, (0..20).collect::<Vec<u8>>());

    let stats = l.a.get_stats();
    assert_eq!(stats.packets_sent, 20);
    assert_eq!(stats.packets_retransmitted, 0);
    // 65530 (start) + 20 payloads, wrapped past 65535.
    assert_eq!(l.a.local_sequence(), 15);
    assert_eq!(l.b.remote_sequence(), 15);

    l.a.shutdown().await;
    l.b.shutdown().await;
    Ok(())
}
