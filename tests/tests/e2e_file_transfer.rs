// File streaming: START metadata, chunked DATA, END, progress reporting.

use portlink_core::ChannelConfig;
use portlink_integration_tests::{init_tracing, link, quiet_loopback, random_payload, TestResult};
use portlink_stream::ProgressCallback;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn file_config() -> ChannelConfig {
    ChannelConfig {
        window_size: 8,
        timeout_base_ms: 200,
        timeout_max_ms: 2_000,
        heartbeat_interval_ms: 60_000,
        ..Default::default()
    }
}

fn progress_recorder() -> (ProgressCallback, Arc<Mutex<Vec<(u64, u64)>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let cb: ProgressCallback = Arc::new(move |done, total| {
        sink.lock().expect("progress log poisoned").push((done, total));
    });
    (cb, log)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_roundtrip_with_progress() -> TestResult {
    init_tracing();
    const SIZE: usize = 65_536;
    let l = link(
        file_config(),
        file_config(),
        quiet_loopback(0xB0),
        quiet_loopback(0xB1),
    )?;

    let dir = tempfile::tempdir()?;
    let src = dir.path().join("outbound.bin");
    let dst = dir.path().join("inbound.bin");
    let content = random_payload(5, SIZE);
    std::fs::write(&src, &content)?;

    let (send_cb, send_log) = progress_recorder();
    let (recv_cb, recv_log) = progress_recorder();

    let receiver = {
        let b = Arc::clone(&l.b);
        let dst = dst.clone();
        tokio::spawn(async move { b.receive_file(&dst, Some(recv_cb)).await })
    };
    assert!(
        l.a.send_file(&src, Some(send_cb)).await,
        "send_file failed"
    );
    assert!(receiver.await?, "receive_file failed");

    let written = std::fs::read(&dst)?;
    assert_eq!(written, content, "file content mismatch after transfer");

    for log in [send_log, recv_log] {
        let log = log.lock().expect("progress log poisoned");
        assert!(!log.is_empty(), "progress never fired");
        assert!(log.windows(2).all(|w| w[0].0 <= w[1].0), "progress regressed");
        let last = log.last().copied().expect("empty progress log");
        assert_eq!(last, (SIZE as u64, SIZE as u64));
    }

    // The transfer closes the session on both sides.
    assert!(!l.a.is_connected());
    l.b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn empty_file_roundtrip() -> TestResult {
    init_tracing();
    let l = link(
        file_config(),
        file_config(),
        quiet_loopback(0xB2),
        quiet_loopback(0xB3),
    )?;

    let dir = tempfile::tempdir()?;
    let src = dir.path().join("empty.bin");
    let dst = dir.path().join("empty-copy.bin");
    std::fs::write(&src, b"")?;

    let receiver = {
        let b = Arc::clone(&l.b);
        let dst = dst.clone();
        tokio::spawn(async move { b.receive_file(&dst, None).await })
    };
    assert!(l.a.send_file(&src, None).await);
    assert!(receiver.await?);
    assert_eq!(std::fs::metadata(&dst)?.len(), 0);

    l.b.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_survives_a_lossy_link() -> TestResult {
    init_tracing();
    const SIZE: usize = 32_768;
    let cfg = ChannelConfig {
        window_size: 8,
        max_retries: 10,
        timeout_base_ms: 60,
        timeout_max_ms: 2_000,
        heartbeat_interval_ms: 60_000,
        ..Default::default()
    };
    let lossy = |seed| portlink_transport::LoopbackConfig {
        delay_ms: 0,
        loss_rate_percent: 8,
        seed: Some(seed),
        ..Default::default()
    };
    let l = link(cfg.clone(), cfg, lossy(0xB4), lossy(0xB5))?;

    let dir = tempfile::tempdir()?;
    let src = dir.path().join("lossy-src.bin");
    let dst = dir.path().join("lossy-dst.bin");
    let content = random_payload(6, SIZE);
    std::fs::write(&src, &content)?;

    let receiver = {
        let b = Arc::clone(&l.b);
        let dst = dst.clone();
        tokio::spawn(async move { b.receive_file(&dst, None).await })
    };
    assert!(l.a.send_file(&src, None).await, "send_file under loss failed");
    assert!(receiver.await?, "receive_file under loss failed");
    assert_eq!(std::fs::read(&dst)?, content);
    assert!(l.a.get_stats().packets_retransmitted > 0);

    l.b.shutdown().await;
    Ok(())
}
