//! Closed sessions give their descriptors back.

mod common;

#[cfg(target_os = "linux")]
#[test]
fn test_descriptor_count_returns_to_baseline() {
    use common::*;
    use echo_dispatch::config::StrategyKind;

    let server = start_server(&loopback_config(StrategyKind::PerThread, 0));

    // Warm up once so lazily opened descriptors are part of the baseline
    assert_eq!(echo_once(server.addr, b"warmup"), b"warmup");
    assert!(server.workers.wait_idle(TIMEOUT));
    let baseline = open_descriptors();

    for i in 0..50 {
        let payload = format!("cycle-{i}").into_bytes();
        assert_eq!(echo_once(server.addr, &payload), payload);
    }

    assert!(server.workers.wait_idle(TIMEOUT));
    assert!(
        eventually(TIMEOUT, || open_descriptors() <= baseline),
        "descriptors leaked: baseline {baseline}, now {}",
        open_descriptors()
    );
}
