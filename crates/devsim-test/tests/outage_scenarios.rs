//! Simulated outages seen from the outside

use std::time::Duration;

use devsim_runtime::{LinkState, OFFLINE_ERROR};
use devsim_test::{DeviceHarness, HarnessConfig};

/// One outage at start-up, then no further failure rolls for an hour
fn single_outage(name: &str, outage: Duration) -> HarnessConfig {
    HarnessConfig::new(name)
        .failures(1.0, outage)
        .heartbeat(Duration::from_secs(3600))
}

#[tokio::test(start_paused = true)]
async fn test_outage_blocks_publishing_until_recovery() {
    let config = single_outage("out-dev", Duration::from_secs(20));
    let mut harness = DeviceHarness::new(&config).unwrap();
    harness.start();
    tokio::time::sleep(Duration::from_secs(2)).await;

    let link = harness.device().link_status();
    assert!(link.paused);
    assert_eq!(link.state, LinkState::Paused);
    assert_eq!(link.outages, 1);
    assert_eq!(harness.device().status().status, "online");

    let result = harness.device().publish("during").await;
    assert!(!result.published);
    assert_eq!(result.error.as_deref(), Some(OFFLINE_ERROR));
    assert_eq!(harness.broker().published_count(), 0);
    assert_eq!(harness.device().metrics().sent, 0);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(harness.wait_for_link(LinkState::Active, Duration::from_secs(5)).await);
    assert!(!harness.device().link_status().paused);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The heartbeat that rolled the outage goes out once the link is back
    assert_eq!(harness.broker().published_count(), 1);
    assert_eq!(harness.device().metrics().sent, 1);

    let result = harness.device().publish("after").await;
    assert!(result.published, "{:?}", result);
    assert_eq!(harness.broker().published_count(), 2);
    assert_eq!(harness.device().metrics().sent, 2);
    assert_eq!(harness.device().link_status().outages, 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_inbound_traffic_is_missed_while_paused() {
    let config = single_outage("rx-out", Duration::from_secs(10));
    let mut harness = DeviceHarness::new(&config).unwrap();
    harness.start();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(harness.device().link_status().paused);

    harness.broker().publish_external("mqtt/peer", b"while down".to_vec()).unwrap();
    assert_eq!(harness.device().metrics().received, 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(harness.wait_for_link(LinkState::Active, Duration::from_secs(5)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let before = harness.device().metrics().received;

    harness.broker().publish_external("mqtt/peer", b"back up".to_vec()).unwrap();
    assert_eq!(harness.device().metrics().received, before + 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_each_outage_ends_in_a_new_session() {
    // Rolls every heartbeat: down for 5s, back within a poll, up for 10s
    let config = HarnessConfig::new("flappy")
        .failures(1.0, Duration::from_secs(5))
        .heartbeat(Duration::from_secs(10));
    let mut harness = DeviceHarness::new(&config).unwrap();
    harness.start();

    tokio::time::sleep(Duration::from_secs(60)).await;

    let link = harness.device().link_status();
    assert!(link.outages >= 4, "outages {}", link.outages);
    // Each recovered tick still gets its heartbeat out
    let sent = harness.device().metrics().sent;
    assert!(sent >= 3, "sent {}", sent);
    assert!(
        harness.broker().connection_count() >= 3,
        "connections {}",
        harness.broker().connection_count()
    );
    assert!(harness.broker().live_sessions() <= 1);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_probability_never_pauses() {
    let config = HarnessConfig::new("steady").failures(0.0, Duration::from_secs(30));
    let mut harness = DeviceHarness::new(&config).unwrap();
    harness.start_active().await.unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;

    let link = harness.device().link_status();
    assert_eq!(link.outages, 0);
    assert!(!link.paused);
    assert_eq!(link.state, LinkState::Active);
    assert_eq!(harness.broker().connection_count(), 1);

    harness.shutdown().await;
}
