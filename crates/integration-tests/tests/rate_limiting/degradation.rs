use std::time::Duration;

use indoc::indoc;
use integration_tests::{DEFAULT_CONFIG, TestServer};

const FAST_PROBES: &str = indoc! {r#"
    [rate_limits]
    enabled = true

    [rate_limits.health]
    interval = "50ms"
    timeout = "20ms"

    [rate_limits.fallback]
    rate = 1
    burst = 2

    [sync.maintenance]
    enabled = false
"#};

#[tokio::test]
async fn failed_round_trip_admits_uncounted() {
    let server = TestServer::builder()
        .api_key("key-a", 1)
        .user_limit(1, 0, 1, 0)
        .build(DEFAULT_CONFIG)
        .await;

    server.store.set_failing_increments(true);

    for _ in 0..3 {
        let response = server.client.get_with_key("/v1/blocks", "key-a").await;

        assert_eq!(response.status(), 200);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }

    assert!(server.store.is_empty());
    assert!(server.manager.health().is_healthy());

    server.store.set_failing_increments(false);

    let response = server.client.get_with_key("/v1/blocks", "key-a").await;
    assert_eq!(response.headers()["x-ratelimit-remaining-hour"], "0");
}

#[tokio::test]
async fn unreachable_store_switches_to_the_local_limiter() {
    let server = TestServer::builder()
        .api_key("key-a", 1)
        .build(FAST_PROBES)
        .await;

    server.store.set_down(true);
    server.wait_for_health("degraded").await;

    let mut statuses = Vec::new();

    for _ in 0..2 {
        let response = server.client.get_with_key("/v1/blocks", "key-a").await;

        assert_eq!(response.headers()["x-ratelimit-limit"], "1");
        assert!(response.headers().get("x-ratelimit-window").is_none());

        statuses.push(response.status().as_u16());
    }

    let blocked = server.client.get_with_key("/v1/blocks", "key-a").await;

    assert_eq!(statuses, [200, 200]);
    assert_eq!(blocked.status(), 429);
    assert_eq!(blocked.headers()["x-ratelimit-limit"], "1");
    assert!(blocked.headers().get("retry-after").is_some());
    assert!(blocked.headers().get("x-ratelimit-remaining").is_none());

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let refilled = server.client.get_with_key("/v1/blocks", "key-a").await;
    assert_eq!(refilled.status(), 200);

    server.store.set_down(false);
    server.wait_for_health("healthy").await;

    let response = server.client.get_with_key("/v1/blocks", "key-a").await;

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-ratelimit-window"], "second");
}
