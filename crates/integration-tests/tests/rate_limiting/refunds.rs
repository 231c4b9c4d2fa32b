use std::time::Duration;

use indoc::indoc;
use integration_tests::{DEFAULT_CONFIG, TestServer};

#[tokio::test]
async fn server_errors_are_refunded() {
    let server = TestServer::builder()
        .api_key("key-a", 1)
        .user_limit(1, 0, 2, 0)
        .build(DEFAULT_CONFIG)
        .await;

    for _ in 0..5 {
        let response = server.client.get_with_key("/v1/upstream", "key-a").await;
        assert_eq!(response.status(), 502);

        server.wait_for_counter("hour", "default", "u:1", 0).await;
    }

    let response = server.client.get_with_key("/v1/blocks", "key-a").await;

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-ratelimit-remaining-hour"], "1");
}

#[tokio::test]
async fn successes_and_client_errors_are_billed() {
    let server = TestServer::builder()
        .api_key("key-a", 1)
        .user_limit(1, 0, 100, 0)
        .build(DEFAULT_CONFIG)
        .await;

    assert_eq!(server.client.get_with_key("/v1/blocks", "key-a").await.status(), 200);
    assert_eq!(server.client.get_with_key("/v1/missing", "key-a").await.status(), 404);

    // give a wrongly spawned refund the chance to land
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.counter("hour", "default", "u:1").await, Some(2));
}

#[tokio::test]
async fn refund_is_capped() {
    let config = indoc! {r#"
        [rate_limits]
        enabled = true
        max_refundable_weight = 4

        [sync.maintenance]
        enabled = false
    "#};

    let server = TestServer::builder()
        .api_key("key-a", 1)
        .user_limit(1, 0, 100, 0)
        .weight("/v1/upstream", 10, "default")
        .build(config)
        .await;

    let response = server.client.get_with_key("/v1/upstream", "key-a").await;
    assert_eq!(response.status(), 502);

    server.wait_for_counter("hour", "default", "u:1", 6).await;
}
