use integration_tests::{DEFAULT_CONFIG, TestServer};

fn header<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).map(|value| value.to_str().unwrap())
}

#[tokio::test]
async fn hour_limit_blocks_and_keeps_counting() {
    let server = TestServer::builder()
        .api_key("key-a", 1)
        .user_limit(1, 1000, 3, 0)
        .build(DEFAULT_CONFIG)
        .await;

    let mut statuses = Vec::new();

    for _ in 0..3 {
        let response = server.client.get_with_key("/v1/blocks", "key-a").await;
        statuses.push(response.status().as_u16());
    }

    let blocked = server.client.get_with_key("/v1/blocks", "key-a").await;

    assert_eq!(statuses, [200, 200, 200]);
    assert_eq!(blocked.status(), 429);
    assert_eq!(header(&blocked, "x-ratelimit-window"), Some("hour"));
    assert_eq!(header(&blocked, "x-ratelimit-limit"), Some("3"));
    assert_eq!(header(&blocked, "x-ratelimit-remaining"), Some("0"));
    assert_eq!(header(&blocked, "x-ratelimit-limit-second"), Some("1000"));
    assert_eq!(header(&blocked, "retry-after"), header(&blocked, "x-ratelimit-reset"));
    assert!(header(&blocked, "x-ratelimit-limit-month").is_none());

    let body = blocked.text().await.unwrap();
    assert_eq!(body, "Too Many Requests");

    // blocked requests are billed
    assert_eq!(server.counter("hour", "default", "u:1").await, Some(4));
}

#[tokio::test]
async fn second_limit_does_not_stop_the_hour_count() {
    let server = TestServer::builder()
        .api_key("key-a", 1)
        .user_limit(1, 2, 1000, 0)
        .build(DEFAULT_CONFIG)
        .await;

    let mut sent = 0;
    let mut blocked = None;

    while sent < 20 {
        let response = server.client.get_with_key("/v1/blocks", "key-a").await;
        sent += 1;

        if response.status() == 429 {
            blocked = Some(response);
            break;
        }
    }

    let blocked = blocked.unwrap();

    assert_eq!(header(&blocked, "x-ratelimit-window"), Some("second"));
    assert_eq!(header(&blocked, "retry-after"), Some("1"));
    assert_eq!(header(&blocked, "x-ratelimit-limit-hour"), Some("1000"));
    assert_eq!(server.counter("hour", "default", "u:1").await, Some(sent));
}

#[tokio::test]
async fn users_do_not_share_counters() {
    let server = TestServer::builder()
        .api_key("key-a", 1)
        .api_key("key-b", 2)
        .user_limit(1, 0, 1, 0)
        .build(DEFAULT_CONFIG)
        .await;

    server.client.get_with_key("/v1/blocks", "key-a").await;

    let blocked = server.client.get_with_key("/v1/blocks", "key-a").await;
    assert_eq!(blocked.status(), 429);

    // user 2 falls back to the free tier
    let other = server.client.get_with_key("/v1/blocks", "key-b").await;

    assert_eq!(other.status(), 200);
    assert_eq!(header(&other, "x-ratelimit-limit-hour"), Some("1000"));
    assert_eq!(header(&other, "x-ratelimit-remaining-hour"), Some("999"));
}

#[tokio::test]
async fn weighted_route_drains_its_own_bucket() {
    let server = TestServer::builder()
        .api_key("key-a", 1)
        .user_limit(1, 0, 25, 0)
        .weight("/v1/export", 10, "export")
        .build(DEFAULT_CONFIG)
        .await;

    let mut remaining = Vec::new();

    for _ in 0..3 {
        let response = server.client.get_with_key("/v1/export", "key-a").await;
        remaining.push((
            response.status().as_u16(),
            header(&response, "x-ratelimit-remaining-hour").map(str::to_string),
        ));
    }

    assert_eq!(
        remaining,
        [
            (200, Some("15".to_string())),
            (200, Some("5".to_string())),
            (429, Some("0".to_string())),
        ]
    );

    assert_eq!(server.counter("hour", "export", "u:1").await, Some(30));

    let cheap = server.client.get_with_key("/v1/blocks", "key-a").await;

    assert_eq!(cheap.status(), 200);
    assert_eq!(header(&cheap, "x-ratelimit-remaining-hour"), Some("24"));
}

#[tokio::test]
async fn unlimited_tier_sends_no_headers() {
    let server = TestServer::builder()
        .api_key("key-a", 1)
        .user_limit(1, 0, 0, 0)
        .build(DEFAULT_CONFIG)
        .await;

    for _ in 0..20 {
        let response = server.client.get_with_key("/v1/blocks", "key-a").await;

        assert_eq!(response.status(), 200);
        assert!(header(&response, "x-ratelimit-limit").is_none());
        assert!(header(&response, "x-ratelimit-limit-day").is_none());
    }
}

#[tokio::test]
async fn aliases_mirror_the_closest_window() {
    let server = TestServer::builder()
        .api_key("key-a", 1)
        .api_key("key-b", 2)
        .user_limit(1, 10, 0, 0)
        .user_limit(2, 0, 500, 20_000)
        .build(DEFAULT_CONFIG)
        .await;

    let second_only = server.client.get_with_key("/v1/blocks", "key-a").await;

    assert_eq!(header(&second_only, "x-ratelimit-window"), Some("second"));
    assert_eq!(header(&second_only, "x-ratelimit-limit-minute"), Some("10"));
    assert_eq!(header(&second_only, "x-ratelimit-limit-day"), Some("10"));
    assert!(header(&second_only, "x-ratelimit-limit-hour").is_none());

    let hour_and_month = server.client.get_with_key("/v1/blocks", "key-b").await;

    assert_eq!(header(&hour_and_month, "x-ratelimit-window"), Some("hour"));
    assert_eq!(header(&hour_and_month, "x-ratelimit-limit-minute"), Some("500"));
    assert_eq!(header(&hour_and_month, "x-ratelimit-limit-day"), Some("20000"));
    assert_eq!(header(&hour_and_month, "x-ratelimit-remaining-day"), Some("19999"));
}

#[tokio::test]
async fn unmatched_routes_share_one_bucket() {
    let server = TestServer::builder()
        .api_key("key-a", 1)
        .build(DEFAULT_CONFIG)
        .await;

    let first = server.client.get_with_key("/v2/unknown", "key-a").await;
    let second = server.client.get_with_key("/v3/other", "key-a").await;

    assert_eq!(first.status(), 404);
    assert!(header(&first, "x-ratelimit-limit").is_some());
    assert_eq!(second.status(), 404);

    let keys = server.usage_keys().await;

    assert_eq!(keys.len(), 1);
    assert!(keys[0].ends_with("|unmatched"));
    assert_eq!(server.store.value(&keys[0]), Some(2));
}
