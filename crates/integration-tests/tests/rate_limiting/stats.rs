use integration_tests::{DEFAULT_CONFIG, TestServer};

fn hour_of(usage_key: &str) -> i64 {
    usage_key.split('|').nth(1).unwrap().parse().unwrap()
}

#[tokio::test]
async fn draining_twice_writes_the_same_rows() {
    let server = TestServer::builder()
        .api_key("key-a", 1)
        .build(DEFAULT_CONFIG)
        .await;

    for _ in 0..3 {
        server.client.get_with_key("/v1/blocks", "key-a").await;
    }

    server.client.get_with_key("/v1/blocks/42", "key-a").await;

    let keys = server.usage_keys().await;
    assert_eq!(keys.len(), 2);

    let hour = hour_of(&keys[0]);

    let summarize = || {
        let mut rows: Vec<_> = server
            .database
            .usage()
            .into_iter()
            .map(|row| (row.hour, row.user_id, row.api_key, row.route, row.count))
            .collect();

        rows.sort();
        rows
    };

    let expected = vec![
        (hour, 1, "key-a".to_string(), "/v1/blocks".to_string(), 3),
        (hour, 1, "key-a".to_string(), "/v1/blocks/{height}".to_string(), 1),
    ];

    // the current hour keeps counting
    server.drain_at(hour + 60).await;
    server.drain_at(hour + 60).await;

    assert_eq!(summarize(), expected);
    assert_eq!(server.usage_keys().await.len(), 2);

    // once the hour is over its counters go away
    server.drain_at(hour + 3600).await;

    assert_eq!(summarize(), expected);
    assert!(server.usage_keys().await.is_empty());

    server.drain_at(hour + 3600).await;

    assert_eq!(summarize(), expected);
}

#[tokio::test]
async fn unreachable_database_keeps_the_counters() {
    let server = TestServer::builder()
        .api_key("key-a", 1)
        .build(DEFAULT_CONFIG)
        .await;

    server.client.get_with_key("/v1/blocks", "key-a").await;

    let keys = server.usage_keys().await;
    let hour = hour_of(&keys[0]);

    server.database.set_available(false);

    let drain = rate_limit::StatsDrain::new(
        server.store.clone(),
        server.database.clone(),
        rate_limit::KeySpace::new("gatekeeper:"),
        500,
    );

    assert!(drain.drain_at(hour + 3600).await.is_err());
    assert_eq!(server.usage_keys().await, keys);
    assert!(server.database.usage().is_empty());
}
