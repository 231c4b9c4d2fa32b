use integration_tests::{DEFAULT_CONFIG, TestServer};

async fn server() -> TestServer {
    TestServer::builder()
        .api_key("key-a", 1)
        .api_key("key-b", 2)
        .api_key("key-c", 3)
        .build(DEFAULT_CONFIG)
        .await
}

#[tokio::test]
async fn query_parameter_wins_over_headers() {
    let server = server().await;

    let response = server
        .client
        .request(reqwest::Method::GET, "/v1/blocks?apikey=key-a")
        .header("apikey", "key-b")
        .header("x-api-key", "key-c")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(server.counter("hour", "default", "u:1").await, Some(1));
    assert_eq!(server.counter("hour", "default", "u:2").await, None);
    assert_eq!(server.counter("hour", "default", "u:3").await, None);
}

#[tokio::test]
async fn apikey_header_wins_over_x_api_key() {
    let server = server().await;

    server
        .client
        .request(reqwest::Method::GET, "/v1/blocks")
        .header("apikey", "key-b")
        .header("x-api-key", "key-c")
        .send()
        .await
        .unwrap();

    assert_eq!(server.counter("hour", "default", "u:2").await, Some(1));
    assert_eq!(server.counter("hour", "default", "u:3").await, None);
}

#[tokio::test]
async fn unknown_key_is_counted_by_address() {
    let server = server().await;

    let response = server.client.get_with_key("/v1/blocks", "not-a-key").await;

    // the no-key tier
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-ratelimit-limit-hour"], "100");
    assert_eq!(response.headers()["x-ratelimit-limit-second"], "2");

    assert_eq!(server.counter("hour", "default", "ip:127.0.0.1").await, Some(1));
}

#[tokio::test]
async fn proxy_headers_name_the_client() {
    let server = server().await;

    server
        .client
        .request(reqwest::Method::GET, "/v1/blocks")
        .header("x-real-ip", "198.51.100.7")
        .header("x-forwarded-for", "203.0.113.50")
        .send()
        .await
        .unwrap();

    server
        .client
        .request(reqwest::Method::GET, "/v1/blocks")
        .header("x-forwarded-for", "192.0.2.1, 203.0.113.50")
        .send()
        .await
        .unwrap();

    assert_eq!(server.counter("hour", "default", "ip:198.51.100.7").await, Some(1));
    assert_eq!(server.counter("hour", "default", "ip:203.0.113.50").await, Some(1));
    assert_eq!(server.counter("hour", "default", "ip:127.0.0.1").await, None);
}
