//! Test harness running the server over in-memory stores.

pub mod api;
pub mod flaky;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use config::Config;
use jiff::Timestamp;
use rate_limit::{
    ApiKeyRow, KeySpace, MemoryDatabase, RateLimitManager, StatsDrain, UserLimitRow, WeightRow,
};
use server::ServeConfig;
use tokio::{net::TcpListener, time::timeout};

pub use flaky::FlakyStore;

/// Configuration most tests start from. Maintenance is off so that seeded limits stay put.
pub const DEFAULT_CONFIG: &str = indoc::indoc! {r#"
    [rate_limits]
    enabled = true

    [sync.maintenance]
    enabled = false
"#};

/// Test client for making HTTP requests to the test server
pub struct TestClient {
    base_url: String,
    client: reqwest::Client,
}

impl TestClient {
    /// Create a new test client for the given base URL
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// Send a GET request to the given path
    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.request(reqwest::Method::GET, path).send().await.unwrap()
    }

    /// Send a GET request presenting an API key in the `x-api-key` header
    pub async fn get_with_key(&self, path: &str, api_key: &str) -> reqwest::Response {
        self.request(reqwest::Method::GET, path)
            .header("x-api-key", api_key)
            .send()
            .await
            .unwrap()
    }

    /// Create a request builder for custom requests
    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client.request(method, format!("{}{}", self.base_url, path))
    }
}

/// Seeds the durable store before the server loads its configuration.
pub struct TestServerBuilder {
    database: Arc<MemoryDatabase>,
    store: Arc<FlakyStore>,
}

impl TestServerBuilder {
    /// Registers a valid API key.
    pub fn api_key(self, api_key: &str, user_id: i64) -> Self {
        self.database.put_api_key(
            ApiKeyRow {
                api_key: api_key.to_string(),
                user_id,
                valid_from: Timestamp::UNIX_EPOCH,
                valid_until: None,
            },
            Timestamp::now(),
        );

        self
    }

    /// Gives a user its own tier.
    pub fn user_limit(self, user_id: i64, second: i64, hour: i64, month: i64) -> Self {
        self.database.put_user_limit(
            UserLimitRow {
                user_id,
                second,
                hour,
                month,
                valid_from: Timestamp::UNIX_EPOCH,
                valid_until: None,
            },
            Timestamp::now(),
        );

        self
    }

    /// Sets the weight and bucket of a route template.
    pub fn weight(self, route: &str, weight: i64, bucket: &str) -> Self {
        self.database.put_weight(WeightRow {
            route: route.to_string(),
            weight,
            bucket: bucket.to_string(),
            valid_from: Timestamp::UNIX_EPOCH,
        });

        self
    }

    /// Starts the server with the given TOML configuration.
    pub async fn build(self, config_toml: &str) -> TestServer {
        TestServer::start(config_toml, self.database, self.store).await
    }
}

/// Test server that manages the lifecycle of a server instance
pub struct TestServer {
    pub client: TestClient,
    pub address: SocketAddr,
    pub store: Arc<FlakyStore>,
    pub database: Arc<MemoryDatabase>,
    pub manager: Arc<RateLimitManager>,
    prefix: String,
    keys: KeySpace,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// A builder over empty stores.
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder {
            database: Arc::new(MemoryDatabase::new()),
            store: Arc::new(FlakyStore::default()),
        }
    }

    async fn start(config_toml: &str, database: Arc<MemoryDatabase>, store: Arc<FlakyStore>) -> Self {
        let config: Config = toml::from_str(config_toml).unwrap();

        let manager = RateLimitManager::with_stores(&config.rate_limits, store.clone(), database.clone()).unwrap();
        let manager = Arc::new(manager);
        let prefix = config.rate_limits.key_prefix.clone();
        let health_path = config.server.health.path.to_string();
        let keys = KeySpace::new(prefix.clone());

        // Find an available port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let serve_config = ServeConfig {
            listen_address: address,
            config,
            api: Some(api::router()),
            rate_limit_manager: Some(manager.clone()),
        };

        let handle = tokio::spawn(async move {
            // Drop the listener so the server can bind to the address
            drop(listener);

            if let Err(e) = server::serve(serve_config).await {
                log::error!("Server failed: {e}");
            }
        });

        let client = TestClient::new(format!("http://{address}"));

        // The server binds only after the initial synchronization
        let mut retries = 100;

        while retries > 0 {
            let request = client.request(reqwest::Method::GET, &health_path).send();

            if let Ok(Ok(response)) = timeout(Duration::from_millis(100), request).await
                && response.status().is_success()
            {
                break;
            }

            retries -= 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        TestServer {
            client,
            address,
            store,
            database,
            manager,
            prefix,
            keys,
            handle,
        }
    }

    /// Value of the counter of `window` for a subject (`u:<id>` or `ip:<addr>`).
    pub async fn counter(&self, window: &str, bucket: &str, subject: &str) -> Option<i64> {
        let pattern = format!("{}rl|{window}|{bucket}|{subject}|*", self.prefix);
        let keys = self.store.keys(&pattern).await;

        keys.first().and_then(|key| self.store.value(key))
    }

    /// Drains usage counters as if the clock read `now` (UNIX seconds).
    pub async fn drain_at(&self, now: i64) -> u64 {
        let drain = StatsDrain::new(self.store.clone(), self.database.clone(), self.keys.clone(), 500);

        drain.drain_at(now).await.unwrap()
    }

    /// Every usage counter key currently in the store.
    pub async fn usage_keys(&self) -> Vec<String> {
        self.store.keys(&self.keys.usage_pattern()).await
    }

    /// Polls the health endpoint until it reports `status`.
    pub async fn wait_for_health(&self, status: &str) {
        let expected = format!(r#"{{"status":"{status}"}}"#);

        for _ in 0..100 {
            let body = self.client.get("/health").await.text().await.unwrap();

            if body == expected {
                return;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        unreachable!("health never reported {status}");
    }

    /// Polls a counter until it holds `expected`.
    pub async fn wait_for_counter(&self, window: &str, bucket: &str, subject: &str, expected: i64) {
        for _ in 0..100 {
            if self.counter(window, bucket, subject).await == Some(expected) {
                return;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(self.counter(window, bucket, subject).await, Some(expected));
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
