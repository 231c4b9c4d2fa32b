use std::path::Path;

use anyhow::{Context, bail};

use crate::{Config, StorageConfig};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();

    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read configuration from {}", path.display()))?;

    let config: Config = toml::from_str(&content)?;
    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> anyhow::Result<()> {
    let rate_limits = &config.rate_limits;

    if !rate_limits.enabled {
        return Ok(());
    }

    if config.database.is_none() {
        bail!("Rate limiting is enabled but no [database] section is configured");
    }

    if rate_limits.fallback.rate == 0 || rate_limits.fallback.burst == 0 {
        bail!("Fallback rate and burst must both be greater than zero");
    }

    if rate_limits.key_prefix.contains('|') {
        bail!("The key prefix must not contain '|'");
    }

    if rate_limits.request_timeout.is_zero() {
        bail!("The counter store request timeout must be greater than zero");
    }

    let intervals = [
        ("rate_limits.health.interval", rate_limits.health.interval),
        ("rate_limits.fallback.eviction_interval", rate_limits.fallback.eviction_interval),
        ("sync.retry_backoff", config.sync.retry_backoff),
        ("sync.stats_interval", config.sync.stats_interval),
        ("sync.maintenance.interval", config.sync.maintenance.interval),
    ];

    if let Some((name, _)) = intervals.iter().find(|(_, interval)| interval.is_zero()) {
        bail!("{name} must be greater than zero");
    }

    if let StorageConfig::Redis(redis) = &rate_limits.storage
        && !(redis.url.starts_with("redis://") || redis.url.starts_with("rediss://"))
    {
        bail!("Redis URL must start with redis:// or rediss://, got {}", redis.url);
    }

    if rate_limits.health.timeout > rate_limits.health.interval {
        log::warn!(
            "Counter store probe timeout {:?} is longer than the probe interval {:?}",
            rate_limits.health.timeout,
            rate_limits.health.interval
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use indoc::indoc;

    use crate::Config;

    fn parse(toml: &str) -> Config {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn disabled_rate_limiting_needs_nothing() {
        let config = parse("");

        assert!(config.validate().is_ok());
    }

    #[test]
    fn enabled_without_database_fails() {
        let config = parse(indoc! {r#"
            [rate_limits]
            enabled = true
        "#});

        let error = config.validate().unwrap_err();

        insta::assert_snapshot!(error, @"Rate limiting is enabled but no [database] section is configured");
    }

    #[test]
    fn zero_fallback_rate_fails() {
        let config = parse(indoc! {r#"
            [rate_limits]
            enabled = true

            [rate_limits.fallback]
            rate = 0

            [database]
            url = "postgres://localhost/api"
        "#});

        let error = config.validate().unwrap_err();

        insta::assert_snapshot!(error, @"Fallback rate and burst must both be greater than zero");
    }

    #[test]
    fn invalid_redis_url_fails() {
        let config = parse(indoc! {r#"
            [rate_limits]
            enabled = true

            [rate_limits.storage]
            type = "redis"
            url = "localhost:6379"

            [database]
            url = "postgres://localhost/api"
        "#});

        let error = config.validate().unwrap_err();

        insta::assert_snapshot!(error, @"Redis URL must start with redis:// or rediss://, got localhost:6379");
    }

    #[test]
    fn zero_job_interval_fails() {
        let config = parse(indoc! {r#"
            [rate_limits]
            enabled = true

            [database]
            url = "postgres://localhost/api"

            [sync]
            stats_interval = "0s"
        "#});

        let error = config.validate().unwrap_err();

        insta::assert_snapshot!(error, @"sync.stats_interval must be greater than zero");
    }

    #[test]
    fn zero_retry_backoff_fails() {
        let config = parse(indoc! {r#"
            [rate_limits]
            enabled = true

            [database]
            url = "postgres://localhost/api"

            [sync]
            retry_backoff = "0s"
        "#});

        let error = config.validate().unwrap_err();

        insta::assert_snapshot!(error, @"sync.retry_backoff must be greater than zero");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();

        file.write_all(
            indoc! {r#"
                [rate_limits]
                enabled = true
                key_prefix = "test:"

                [database]
                url = "postgres://localhost/api"
            "#}
            .as_bytes(),
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();

        assert!(config.rate_limits.enabled);
        assert_eq!(config.rate_limits.key_prefix, "test:");
    }
}
