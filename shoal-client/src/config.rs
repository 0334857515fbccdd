//! Client configuration types and builders.

use std::time::Duration;

/// Default HTTP bootstrap (management) port.
const DEFAULT_HTTP_PORT: u16 = 8091;
/// Default key/value port.
const DEFAULT_KV_PORT: u16 = 11210;
/// Default key/value port over TLS.
const DEFAULT_TLS_KV_PORT: u16 = 11207;
/// Default key/value operation timeout.
const DEFAULT_KV_TIMEOUT: Duration = Duration::from_millis(2500);
/// Default timeout for durable mutations.
const DEFAULT_KV_DURABILITY_TIMEOUT: Duration = Duration::from_secs(10);
/// Default timeout for view requests.
const DEFAULT_VIEWS_TIMEOUT: Duration = Duration::from_secs(75);
/// Default timeout for query/analytics/search requests.
const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(75);
/// Default timeout for management requests.
const DEFAULT_MANAGEMENT_TIMEOUT: Duration = Duration::from_secs(75);
/// Default minimum connections per node pool.
const DEFAULT_POOL_MIN: usize = 2;
/// Default maximum connections per node pool.
const DEFAULT_POOL_MAX: usize = 5;
/// Default config polling interval.
const DEFAULT_CONFIG_POLL_INTERVAL: Duration = Duration::from_millis(2500);
/// Default initial retry backoff.
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Default maximum retry backoff.
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);
/// Default retry multiplier.
const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
/// Default maximum retry attempts.
const DEFAULT_MAX_RETRIES: u32 = 10;

/// Configuration error returned when validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

/// How node addresses from the cluster map are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkResolution {
    /// Use the addresses the cluster advertises internally.
    #[default]
    Default,
    /// Prefer the alternate (external) address block when present.
    External,
}

/// Retry/backoff configuration for reconnects and the config stream.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    max_retries: u32,
}

impl RetryConfig {
    /// Returns the initial backoff duration.
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Returns the maximum backoff duration.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Returns the backoff multiplier.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Returns the maximum number of retry attempts.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Builder for `RetryConfig`.
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    multiplier: Option<f64>,
    max_retries: Option<u32>,
}

impl RetryConfigBuilder {
    /// Creates a new retry configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial backoff duration.
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = Some(backoff);
        self
    }

    /// Sets the maximum backoff duration.
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    /// Sets the backoff multiplier.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Sets the maximum number of retry attempts.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Builds the retry configuration.
    pub fn build(self) -> RetryConfig {
        RetryConfig {
            initial_backoff: self.initial_backoff.unwrap_or(DEFAULT_INITIAL_BACKOFF),
            max_backoff: self.max_backoff.unwrap_or(DEFAULT_MAX_BACKOFF),
            multiplier: self.multiplier.unwrap_or(DEFAULT_RETRY_MULTIPLIER),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        }
    }
}

/// Client configuration for a Shoal cluster.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    tls_enabled: bool,
    username: String,
    password: String,
    bootstrap_http_port: u16,
    kv_port: u16,
    tls_kv_port: u16,
    kv_timeout: Duration,
    kv_durability_timeout: Duration,
    views_timeout: Duration,
    query_timeout: Duration,
    analytics_timeout: Duration,
    search_timeout: Duration,
    management_timeout: Duration,
    enable_mutation_tokens: bool,
    enable_operation_duration_tracing: bool,
    enable_config_polling: bool,
    config_poll_interval: Duration,
    network_resolution: NetworkResolution,
    pool_min_size: usize,
    pool_max_size: usize,
    retry: RetryConfig,
}

impl ClientConfig {
    /// Returns a new configuration builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Returns `true` if connections use TLS.
    pub fn tls_enabled(&self) -> bool {
        self.tls_enabled
    }

    /// Returns the configured username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the configured password.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Returns the HTTP bootstrap port.
    pub fn bootstrap_http_port(&self) -> u16 {
        self.bootstrap_http_port
    }

    /// Returns the key/value port for the active TLS mode.
    pub fn effective_kv_port(&self) -> u16 {
        if self.tls_enabled { self.tls_kv_port } else { self.kv_port }
    }

    /// Returns the key/value operation timeout.
    pub fn kv_timeout(&self) -> Duration {
        self.kv_timeout
    }

    /// Returns the timeout for durable mutations.
    pub fn kv_durability_timeout(&self) -> Duration {
        self.kv_durability_timeout
    }

    /// Returns the views request timeout.
    pub fn views_timeout(&self) -> Duration {
        self.views_timeout
    }

    /// Returns the query request timeout.
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Returns the analytics request timeout.
    pub fn analytics_timeout(&self) -> Duration {
        self.analytics_timeout
    }

    /// Returns the search request timeout.
    pub fn search_timeout(&self) -> Duration {
        self.search_timeout
    }

    /// Returns the management request timeout.
    pub fn management_timeout(&self) -> Duration {
        self.management_timeout
    }

    /// Returns `true` if mutation tokens are requested.
    pub fn enable_mutation_tokens(&self) -> bool {
        self.enable_mutation_tokens
    }

    /// Returns `true` if server-side operation durations are requested.
    pub fn enable_operation_duration_tracing(&self) -> bool {
        self.enable_operation_duration_tracing
    }

    /// Returns `true` if periodic config polling is enabled.
    pub fn enable_config_polling(&self) -> bool {
        self.enable_config_polling
    }

    /// Returns the config polling interval.
    pub fn config_poll_interval(&self) -> Duration {
        self.config_poll_interval
    }

    /// Returns the network resolution mode.
    pub fn network_resolution(&self) -> NetworkResolution {
        self.network_resolution
    }

    /// Returns the per-node pool minimum size.
    pub fn pool_min_size(&self) -> usize {
        self.pool_min_size
    }

    /// Returns the per-node pool maximum size.
    pub fn pool_max_size(&self) -> usize {
        self.pool_max_size
    }

    /// Returns the retry/backoff configuration.
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfigBuilder::new().build().expect("default config is valid")
    }
}

/// Builder for `ClientConfig`.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    tls_enabled: bool,
    username: Option<String>,
    password: Option<String>,
    bootstrap_http_port: Option<u16>,
    kv_port: Option<u16>,
    tls_kv_port: Option<u16>,
    kv_timeout: Option<Duration>,
    kv_durability_timeout: Option<Duration>,
    views_timeout: Option<Duration>,
    query_timeout: Option<Duration>,
    analytics_timeout: Option<Duration>,
    search_timeout: Option<Duration>,
    management_timeout: Option<Duration>,
    enable_mutation_tokens: Option<bool>,
    enable_operation_duration_tracing: Option<bool>,
    enable_config_polling: Option<bool>,
    config_poll_interval: Option<Duration>,
    network_resolution: Option<NetworkResolution>,
    pool_min_size: Option<usize>,
    pool_max_size: Option<usize>,
    retry: Option<RetryConfig>,
}

impl ClientConfigBuilder {
    /// Creates a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables TLS.
    pub fn tls_enabled(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    /// Sets the credentials used during SASL authentication.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the HTTP bootstrap port.
    pub fn bootstrap_http_port(mut self, port: u16) -> Self {
        self.bootstrap_http_port = Some(port);
        self
    }

    /// Sets the key/value port.
    pub fn kv_port(mut self, port: u16) -> Self {
        self.kv_port = Some(port);
        self
    }

    /// Sets the TLS key/value port.
    pub fn tls_kv_port(mut self, port: u16) -> Self {
        self.tls_kv_port = Some(port);
        self
    }

    /// Sets the key/value operation timeout.
    pub fn kv_timeout(mut self, timeout: Duration) -> Self {
        self.kv_timeout = Some(timeout);
        self
    }

    /// Sets the durable-mutation timeout.
    pub fn kv_durability_timeout(mut self, timeout: Duration) -> Self {
        self.kv_durability_timeout = Some(timeout);
        self
    }

    /// Sets the views request timeout.
    pub fn views_timeout(mut self, timeout: Duration) -> Self {
        self.views_timeout = Some(timeout);
        self
    }

    /// Sets the query request timeout.
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Sets the analytics request timeout.
    pub fn analytics_timeout(mut self, timeout: Duration) -> Self {
        self.analytics_timeout = Some(timeout);
        self
    }

    /// Sets the search request timeout.
    pub fn search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout = Some(timeout);
        self
    }

    /// Sets the management request timeout.
    pub fn management_timeout(mut self, timeout: Duration) -> Self {
        self.management_timeout = Some(timeout);
        self
    }

    /// Requests mutation tokens on mutation responses.
    pub fn enable_mutation_tokens(mut self, enabled: bool) -> Self {
        self.enable_mutation_tokens = Some(enabled);
        self
    }

    /// Requests server-measured operation durations.
    pub fn enable_operation_duration_tracing(mut self, enabled: bool) -> Self {
        self.enable_operation_duration_tracing = Some(enabled);
        self
    }

    /// Enables periodic config polling alongside the stream.
    pub fn enable_config_polling(mut self, enabled: bool) -> Self {
        self.enable_config_polling = Some(enabled);
        self
    }

    /// Sets the config polling interval.
    pub fn config_poll_interval(mut self, interval: Duration) -> Self {
        self.config_poll_interval = Some(interval);
        self
    }

    /// Sets the network resolution mode.
    pub fn network_resolution(mut self, resolution: NetworkResolution) -> Self {
        self.network_resolution = Some(resolution);
        self
    }

    /// Sets the per-node pool minimum size.
    pub fn pool_min_size(mut self, size: usize) -> Self {
        self.pool_min_size = Some(size);
        self
    }

    /// Sets the per-node pool maximum size.
    pub fn pool_max_size(mut self, size: usize) -> Self {
        self.pool_max_size = Some(size);
        self
    }

    /// Customizes the retry configuration.
    pub fn retry(mut self, f: impl FnOnce(RetryConfigBuilder) -> RetryConfigBuilder) -> Self {
        self.retry = Some(f(RetryConfigBuilder::new()).build());
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let pool_min_size = self.pool_min_size.unwrap_or(DEFAULT_POOL_MIN);
        let pool_max_size = self.pool_max_size.unwrap_or(DEFAULT_POOL_MAX);

        if pool_min_size == 0 {
            return Err(ConfigError::new("pool minimum size must be at least 1"));
        }
        if pool_max_size < pool_min_size {
            return Err(ConfigError::new(format!(
                "pool maximum size {pool_max_size} is below minimum {pool_min_size}"
            )));
        }

        let kv_timeout = self.kv_timeout.unwrap_or(DEFAULT_KV_TIMEOUT);
        if kv_timeout.is_zero() {
            return Err(ConfigError::new("kv timeout must be non-zero"));
        }

        Ok(ClientConfig {
            tls_enabled: self.tls_enabled,
            username: self.username.unwrap_or_default(),
            password: self.password.unwrap_or_default(),
            bootstrap_http_port: self.bootstrap_http_port.unwrap_or(DEFAULT_HTTP_PORT),
            kv_port: self.kv_port.unwrap_or(DEFAULT_KV_PORT),
            tls_kv_port: self.tls_kv_port.unwrap_or(DEFAULT_TLS_KV_PORT),
            kv_timeout,
            kv_durability_timeout: self
                .kv_durability_timeout
                .unwrap_or(DEFAULT_KV_DURABILITY_TIMEOUT),
            views_timeout: self.views_timeout.unwrap_or(DEFAULT_VIEWS_TIMEOUT),
            query_timeout: self.query_timeout.unwrap_or(DEFAULT_SERVICE_TIMEOUT),
            analytics_timeout: self.analytics_timeout.unwrap_or(DEFAULT_SERVICE_TIMEOUT),
            search_timeout: self.search_timeout.unwrap_or(DEFAULT_SERVICE_TIMEOUT),
            management_timeout: self.management_timeout.unwrap_or(DEFAULT_MANAGEMENT_TIMEOUT),
            enable_mutation_tokens: self.enable_mutation_tokens.unwrap_or(true),
            enable_operation_duration_tracing: self
                .enable_operation_duration_tracing
                .unwrap_or(false),
            enable_config_polling: self.enable_config_polling.unwrap_or(true),
            config_poll_interval: self
                .config_poll_interval
                .unwrap_or(DEFAULT_CONFIG_POLL_INTERVAL),
            network_resolution: self.network_resolution.unwrap_or_default(),
            pool_min_size,
            pool_max_size,
            retry: self.retry.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::builder().build().unwrap();
        assert!(!config.tls_enabled());
        assert_eq!(config.effective_kv_port(), DEFAULT_KV_PORT);
        assert_eq!(config.kv_timeout(), DEFAULT_KV_TIMEOUT);
        assert_eq!(config.pool_min_size(), 2);
        assert_eq!(config.pool_max_size(), 5);
        assert!(config.enable_mutation_tokens());
    }

    #[test]
    fn test_tls_switches_kv_port() {
        let config = ClientConfig::builder().tls_enabled(true).build().unwrap();
        assert_eq!(config.effective_kv_port(), DEFAULT_TLS_KV_PORT);
    }

    #[test]
    fn test_credentials() {
        let config = ClientConfig::builder()
            .credentials("app", "secret")
            .build()
            .unwrap();
        assert_eq!(config.username(), "app");
        assert_eq!(config.password(), "secret");
    }

    #[test]
    fn test_pool_bounds_validated() {
        assert!(ClientConfig::builder().pool_min_size(0).build().is_err());
        assert!(ClientConfig::builder()
            .pool_min_size(4)
            .pool_max_size(2)
            .build()
            .is_err());
    }

    #[test]
    fn test_zero_kv_timeout_rejected() {
        assert!(ClientConfig::builder()
            .kv_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_retry_builder_closure() {
        let config = ClientConfig::builder()
            .retry(|r| r.initial_backoff(Duration::from_millis(5)).max_retries(3))
            .build()
            .unwrap();
        assert_eq!(config.retry().initial_backoff(), Duration::from_millis(5));
        assert_eq!(config.retry().max_retries(), 3);
        assert_eq!(config.retry().multiplier(), DEFAULT_RETRY_MULTIPLIER);
    }

    #[test]
    fn test_network_resolution_default() {
        let config = ClientConfig::builder().build().unwrap();
        assert_eq!(config.network_resolution(), NetworkResolution::Default);
    }
}
