use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::tenant::TenantLookupRule;

use crate::reconnect::BackoffConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub tenant_filter: TenantFilterConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Prefix for every channel and key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Connect timeout in milliseconds; exceeding it reports `TimedOut`
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt (milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Attempts before the subscription gives up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound on a single delay (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantFilterConfig {
    /// How long a resolved parent tenant stays cached (seconds)
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    /// Backend lookups allowed in flight at once
    #[serde(default = "default_max_concurrent_lookups")]
    pub max_concurrent_lookups: usize,
    /// Longest lookup chain followed before giving up
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    #[serde(default = "default_tenant_field")]
    pub tenant_field: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Parent lookup rules; the built-in table is used when empty
    #[serde(default)]
    pub rules: Vec<TenantLookupRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Local user id announced on every tracked tenant
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    /// Own presence is re-tracked on this interval while connected (seconds)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Roster entries without a heartbeat for this long are dropped (seconds)
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: u64,
}

/// Settings for the watch binary
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,
    /// Entity types to watch; empty means all of them
    #[serde(default)]
    pub entities: Vec<String>,
    /// Emit JSON log lines instead of plain text
    #[serde(default)]
    pub json_logs: bool,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "ara".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    5
}

fn default_max_delay_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_cache_ttl_seconds() -> u64 {
    30
}

fn default_max_concurrent_lookups() -> usize {
    8
}

fn default_max_hops() -> usize {
    4
}

fn default_tenant_field() -> String {
    "tenant_id".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_user_id() -> String {
    "anonymous".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30 // 30 seconds
}

fn default_stale_after() -> u64 {
    90 // three missed heartbeats
}

fn default_tenant_id() -> String {
    "default".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("redis.url", default_redis_url())?
            .set_default("redis.key_prefix", default_key_prefix())?
            .set_default("reconnect.base_delay_ms", default_base_delay_ms() as i64)?
            .set_default("reconnect.max_attempts", default_max_attempts() as i64)?
            .set_default("tenant_filter.cache_ttl_seconds", default_cache_ttl_seconds() as i64)?
            .set_default("presence.heartbeat_interval_seconds", default_heartbeat_interval() as i64)?
            .set_default("presence.stale_after_seconds", default_stale_after() as i64)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // REDIS__URL, RECONNECT__MAX_ATTEMPTS, WATCH__TENANT_ID, etc.
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("watch.entities"),
            );

        builder.build()?.try_deserialize()
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: 0.0,
        }
    }
}

impl From<&ReconnectConfig> for BackoffConfig {
    fn from(config: &ReconnectConfig) -> Self {
        BackoffConfig {
            base_delay_ms: config.base_delay_ms,
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
            max_delay_ms: config.max_delay_ms,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

impl Default for TenantFilterConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_cache_ttl_seconds(),
            max_concurrent_lookups: default_max_concurrent_lookups(),
            max_hops: default_max_hops(),
            tenant_field: default_tenant_field(),
            id_field: default_id_field(),
            rules: Vec::new(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            display_name: String::new(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            stale_after_seconds: default_stale_after(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            tenant_id: default_tenant_id(),
            entities: vec![],
            json_logs: false,
        }
    }
}
