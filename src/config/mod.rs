mod settings;

pub use settings::{
    PresenceConfig, ReconnectConfig, RedisConfig, Settings, TenantFilterConfig, WatchConfig,
};
