use std::env;

/// Hub-wide configuration, read from environment variables with sensible
/// defaults (see spec §6 "Environment configuration").
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub storage_backend: StorageBackend,
    pub cleanup_interval_ms: u64,
    pub message_ttl_sec: i64,
    pub default_lease_sec: i64,
    pub max_lease_sec: i64,
    pub max_delivery_attempts: u32,
    pub webhook_max_attempts: u32,
    pub heartbeat_timeout_sec: i64,
    pub key_rotation_grace_sec: i64,
    pub group_fanout_threshold: usize,
    pub external_store_url: Option<String>,
    pub external_store_app_id: Option<String>,
    pub external_store_api_key: Option<String>,
    /// Whether signature verification is skipped for senders that aren't
    /// registered agents. spec.md §9 flags this as ambiguous in the source;
    /// this reimplementation defaults it off (see DESIGN.md).
    pub allow_unregistered_senders: bool,
    /// CORS allow-list (`CORS_ORIGIN`, comma-separated). `None` keeps the
    /// teacher's wide-open `CorsOptions::default()`.
    pub cors_origin: Option<String>,
    /// Port to bind (`PORT`). Falls back to Rocket's own `ROCKET_PORT`/
    /// figment default when unset.
    pub port: Option<u16>,
    /// Shared secret for the `X-Admin-Key`/admin-bearer ops endpoints (e.g.
    /// forced reclaim). `None` disables those endpoints entirely.
    pub admin_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    External,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            storage_backend: StorageBackend::Memory,
            cleanup_interval_ms: 60_000,
            message_ttl_sec: 86_400,
            default_lease_sec: 30,
            max_lease_sec: 300,
            max_delivery_attempts: 10,
            webhook_max_attempts: 8,
            heartbeat_timeout_sec: 180,
            key_rotation_grace_sec: 60,
            group_fanout_threshold: 50,
            external_store_url: None,
            external_store_app_id: None,
            external_store_api_key: None,
            allow_unregistered_senders: false,
            cors_origin: None,
            port: None,
            admin_key: None,
        }
    }
}

impl HubConfig {
    /// Build config from the environment, falling back to defaults for any
    /// variable that is unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("STORAGE_BACKEND") {
            config.storage_backend = match val.as_str() {
                "external" => StorageBackend::External,
                _ => StorageBackend::Memory,
            };
        }
        if let Ok(val) = env::var("CLEANUP_INTERVAL_MS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.cleanup_interval_ms = n;
        }
        if let Ok(val) = env::var("MESSAGE_TTL_SEC")
            && let Ok(n) = val.parse::<i64>()
        {
            config.message_ttl_sec = n;
        }
        if let Ok(val) = env::var("DEFAULT_LEASE_SEC")
            && let Ok(n) = val.parse::<i64>()
        {
            config.default_lease_sec = n;
        }
        if let Ok(val) = env::var("MAX_DELIVERY_ATTEMPTS")
            && let Ok(n) = val.parse::<u32>()
        {
            config.max_delivery_attempts = n;
        }
        if let Ok(val) = env::var("WEBHOOK_MAX_ATTEMPTS")
            && let Ok(n) = val.parse::<u32>()
        {
            config.webhook_max_attempts = n;
        }
        if let Ok(val) = env::var("HEARTBEAT_TIMEOUT_SEC")
            && let Ok(n) = val.parse::<i64>()
        {
            config.heartbeat_timeout_sec = n;
        }
        if let Ok(val) = env::var("ALLOW_UNREGISTERED_SENDERS")
            && let Ok(b) = val.parse::<bool>()
        {
            config.allow_unregistered_senders = b;
        }

        config.external_store_url = env::var("EXTERNAL_STORE_URL").ok();
        config.external_store_app_id = env::var("APP_ID").ok();
        config.external_store_api_key = env::var("API_KEY").ok();
        config.cors_origin = env::var("CORS_ORIGIN").ok();
        config.admin_key = env::var("ADMIN_KEY").ok();
        if let Ok(val) = env::var("PORT")
            && let Ok(p) = val.parse::<u16>()
        {
            config.port = Some(p);
        }

        config
    }
}
