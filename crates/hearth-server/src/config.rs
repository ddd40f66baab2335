//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use hearth_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_MESSAGE_CACHE_SIZE, DEFAULT_TYPING_SWEEP_MS,
    DEFAULT_TYPING_TIMEOUT_MS, MAX_MEDIA_SIZE,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./data/hearth.db`
    pub database_path: PathBuf,

    /// Directory where uploaded media and thumbnails are written.
    /// Env: `MEDIA_STORAGE_PATH`
    /// Default: `./media`
    pub media_storage_path: PathBuf,

    /// Prefix of the URLs handed out for stored media. Must be reachable by
    /// the moderation service for media scans.
    /// Env: `MEDIA_BASE_URL`
    /// Default: `/media`
    pub media_base_url: String,

    /// Maximum decoded media size in bytes.
    /// Env: `MAX_MEDIA_SIZE`
    pub max_media_size: usize,

    // -- Moderation --

    /// Base URL of the moderation service. Unset means every check is
    /// treated as a dependency failure.
    /// Env: `MODERATION_URL`
    pub moderation_url: Option<String>,

    /// Env: `MODERATION_API_KEY`
    pub moderation_api_key: Option<String>,

    /// Env: `MODERATION_TIMEOUT_MS`
    /// Default: 5000
    pub moderation_timeout: Duration,

    /// Whether a failing moderation service lets messages through as
    /// `pending` (true) or rejects the send (false).
    /// Env: `MODERATION_FAIL_OPEN`
    /// Default: `true`
    pub moderation_fail_open: bool,

    /// Env: `DEFAULT_MODERATION_ENABLED`
    /// Default: `true`
    pub default_moderation_enabled: bool,

    /// Env: `DEFAULT_AI_SCAN_ENABLED`
    /// Default: `true`
    pub default_ai_scan_enabled: bool,

    /// Env: `MEDIA_SCAN_DELAY_MS`
    /// Default: 2000
    pub media_scan_delay: Duration,

    /// Env: `MEDIA_SCAN_MAX_ATTEMPTS`
    /// Default: 3
    pub media_scan_max_attempts: u32,

    // -- Push --

    /// Push gateway endpoint. Unset means notifications are only logged.
    /// Env: `PUSH_URL`
    pub push_url: Option<String>,

    /// Env: `PUSH_API_KEY`
    pub push_api_key: Option<String>,

    // -- Live connections --

    /// Env: `TYPING_TIMEOUT_MS`
    pub typing_timeout: Duration,

    /// Env: `TYPING_SWEEP_MS`
    pub typing_sweep_interval: Duration,

    /// Env: `MESSAGE_CACHE_SIZE`
    pub message_cache_size: usize,

    /// Unauthenticated connections are closed after this long.
    /// Env: `AUTH_TIMEOUT_SECS`
    /// Default: 10
    pub auth_timeout: Duration,

    /// Sustained inbound events per second per user.
    /// Env: `EVENT_RATE`
    /// Default: 20
    pub event_rate: f64,

    /// Env: `EVENT_BURST`
    /// Default: 40
    pub event_burst: f64,

    // -- Instance --

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Bearer token for `/admin/*`. Empty disables the admin API.
    /// Env: `ADMIN_TOKEN`
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./data/hearth.db"),
            media_storage_path: PathBuf::from("./media"),
            media_base_url: "/media".to_string(),
            max_media_size: MAX_MEDIA_SIZE,
            moderation_url: None,
            moderation_api_key: None,
            moderation_timeout: Duration::from_millis(5_000),
            moderation_fail_open: true,
            default_moderation_enabled: true,
            default_ai_scan_enabled: true,
            media_scan_delay: Duration::from_millis(2_000),
            media_scan_max_attempts: 3,
            push_url: None,
            push_api_key: None,
            typing_timeout: Duration::from_millis(DEFAULT_TYPING_TIMEOUT_MS),
            typing_sweep_interval: Duration::from_millis(DEFAULT_TYPING_SWEEP_MS),
            message_cache_size: DEFAULT_MESSAGE_CACHE_SIZE,
            auth_timeout: Duration::from_secs(10),
            event_rate: 20.0,
            event_burst: 40.0,
            instance_name: "Hearth Messaging".to_string(),
            admin_token: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("MEDIA_STORAGE_PATH") {
            config.media_storage_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("MEDIA_BASE_URL") {
            config.media_base_url = url.trim_end_matches('/').to_string();
        }
        parse_into(&lookup, "MAX_MEDIA_SIZE", &mut config.max_media_size);

        // -- Moderation --

        config.moderation_url = non_empty(lookup("MODERATION_URL"));
        config.moderation_api_key = non_empty(lookup("MODERATION_API_KEY"));
        millis_into(&lookup, "MODERATION_TIMEOUT_MS", &mut config.moderation_timeout);
        flag_into(&lookup, "MODERATION_FAIL_OPEN", &mut config.moderation_fail_open);
        flag_into(
            &lookup,
            "DEFAULT_MODERATION_ENABLED",
            &mut config.default_moderation_enabled,
        );
        flag_into(
            &lookup,
            "DEFAULT_AI_SCAN_ENABLED",
            &mut config.default_ai_scan_enabled,
        );
        millis_into(&lookup, "MEDIA_SCAN_DELAY_MS", &mut config.media_scan_delay);
        parse_into(
            &lookup,
            "MEDIA_SCAN_MAX_ATTEMPTS",
            &mut config.media_scan_max_attempts,
        );
        config.media_scan_max_attempts = config.media_scan_max_attempts.max(1);

        // -- Push --

        config.push_url = non_empty(lookup("PUSH_URL"));
        config.push_api_key = non_empty(lookup("PUSH_API_KEY"));

        // -- Live connections --

        millis_into(&lookup, "TYPING_TIMEOUT_MS", &mut config.typing_timeout);
        millis_into(&lookup, "TYPING_SWEEP_MS", &mut config.typing_sweep_interval);
        parse_into(&lookup, "MESSAGE_CACHE_SIZE", &mut config.message_cache_size);

        let mut auth_secs = config.auth_timeout.as_secs();
        parse_into(&lookup, "AUTH_TIMEOUT_SECS", &mut auth_secs);
        config.auth_timeout = Duration::from_secs(auth_secs);

        parse_into(&lookup, "EVENT_RATE", &mut config.event_rate);
        parse_into(&lookup, "EVENT_BURST", &mut config.event_burst);

        // -- Instance --

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }
        config.admin_token = non_empty(lookup("ADMIN_TOKEN"));

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Overwrite `target` when `key` is set and parses; warn and keep the
/// default otherwise.
fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "Invalid configuration value, using default"),
    }
}

fn millis_into(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Duration) {
    let mut millis = target.as_millis() as u64;
    parse_into(lookup, key, &mut millis);
    *target = Duration::from_millis(millis);
}

fn flag_into(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut bool) {
    if let Some(val) = lookup(key) {
        *target = val != "false" && val != "0";
    }
}
