use std::env::var;
use std::time::Duration;

use dotenvy::dotenv;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("WS_PATH must start with '/' (got '{0}')")]
    InvalidWsPath(String),
}

/// Application configuration with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener address
    /// Env: BIND_HOST (default: "0.0.0.0")
    pub bind_host: String,

    /// Listener port
    /// Env: PORT (default: 8765)
    pub port: u16,

    /// Path the game-server plugin opens its socket on
    /// Env: WS_PATH (default: "/mcws")
    pub ws_path: String,

    /// Database file path
    /// Env: DATABASE_PATH (default: "kavex.db")
    pub database_path: String,

    /// Discord API Token
    /// Env: DISCORD_TOKEN (required by the binary)
    pub discord_token: Option<String>,

    /// Server-side secret appended to tokens before hashing.
    /// Changing it invalidates every stored link.
    /// Env: MC_TOKEN_PEPPER (default: "")
    pub token_pepper: String,

    /// A session with no heartbeat for this long is closed.
    /// Also bounds the wait for the first (auth) frame.
    /// Env: HEARTBEAT_TIMEOUT_SECS (default: 60)
    pub heartbeat_timeout: Duration,

    /// How often the heartbeat sweep runs
    /// Env: HEARTBEAT_SWEEP_SECS (default: 10)
    pub heartbeat_sweep_interval: Duration,

    /// Largest accepted socket message
    /// Env: MAX_FRAME_BYTES (default: 65536)
    pub max_frame_bytes: usize,

    /// Bounded per-session queue depth (inbound deliveries and outbound frames)
    /// Env: SESSION_QUEUE_CAPACITY (default: 64)
    pub session_queue_capacity: usize,

    /// Env: DELIVERY_MAX_RETRIES (default: 3)
    pub delivery_max_retries: u32,

    /// Env: DELIVERY_BACKOFF_MS (default: 250)
    pub delivery_backoff: Duration,

    /// Env: DELIVERY_MAX_BACKOFF_MS (default: 4000)
    pub delivery_max_backoff: Duration,

    /// Cool-down used when Discord rate limits without a retry hint
    /// Env: RATE_LIMIT_FALLBACK_MS (default: 1000)
    pub rate_limit_fallback: Duration,

    /// Name given to webhooks the bridge creates
    /// Env: WEBHOOK_NAME (default: "Kavex MC Link")
    pub webhook_name: String,

    /// Player avatar URL with {uuid} / {player} placeholders
    /// Env: AVATAR_URL_TEMPLATE
    pub avatar_url_template: String,

    /// Request body size limit in bytes
    /// Env: REQUEST_BODY_LIMIT (default: 1048576 = 1MB)
    pub request_body_limit: usize,

    /// Request timeout in seconds
    /// Env: REQUEST_TIMEOUT_SECS (default: 30)
    pub request_timeout: Duration,

    /// Socket upgrades per second per IP
    /// Env: RATE_LIMIT_UPGRADE_PER_SEC (default: 2)
    pub rate_limit_upgrade_per_sec: u64,

    /// Env: RATE_LIMIT_UPGRADE_BURST (default: 5)
    pub rate_limit_upgrade_burst: u32,

    /// Requests per second per IP for other routes
    /// Env: RATE_LIMIT_GENERAL_PER_SEC (default: 10)
    pub rate_limit_general_per_sec: u64,

    /// Env: RATE_LIMIT_GENERAL_BURST (default: 20)
    pub rate_limit_general_burst: u32,
}

const DEFAULT_AVATAR_URL_TEMPLATE: &str = "https://crafatar.com/avatars/{uuid}?size=64&overlay";

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv(); //for debugging mostly
        let defaults = Self::default();
        let config = Self {
            bind_host: env_or_default_string("BIND_HOST", &defaults.bind_host),
            port: env_or_default("PORT", defaults.port),
            ws_path: env_or_default_string("WS_PATH", &defaults.ws_path),
            database_path: env_or_default_string("DATABASE_PATH", &defaults.database_path),
            discord_token: var("DISCORD_TOKEN").ok(),
            token_pepper: env_or_default_string("MC_TOKEN_PEPPER", ""),
            heartbeat_timeout: Duration::from_secs(env_or_default("HEARTBEAT_TIMEOUT_SECS", 60)),
            heartbeat_sweep_interval: Duration::from_secs(
                env_or_default::<u64>("HEARTBEAT_SWEEP_SECS", 10).max(1),
            ),
            max_frame_bytes: env_or_default("MAX_FRAME_BYTES", defaults.max_frame_bytes),
            session_queue_capacity: env_or_default::<usize>(
                "SESSION_QUEUE_CAPACITY",
                defaults.session_queue_capacity,
            )
            .max(1),
            delivery_max_retries: env_or_default("DELIVERY_MAX_RETRIES", 3),
            delivery_backoff: Duration::from_millis(env_or_default("DELIVERY_BACKOFF_MS", 250)),
            delivery_max_backoff: Duration::from_millis(env_or_default(
                "DELIVERY_MAX_BACKOFF_MS",
                4000,
            )),
            rate_limit_fallback: Duration::from_millis(env_or_default(
                "RATE_LIMIT_FALLBACK_MS",
                1000,
            )),
            webhook_name: env_or_default_string("WEBHOOK_NAME", &defaults.webhook_name),
            avatar_url_template: env_or_default_string(
                "AVATAR_URL_TEMPLATE",
                DEFAULT_AVATAR_URL_TEMPLATE,
            ),
            request_body_limit: env_or_default("REQUEST_BODY_LIMIT", 1024 * 1024),
            request_timeout: Duration::from_secs(env_or_default("REQUEST_TIMEOUT_SECS", 30)),
            rate_limit_upgrade_per_sec: env_or_default("RATE_LIMIT_UPGRADE_PER_SEC", 2),
            rate_limit_upgrade_burst: env_or_default("RATE_LIMIT_UPGRADE_BURST", 5),
            rate_limit_general_per_sec: env_or_default("RATE_LIMIT_GENERAL_PER_SEC", 10),
            rate_limit_general_burst: env_or_default("RATE_LIMIT_GENERAL_BURST", 20),
        };

        if !config.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidWsPath(config.ws_path));
        }
        Ok(config)
    }

    /// Discord token, or an error naming the missing variable.
    pub fn require_discord_token(&self) -> Result<&str, ConfigError> {
        self.discord_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::Missing("DISCORD_TOKEN"))
    }

    pub fn bind_addr(&self) -> String {
        if self.bind_host.contains(':') {
            format!("[{}]:{}", self.bind_host, self.port)
        } else {
            format!("{}:{}", self.bind_host, self.port)
        }
    }
}

impl Default for Config {
    /// Create configuration with all default values
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 8765,
            ws_path: "/mcws".to_string(),
            database_path: "kavex.db".to_string(),
            discord_token: None,
            token_pepper: String::new(),
            heartbeat_timeout: Duration::from_secs(60),
            heartbeat_sweep_interval: Duration::from_secs(10),
            max_frame_bytes: 64 * 1024,
            session_queue_capacity: 64,
            delivery_max_retries: 3,
            delivery_backoff: Duration::from_millis(250),
            delivery_max_backoff: Duration::from_millis(4000),
            rate_limit_fallback: Duration::from_millis(1000),
            webhook_name: "Kavex MC Link".to_string(),
            avatar_url_template: DEFAULT_AVATAR_URL_TEMPLATE.to_string(),
            request_body_limit: 1024 * 1024, // 1 MB
            request_timeout: Duration::from_secs(30),
            rate_limit_upgrade_per_sec: 2,
            rate_limit_upgrade_burst: 5,
            rate_limit_general_per_sec: 10,
            rate_limit_general_burst: 20,
        }
    }
}

/// Parse environment variable or return default value
fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

/// Parse environment variable string or return default value
fn env_or_default_string(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|_| default.to_string())
}
