//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults
//!
//! Library components never read the global directly; they take the typed
//! sections below (or their own tuning structs built from them).

use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call tabletop_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load(config::File::with_name("config").required(false))?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a config from defaults, the given file source, and `TABLETOP__*` env vars.
pub fn load<S>(file: S) -> Result<AppConfig, config::ConfigError>
where
    S: config::Source + Send + Sync + 'static,
{
    let cfg = config::Config::builder()
        // Defaults
        .set_default("app.base_url", "http://localhost:8000")?
        .set_default("app.csrf_token", "")?
        .set_default("signaling.url", "ws://localhost:8080/signal")?
        .set_default("signaling.max_reconnect", 10)?
        .set_default("signaling.suspend_after", 3)?
        .set_default("room.health_check_interval_secs", 30)?
        .set_default("room.leave_timeout_ms", 5000)?
        .set_default("room.settle_delay_ms", 500)?
        .set_default("room.reannounce_delay_ms", 1000)?
        .set_default("room.reconcile_delay_ms", 3000)?
        .set_default("room.reconnect_jitter_ms", 1000)?
        .set_default("room.max_refresh_attempts", 5)?
        .set_default("room.refresh_base_delay_ms", 1000)?
        .set_default("room.refresh_cooldown_secs", 300)?
        .set_default("room.dial_timeout_secs", 15)?
        .set_default("upload.max_chunk_retries", 3)?
        .set_default("upload.retry_base_delay_ms", 500)?
        .set_default("upload.backlog_limit_bytes", 64 * 1024 * 1024)?
        .set_default("upload.multipart_part_size", 5 * 1024 * 1024)? // S3 minimum part size
        .set_default("upload.resumable_chunk_granularity", 256 * 1024)?
        .set_default("ice.ttl_secs", 3600)?
        .add_source(file)
        // Environment variables (TABLETOP__APP__BASE_URL, TABLETOP__ROOM__LEAVE_TIMEOUT_MS, etc.)
        .add_source(
            config::Environment::with_prefix("TABLETOP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub app: ApplicationConfig,
    pub signaling: SignalingConfig,
    pub room: RoomConfig,
    pub upload: UploadConfig,
    pub ice: IceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationConfig {
    /// Base URL of the application server (upload, ICE and consent endpoints).
    pub base_url: String,
    /// CSRF token sent with every application-server request.
    pub csrf_token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// Pub/sub WebSocket endpoint.
    pub url: String,
    /// Give up (and report `Failed`) after this many consecutive failed reconnects.
    pub max_reconnect: u32,
    /// Report `Suspended` after this many consecutive failed reconnects.
    pub suspend_after: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoomConfig {
    pub health_check_interval_secs: u64,
    pub leave_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub reannounce_delay_ms: u64,
    pub reconcile_delay_ms: u64,
    pub reconnect_jitter_ms: u64,
    pub max_refresh_attempts: u32,
    pub refresh_base_delay_ms: u64,
    pub refresh_cooldown_secs: u64,
    /// A call that produced no remote stream after this long counts as missing.
    pub dial_timeout_secs: u64,
}

impl RoomConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    pub max_chunk_retries: u32,
    pub retry_base_delay_ms: u64,
    pub backlog_limit_bytes: u64,
    pub multipart_part_size: usize,
    pub resumable_chunk_granularity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IceConfig {
    /// How long fetched TURN credentials are trusted before refetching.
    pub ttl_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_every_section() {
        let cfg = load(config::File::from_str("", config::FileFormat::Toml)).unwrap();
        assert_eq!(cfg.app.base_url, "http://localhost:8000");
        assert_eq!(cfg.room.health_check_interval(), Duration::from_secs(30));
        assert_eq!(cfg.room.leave_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.room.max_refresh_attempts, 5);
        assert_eq!(cfg.upload.multipart_part_size, 5 * 1024 * 1024);
        assert_eq!(cfg.ice.ttl_secs, 3600);
    }

    #[test]
    fn file_values_override_defaults() {
        let toml = r#"
            [room]
            leave_timeout_ms = 2500

            [app]
            csrf_token = "abc"
        "#;
        let cfg = load(config::File::from_str(toml, config::FileFormat::Toml)).unwrap();
        assert_eq!(cfg.room.leave_timeout(), Duration::from_millis(2500));
        assert_eq!(cfg.app.csrf_token, "abc");
        assert_eq!(cfg.room.settle_delay_ms, 500);
    }
}
