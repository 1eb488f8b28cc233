//! Listener configuration from environment variables

use std::env;
use std::time::Duration;

/// Configuration for the listener engine
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Path to SQLite room database
    pub db_path: String,

    /// Origin for live-platform HTTP endpoints
    pub api_live_origin: String,

    /// Inbound channel buffer shared by every connection
    pub channel_buffer: usize,

    /// Rooms updated within this many days are kept connected
    pub db_window_days: u64,

    /// Persisted-room reconciliation interval in milliseconds
    pub db_refresh_interval_ms: u64,

    /// Enable the platform-wide live room pool
    pub global_listener: bool,

    /// Live room reconciliation interval in milliseconds
    pub live_refresh_interval_ms: u64,

    /// Rooms per discovery page
    pub discovery_page_size: u64,

    /// Pause between discovery page fetches in milliseconds
    pub discovery_page_delay_ms: u64,

    /// Connection error evaluation window in milliseconds
    pub health_window_ms: u64,

    /// Errors per window that force a fleet rebuild
    pub health_error_threshold: u64,

    /// Delay before polling a broadcast's target room in milliseconds
    pub broadcast_poll_delay_ms: u64,

    /// Upper bound for store and platform calls in milliseconds
    pub request_timeout_ms: u64,

    /// Wall-clock check interval for hourly reports and the daily boundary
    pub clock_tick_ms: u64,

    /// Report time zone offset from UTC
    pub report_utc_offset_hours: i32,

    /// Push a condensed report every N hours
    pub push_every_hours: u32,

    /// Log the first payload of each unrecognized command
    pub log_unknown_cmds: bool,

    /// Commands never logged as unrecognized
    pub exclude_cmds: Vec<String>,

    /// Where first-seen command payloads are kept (None = memory only)
    pub cmd_sample_path: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ListenerConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `LISTENER_DB_PATH` (default: rooms.db)
    /// - `API_LIVE_ORIGIN` (default: https://api.live.bilibili.com)
    /// - `LISTENER_CHANNEL_BUFFER` (default: 10000)
    /// - `DB_WINDOW_DAYS` (default: 30)
    /// - `DB_REFRESH_INTERVAL_MS` (default: 86400000)
    /// - `ENABLE_GLOBAL_LISTENER` (default: true)
    /// - `LIVE_REFRESH_INTERVAL_MS` (default: 300000)
    /// - `DISCOVERY_PAGE_SIZE` (default: 500)
    /// - `DISCOVERY_PAGE_DELAY_MS` (default: 3000)
    /// - `HEALTH_WINDOW_MS` (default: 60000)
    /// - `HEALTH_ERROR_THRESHOLD` (default: 300)
    /// - `BROADCAST_POLL_DELAY_MS` (default: 2000)
    /// - `REQUEST_TIMEOUT_MS` (default: 10000)
    /// - `CLOCK_TICK_MS` (default: 55000)
    /// - `REPORT_UTC_OFFSET_HOURS` (default: 8)
    /// - `PUSH_EVERY_HOURS` (default: 6)
    /// - `LOG_UNKNOWN_CMDS` (default: true)
    /// - `EXCLUDE_CMDS` (comma-separated, default: empty)
    /// - `CMD_SAMPLE_PATH` (default: unset)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
            value
                .and_then(|s| s.trim().to_lowercase().parse().ok())
                .unwrap_or(default)
        }

        Self {
            db_path: lookup("LISTENER_DB_PATH").unwrap_or_else(|| "rooms.db".to_string()),

            api_live_origin: lookup("API_LIVE_ORIGIN")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.live.bilibili.com".to_string()),

            channel_buffer: parsed(lookup("LISTENER_CHANNEL_BUFFER"), 10_000),
            db_window_days: parsed(lookup("DB_WINDOW_DAYS"), 30),
            db_refresh_interval_ms: parsed(lookup("DB_REFRESH_INTERVAL_MS"), 24 * 60 * 60 * 1000),
            global_listener: parsed(lookup("ENABLE_GLOBAL_LISTENER"), true),
            live_refresh_interval_ms: parsed(lookup("LIVE_REFRESH_INTERVAL_MS"), 5 * 60 * 1000),
            discovery_page_size: parsed(lookup("DISCOVERY_PAGE_SIZE"), 500),
            discovery_page_delay_ms: parsed(lookup("DISCOVERY_PAGE_DELAY_MS"), 3_000),
            health_window_ms: parsed(lookup("HEALTH_WINDOW_MS"), 60_000),
            health_error_threshold: parsed(lookup("HEALTH_ERROR_THRESHOLD"), 300),
            broadcast_poll_delay_ms: parsed(lookup("BROADCAST_POLL_DELAY_MS"), 2_000),
            request_timeout_ms: parsed(lookup("REQUEST_TIMEOUT_MS"), 10_000),
            clock_tick_ms: parsed(lookup("CLOCK_TICK_MS"), 55_000),
            report_utc_offset_hours: parsed(lookup("REPORT_UTC_OFFSET_HOURS"), 8),
            push_every_hours: parsed(lookup("PUSH_EVERY_HOURS"), 6),
            log_unknown_cmds: parsed(lookup("LOG_UNKNOWN_CMDS"), true),

            exclude_cmds: lookup("EXCLUDE_CMDS")
                .map(|s| {
                    s.split(',')
                        .map(|cmd| cmd.trim().to_string())
                        .filter(|cmd| !cmd.is_empty())
                        .collect()
                })
                .unwrap_or_default(),

            cmd_sample_path: lookup("CMD_SAMPLE_PATH").filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.api_live_origin.starts_with("http://") && !self.api_live_origin.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "API_LIVE_ORIGIN must start with http:// or https://".to_string(),
            ));
        }

        let nonzero = [
            ("LISTENER_CHANNEL_BUFFER", self.channel_buffer as u64),
            ("DB_REFRESH_INTERVAL_MS", self.db_refresh_interval_ms),
            ("LIVE_REFRESH_INTERVAL_MS", self.live_refresh_interval_ms),
            ("DISCOVERY_PAGE_SIZE", self.discovery_page_size),
            ("HEALTH_WINDOW_MS", self.health_window_ms),
            ("HEALTH_ERROR_THRESHOLD", self.health_error_threshold),
            ("REQUEST_TIMEOUT_MS", self.request_timeout_ms),
            ("CLOCK_TICK_MS", self.clock_tick_ms),
            ("PUSH_EVERY_HOURS", self.push_every_hours as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} must be greater than 0", name)));
            }
        }

        if !(-12..=14).contains(&self.report_utc_offset_hours) {
            return Err(ConfigError::InvalidValue(format!(
                "REPORT_UTC_OFFSET_HOURS out of range: {}",
                self.report_utc_offset_hours
            )));
        }

        Ok(())
    }

    /// Recency window for persisted rooms in milliseconds
    pub fn db_window_ms(&self) -> i64 {
        (self.db_window_days as i64) * 24 * 60 * 60 * 1000
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
