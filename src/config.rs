//! Server configuration module
//! Handles dynamic configuration parameters for the chat relay

use crate::constants::*;
use crate::error::{Result, RustyChatError};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum number of registered sessions before new sockets are turned away
    pub max_connections: usize,
    /// Largest inbound frame accepted, in bytes
    pub max_message_size: usize,
    /// Capacity of each session's outbound queue
    pub send_queue_capacity: usize,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_interval: Duration,
    /// Rate limit: chat/private messages per window per session
    pub rate_limit_messages: usize,
    pub rate_limit_window: Duration,
    pub cleanup_interval: Duration,
    pub idle_timeout: Duration,
    /// Period of the connection stats log line
    pub stats_interval: Duration,
    pub hub_restart_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            write_wait: Duration::from_secs(DEFAULT_WRITE_WAIT_SECS),
            pong_wait: Duration::from_secs(DEFAULT_PONG_WAIT_SECS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            rate_limit_messages: DEFAULT_RATE_LIMIT_MESSAGES,
            rate_limit_window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
            hub_restart_delay: Duration::from_millis(HUB_RESTART_DELAY_MS),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs_or(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl ServerConfig {
    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let host = env::var("RUSTY_CHAT_HOST").unwrap_or(defaults.host);
        let port = env_or("RUSTY_CHAT_PORT", defaults.port);

        let pong_wait = env_secs_or("RUSTY_CHAT_PONG_WAIT_SECS", defaults.pong_wait);
        // Follow the pong wait unless the ping period is set explicitly
        let ping_interval = env_secs_or("RUSTY_CHAT_PING_SECS", pong_wait * 9 / 10);

        let config = Self {
            host,
            port,
            max_connections: env_or("RUSTY_CHAT_MAX_CONN", defaults.max_connections),
            max_message_size: env_or("RUSTY_CHAT_MAX_MESSAGE_SIZE", defaults.max_message_size),
            send_queue_capacity: env_or("RUSTY_CHAT_SEND_QUEUE", defaults.send_queue_capacity),
            write_wait: env_secs_or("RUSTY_CHAT_WRITE_WAIT_SECS", defaults.write_wait),
            pong_wait,
            ping_interval,
            rate_limit_messages: env_or(
                "RUSTY_CHAT_RATE_LIMIT_MSG_PER_MIN",
                defaults.rate_limit_messages,
            ),
            rate_limit_window: env_secs_or(
                "RUSTY_CHAT_RATE_LIMIT_WINDOW_SECS",
                defaults.rate_limit_window,
            ),
            cleanup_interval: env_secs_or("RUSTY_CHAT_CLEANUP_SECS", defaults.cleanup_interval),
            idle_timeout: env_secs_or("RUSTY_CHAT_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            stats_interval: env_secs_or("RUSTY_CHAT_STATS_SECS", defaults.stats_interval),
            hub_restart_delay: defaults.hub_restart_delay,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the relationships between settings
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(RustyChatError::ConfigError(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        if self.send_queue_capacity == 0 {
            return Err(RustyChatError::ConfigError(
                "send queue capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(RustyChatError::ConfigError(
                "max message size must be greater than zero".to_string(),
            ));
        }
        if self.ping_interval.is_zero() || self.ping_interval >= self.pong_wait {
            return Err(RustyChatError::ConfigError(format!(
                "ping interval ({:?}) must be non-zero and shorter than pong wait ({:?})",
                self.ping_interval, self.pong_wait
            )));
        }
        if self.rate_limit_window.is_zero() {
            return Err(RustyChatError::ConfigError(
                "rate limit window must be greater than zero".to_string(),
            ));
        }
        if self.cleanup_interval.is_zero() || self.stats_interval.is_zero() {
            return Err(RustyChatError::ConfigError(
                "cleanup and stats intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
