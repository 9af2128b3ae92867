// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const WS_PATH: &str = "ws";

// Admission control
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

// Transport limits
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024;
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_WRITE_WAIT_SECS: u64 = 10;
pub const DEFAULT_PONG_WAIT_SECS: u64 = 60;
/// Must stay below the pong wait so an idle peer is probed before its deadline
pub const DEFAULT_PING_INTERVAL_SECS: u64 = DEFAULT_PONG_WAIT_SECS * 9 / 10;

// Rate limiting
pub const DEFAULT_RATE_LIMIT_MESSAGES: usize = 30;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

// Hub maintenance
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 5 * 60;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;
pub const HUB_RESTART_DELAY_MS: u64 = 1000;
pub const HUB_EVENT_QUEUE_CAPACITY: usize = 1024;

/// Sessions quiet for longer than this count as idle in connection stats
pub const STATS_IDLE_THRESHOLD_SECS: u64 = 5 * 60;

// Wire validation limits (in characters, after trimming)
pub const MAX_DISPLAY_NAME_LENGTH: usize = 50;
pub const MAX_MESSAGE_CONTENT_LENGTH: usize = 1000;
