//! Application settings and configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Root configuration structure containing all application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Server configuration (host, port)
    pub server: ServerSettings,

    /// Redis configuration for the presence cache
    pub redis: RedisSettings,

    /// Presence entry layout and expiry
    pub presence: PresenceSettings,

    /// Routing mode selection
    pub messaging: MessagingSettings,

    /// Message bus configuration (used only in bus mode)
    pub bus: BusSettings,

    /// Connection hub configuration
    pub hub: HubSettings,

    /// Shutdown configuration
    pub shutdown: ShutdownSettings,

    /// Static group membership: group id -> member user ids
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,

    /// Current environment (development, staging, production)
    pub environment: String,
}

/// Server binding configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Host address to bind to (e.g., "0.0.0.0")
    pub host: String,

    /// Port number to listen on
    pub port: u16,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    /// Redis connection URL
    pub url: String,

    /// Connection attempts before startup fails
    pub connect_attempts: u32,

    /// Fixed delay between connection attempts in milliseconds
    pub connect_backoff_ms: u64,

    /// Dial timeout per attempt in milliseconds
    pub dial_timeout_ms: u64,
}

/// Presence cache layout.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceSettings {
    /// Namespace prefix of presence keys (one key per online user id)
    pub key_prefix: String,

    /// Expiry of a presence entry in seconds; refreshed while the connection lives
    pub ttl_secs: u64,
}

/// Routing mode selection.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagingSettings {
    pub mode: MessageMode,
}

/// How messages travel from sender to recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageMode {
    /// In-process delivery through the connection hub
    Channel,
    /// Delivery through the external message bus
    #[serde(alias = "kafka")]
    Bus,
}

impl MessageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageMode::Channel => "channel",
            MessageMode::Bus => "bus",
        }
    }
}

impl std::fmt::Display for MessageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a freshly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartFrom {
    /// Replay everything still retained on the partition
    Earliest,
    /// Only records appended after the group was created
    Latest,
}

/// Message bus configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BusSettings {
    /// Bus endpoint URL
    pub url: String,

    /// Topic carrying login notices
    pub login_topic: String,

    /// Topic carrying logout notices
    pub logout_topic: String,

    /// Topic carrying chat messages
    pub chat_topic: String,

    /// Partitions per topic
    pub partitions: u32,

    /// Operation timeout (publish, read, ack) in milliseconds
    pub timeout_ms: u64,

    /// Consumer group prefix; each instance reads through `<group>-<instance_id>`
    pub consumer_group: String,

    /// Stable identity of this instance
    pub instance_id: String,

    /// Start position of a newly created consumer group
    pub start_from: StartFrom,

    /// Records older than this many seconds are acknowledged without delivery (0 = no limit)
    pub replay_window_secs: u64,

    /// Destroy this instance's consumer group on a clean close. Defaults to
    /// on unless `APP__BUS__INSTANCE_ID` pins the instance id.
    pub remove_group_on_close: bool,

    /// Append attempts per record before it is dropped
    pub publish_attempts: u32,

    /// Base backoff between append attempts in milliseconds (multiplied by the attempt number)
    pub retry_backoff_ms: u64,

    /// Capacity of the producer queue
    pub publish_buffer: usize,

    /// Records fetched per read
    pub read_batch: usize,

    /// Idle delay between empty reads in milliseconds
    pub poll_interval_ms: u64,

    /// Approximate record cap per partition
    pub max_len: usize,

    /// Connection attempts at startup
    pub connect_attempts: u32,

    /// Fixed delay between connection attempts in milliseconds
    pub connect_backoff_ms: u64,

    /// Dial timeout per attempt in milliseconds
    pub dial_timeout_ms: u64,
}

/// Connection hub configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HubSettings {
    /// Outbound queue capacity per connection
    pub queue_capacity: usize,

    /// Server ping interval in seconds
    pub ping_interval_secs: u64,

    /// A connection silent for this long is closed
    pub idle_timeout_secs: u64,

    /// Maximum inbound message size in bytes
    pub max_message_size: usize,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSettings {
    /// Upper bound for each shutdown step in seconds
    pub timeout_secs: u64,
}

impl Settings {
    /// Load settings from environment variables and configuration files.
    ///
    /// The loading order is:
    /// 1. config/default.toml (base configuration)
    /// 2. config/{RUN_ENV}.toml (environment-specific overrides)
    /// 3. Environment variables (highest priority)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if configuration cannot be loaded or parsed,
    /// or if the routing settings are inconsistent.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        // Determine the running environment
        let environment = std::env::var("RUN_ENV").unwrap_or_else(|_| "development".into());
        let instance_pinned = std::env::var("APP__BUS__INSTANCE_ID").is_ok();
        let instance_id = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            format!("relay-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
        });

        Config::builder()
            .set_default("environment", environment.clone())?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("redis.url", "redis://127.0.0.1:6379")?
            .set_default("redis.connect_attempts", 3)?
            .set_default("redis.connect_backoff_ms", 1000)?
            .set_default("redis.dial_timeout_ms", 5000)?
            .set_default("presence.key_prefix", "presence:")?
            .set_default("presence.ttl_secs", 300)?
            .set_default("messaging.mode", "channel")?
            .set_default("bus.url", "redis://127.0.0.1:6379")?
            .set_default("bus.login_topic", "login")?
            .set_default("bus.logout_topic", "logout")?
            .set_default("bus.chat_topic", "chat")?
            .set_default("bus.partitions", 1)?
            .set_default("bus.timeout_ms", 1000)?
            .set_default("bus.consumer_group", "chat-relay")?
            .set_default("bus.instance_id", instance_id)?
            .set_default("bus.start_from", "earliest")?
            .set_default("bus.replay_window_secs", 300)?
            .set_default("bus.remove_group_on_close", !instance_pinned)?
            .set_default("bus.publish_attempts", 3)?
            .set_default("bus.retry_backoff_ms", 200)?
            .set_default("bus.publish_buffer", 1024)?
            .set_default("bus.read_batch", 64)?
            .set_default("bus.poll_interval_ms", 100)?
            .set_default("bus.max_len", 100_000)?
            .set_default("bus.connect_attempts", 3)?
            .set_default("bus.connect_backoff_ms", 1000)?
            .set_default("bus.dial_timeout_ms", 5000)?
            .set_default("hub.queue_capacity", 256)?
            .set_default("hub.ping_interval_secs", 30)?
            .set_default("hub.idle_timeout_secs", 90)?
            .set_default("hub.max_message_size", 65536_i64)? // 64KB
            .set_default("shutdown.timeout_secs", 10)?
            // Load from config files
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Load from environment variables
            // APP__BUS__PARTITIONS=4 -> bus.partitions = 4
            .add_source(
                Environment::default()
                    .prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            // Map simple environment variables
            .set_override_option("server.host", std::env::var("SERVER_HOST").ok())?
            .set_override_option("server.port", std::env::var("SERVER_PORT").ok())?
            .set_override_option("redis.url", std::env::var("REDIS_URL").ok())?
            .set_override_option("bus.url", std::env::var("BUS_URL").ok())?
            .set_override_option("messaging.mode", std::env::var("MESSAGE_MODE").ok())?
            .build()?
            .try_deserialize()
            .and_then(|settings: Self| {
                settings.validate()?;
                Ok(settings)
            })
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.partitions == 0 {
            return Err(ConfigError::Message(
                "bus.partitions must be at least 1".into(),
            ));
        }
        if self.hub.queue_capacity == 0 {
            return Err(ConfigError::Message(
                "hub.queue_capacity must be at least 1".into(),
            ));
        }
        if self.hub.ping_interval_secs == 0 || self.hub.idle_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "hub.ping_interval_secs and hub.idle_timeout_secs must be at least 1".into(),
            ));
        }
        let topics = [
            &self.bus.login_topic,
            &self.bus.logout_topic,
            &self.bus.chat_topic,
        ];
        if topics.iter().any(|t| t.is_empty()) {
            return Err(ConfigError::Message("bus topic names must not be empty".into()));
        }
        if topics[0] == topics[1] || topics[0] == topics[2] || topics[1] == topics[2] {
            return Err(ConfigError::Message("bus topic names must be distinct".into()));
        }
        Ok(())
    }

    /// Get the full server address as a string.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl RedisSettings {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }
}

impl PresenceSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl BusSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Oldest record age still delivered; `None` delivers everything.
    pub fn replay_window(&self) -> Option<Duration> {
        (self.replay_window_secs > 0).then(|| Duration::from_secs(self.replay_window_secs))
    }

    /// Consumer group of this instance; distinct per instance so every
    /// instance sees every record.
    pub fn group_name(&self) -> String {
        format!("{}-{}", self.consumer_group, self.instance_id)
    }
}

impl HubSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ShutdownSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
