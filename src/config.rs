use std::env;
use std::str::FromStr;
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

// --- CONFIG AGGREGATOR ---

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub log: LogConfig,
    pub topic: SystemTopicConfig,
}

impl Config {
    pub fn global() -> &'static Config {
        CONFIG.get_or_init(Self::load)
    }

    fn load() -> Self {
        dotenv::dotenv().ok();
        Self {
            log: LogConfig::load(),
            topic: SystemTopicConfig::load(),
        }
    }
}

// --- MODULES ---

// LOG
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_level: String,
}

impl LogConfig {
    fn load() -> Self {
        Self {
            log_level: get_env("NEXO_LOG", "info".to_string()),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string() }
    }
}

// TOPICS
/// System-wide defaults applied to every topic unless its options override them.
#[derive(Debug, Clone)]
pub struct SystemTopicConfig {
    pub default_channels: u32,
    pub default_partitions: u32,
    /// Page capacity in element-calculator units.
    pub page_capacity: u64,
    /// Total bytes a topic may hold; 0 means unbounded.
    pub storage_capacity: u64,
    pub retain_consumed: bool,
    pub publisher_max_backlog: u64,
    pub subscriber_max_backlog: u64,
    pub subscriber_timeout_ms: u64,
    pub reconnect_wait_ms: u64,
    pub prefetch: usize,
    /// 0 disables element expiry.
    pub element_expiry_ms: u64,
    pub persistence_path: String,
}

impl SystemTopicConfig {
    fn load() -> Self {
        let defaults = Self::default();
        Self {
            default_channels:       get_env("TOPIC_CHANNELS", defaults.default_channels),
            default_partitions:     get_env("TOPIC_PARTITIONS", defaults.default_partitions),
            page_capacity:          get_env("TOPIC_PAGE_CAPACITY", defaults.page_capacity),
            storage_capacity:       get_env("TOPIC_STORAGE_CAPACITY", defaults.storage_capacity),
            retain_consumed:        get_env("TOPIC_RETAIN_CONSUMED", defaults.retain_consumed),
            publisher_max_backlog:  get_env("TOPIC_PUBLISHER_MAX_BACKLOG", defaults.publisher_max_backlog),
            subscriber_max_backlog: get_env("TOPIC_SUBSCRIBER_MAX_BACKLOG", defaults.subscriber_max_backlog),
            subscriber_timeout_ms:  get_env("TOPIC_SUBSCRIBER_TIMEOUT_MS", defaults.subscriber_timeout_ms),
            reconnect_wait_ms:      get_env("TOPIC_RECONNECT_WAIT_MS", defaults.reconnect_wait_ms),
            prefetch:               get_env("TOPIC_PREFETCH", defaults.prefetch),
            element_expiry_ms:      get_env("TOPIC_ELEMENT_EXPIRY_MS", defaults.element_expiry_ms),
            persistence_path:       get_env("TOPIC_PERSISTENCE_PATH", defaults.persistence_path),
        }
    }
}

impl Default for SystemTopicConfig {
    fn default() -> Self {
        Self {
            default_channels: 17,
            default_partitions: 257,
            page_capacity: 1024 * 1024,       // 1MB
            storage_capacity: 0,              // unbounded
            retain_consumed: false,
            publisher_max_backlog: 10 * 1024 * 1024,
            subscriber_max_backlog: 10_000,
            subscriber_timeout_ms: 30_000,
            reconnect_wait_ms: 1_000,
            prefetch: 64,
            element_expiry_ms: 0,
            persistence_path: "./data/topics".to_string(),
        }
    }
}

// --- PRIVATE HELPER ---

fn get_env<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Config error: {} must be valid, using default", key);
                default
            }
        },
        Err(_) => default,
    }
}
