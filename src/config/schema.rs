use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Shared packet buffer pool
    #[serde(default)]
    pub buffer_pool: BufferPoolConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ============================================================================
// Listener / Connection Configuration
// ============================================================================

/// Settings consumed by the listener and by every connection it spawns
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Version string sent in the initial handshake
    #[serde(default = "default_server_version")]
    pub server_version: String,
    /// Read buffer size per connection; 0 reads straight from the socket
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,
    /// Write buffer size used while a buffered-write session is open
    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,
    /// Inactivity delay before buffered writes are flushed (milliseconds)
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
    /// Stream multi-statement results through `Handler::com_query_multi`
    #[serde(default)]
    pub multi_query: bool,
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
    /// Warn about handshakes slower than this (milliseconds, 0 disables)
    #[serde(default)]
    pub slow_connect_warn_threshold_ms: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    3306
}

fn default_server_version() -> String {
    "8.0.30-mysqlwire".to_string()
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_flush_delay_ms() -> u64 {
    100
}

fn default_nodelay() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            server_version: default_server_version(),
            read_buffer_size: default_buffer_size(),
            write_buffer_size: default_buffer_size(),
            flush_delay_ms: default_flush_delay_ms(),
            multi_query: false,
            nodelay: default_nodelay(),
            slow_connect_warn_threshold_ms: 0,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn slow_connect_warn_threshold(&self) -> Option<Duration> {
        if self.slow_connect_warn_threshold_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.slow_connect_warn_threshold_ms))
        }
    }
}

// ============================================================================
// Buffer Pool Configuration
// ============================================================================

/// Size classes are powers of two from `min_size` up to `max_size`
#[derive(Debug, Clone, Deserialize)]
pub struct BufferPoolConfig {
    #[serde(default = "default_pool_min_size")]
    pub min_size: usize,
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
    /// Free buffers kept per size class; extra returns are dropped
    #[serde(default = "default_max_retained_per_class")]
    pub max_retained_per_class: usize,
}

fn default_pool_min_size() -> usize {
    1024
}

fn default_pool_max_size() -> usize {
    16 * 1024 * 1024
}

fn default_max_retained_per_class() -> usize {
    32
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_pool_min_size(),
            max_size: default_pool_max_size(),
            max_retained_per_class: default_max_retained_per_class(),
        }
    }
}

// ============================================================================
// Metrics Configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9104".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}
