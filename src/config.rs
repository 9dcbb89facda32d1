use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Outbound connection settings used to reach apps
    #[serde(default)]
    pub transport: TransportSettings,

    /// Application pool settings
    #[serde(default)]
    pub pool: PoolSettings,

    /// Applications keyed by name (e.g. "myapp", "default")
    #[serde(default)]
    pub apps: HashMap<String, AppConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 9280)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Log every proxied exchange in detail
    #[serde(default)]
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            debug: false,
        }
    }
}

/// Timeouts and pooling for connections to apps
#[derive(Debug, Deserialize, Clone)]
pub struct TransportSettings {
    /// TCP connect timeout in milliseconds (default: 5000)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// TCP keep-alive interval in seconds (default: 10)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// TLS handshake timeout for https apps in milliseconds (default: 10000)
    #[serde(default = "default_tls_handshake_timeout")]
    pub tls_handshake_timeout_ms: u64,

    /// Maximum wait for an app's `100 Continue` before sending the body anyway (default: 1000, 0 sends it immediately)
    #[serde(default = "default_expect_continue_timeout")]
    pub expect_continue_timeout_ms: u64,

    /// Maximum time response bytes are buffered before being sent to the client (default: 1000, 0 disables buffering)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Maximum idle connections per app (default: 10)
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            keep_alive_secs: default_keep_alive(),
            tls_handshake_timeout_ms: default_tls_handshake_timeout(),
            expect_continue_timeout_ms: default_expect_continue_timeout(),
            flush_interval_ms: default_flush_interval(),
            max_idle_per_host: default_max_idle_per_host(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_timeout_ms)
    }

    pub fn expect_continue_timeout(&self) -> Duration {
        Duration::from_millis(self.expect_continue_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Settings for the in-memory application pool
#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    /// How long a request waits for a booting app, in seconds (default: 30)
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,

    /// Interval between readiness probes in milliseconds (default: 100)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Number of log lines kept per app (default: 100)
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            boot_timeout_secs: default_boot_timeout(),
            probe_interval_ms: default_probe_interval(),
            log_lines: default_log_lines(),
        }
    }
}

impl PoolSettings {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// Configuration for a single application
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// "http" (default) or "https"
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// host:port the app listens on
    pub address: String,
}

impl AppConfig {
    pub fn http(address: &str) -> Self {
        Self {
            scheme: default_scheme(),
            address: address.to_string(),
        }
    }

    /// Validate the app configuration
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if name.is_empty() {
            return Err("App names must not be empty".to_string());
        }

        // Request hosts are lowercased before matching
        if name.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(format!(
                "App '{}': names must be lowercase (use '{}')",
                name,
                name.to_lowercase()
            ));
        }

        if self.scheme != "http" && self.scheme != "https" {
            return Err(format!(
                "App '{}': scheme must be \"http\" or \"https\", got \"{}\"",
                name, self.scheme
            ));
        }

        if self.address.trim().is_empty() {
            return Err(format!("App '{}': 'address' must not be empty", name));
        }

        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    9280
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_keep_alive() -> u64 {
    10
}

fn default_tls_handshake_timeout() -> u64 {
    10_000
}

fn default_expect_continue_timeout() -> u64 {
    1000
}

fn default_flush_interval() -> u64 {
    1000
}

fn default_max_idle_per_host() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_boot_timeout() -> u64 {
    30
}

fn default_probe_interval() -> u64 {
    100
}

fn default_log_lines() -> usize {
    100
}

fn default_scheme() -> String {
    "http".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut names: Vec<&String> = self.apps.keys().collect();
        names.sort();
        for name in names {
            if let Err(e) = self.apps[name].validate(name) {
                errors.push(e);
            }
        }

        if self.pool.log_lines == 0 {
            errors.push("pool.log_lines must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
