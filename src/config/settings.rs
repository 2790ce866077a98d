use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Includes the broker connection parameters, transport tuning and logging.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub broker: AdapterConfig,
    pub client: ClientSettings,
    pub logging: LogSettings,
}

/// Connection parameters for the broker.
///
/// Set once by `BusAdapter::configure` and replaced wholesale when
/// reconfigured.
#[derive(Deserialize, Clone, Default, PartialEq, Eq)]
pub struct AdapterConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl AdapterConfig {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// Transport address in `host:port` form.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for AdapterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Transport tuning: handshake, ping and request timeouts plus the
/// reconnect policy of the WebSocket client.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    pub connect_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl ClientSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub client: Option<PartialClientSettings>,
    pub logging: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialClientSettings {
    pub connect_timeout_ms: Option<u64>,
    pub ping_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub reconnect_attempts: Option<u32>,
    pub reconnect_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            ping_timeout_ms: 2000,
            request_timeout_ms: 5000,
            reconnect_attempts: 10,
            reconnect_delay_ms: 500,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: AdapterConfig::new("127.0.0.1", 4222, "", ""),
            client: ClientSettings::default(),
            logging: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}
