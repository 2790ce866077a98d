//! Configuration loading.
//!
//! Settings come from an optional `config/default.*` file and from
//! `BUSADAPTER_`-prefixed environment variables (`__` separates sections,
//! e.g. `BUSADAPTER_BROKER__HOST`). Anything left unspecified falls back to
//! `Settings::default()`.

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{AdapterConfig, ClientSettings, LogSettings, Settings};

pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("BUSADAPTER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    let broker = partial.broker.as_ref();
    let client = partial.client.as_ref();

    Ok(Settings {
        broker: AdapterConfig {
            host: broker
                .and_then(|b| b.host.clone())
                .unwrap_or(default.broker.host),
            port: broker.and_then(|b| b.port).unwrap_or(default.broker.port),
            username: broker
                .and_then(|b| b.username.clone())
                .unwrap_or(default.broker.username),
            password: broker
                .and_then(|b| b.password.clone())
                .unwrap_or(default.broker.password),
        },
        client: ClientSettings {
            connect_timeout_ms: client
                .and_then(|c| c.connect_timeout_ms)
                .unwrap_or(default.client.connect_timeout_ms),
            ping_timeout_ms: client
                .and_then(|c| c.ping_timeout_ms)
                .unwrap_or(default.client.ping_timeout_ms),
            request_timeout_ms: client
                .and_then(|c| c.request_timeout_ms)
                .unwrap_or(default.client.request_timeout_ms),
            reconnect_attempts: client
                .and_then(|c| c.reconnect_attempts)
                .unwrap_or(default.client.reconnect_attempts),
            reconnect_delay_ms: client
                .and_then(|c| c.reconnect_delay_ms)
                .unwrap_or(default.client.reconnect_delay_ms),
        },
        logging: LogSettings {
            level: partial
                .logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
        },
    })
}
