//! Loading of the server configuration.
//!
//! Values come from an optional `config/default` file and from `POPMQ_`
//! prefixed environment variables (`POPMQ_BROKER__MEMORY_LIMIT_BYTES=...`),
//! then get merged over `Settings::default()`.

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, DeadLetterPolicy, DeadLetterVariant, DestinationPolicy, FlowControlPolicy,
    ServerSettings, Settings,
};

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as `load_config` but reads the given file (extension optional).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("POPMQ")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    let server = partial.server;
    let broker = partial.broker;

    Ok(Settings {
        server: crate::config::ServerSettings {
            host: server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
        },
        broker: crate::config::BrokerSettings {
            data_dir: broker
                .as_ref()
                .and_then(|b| b.data_dir.clone())
                .or(default.broker.data_dir),
            memory_limit_bytes: broker
                .as_ref()
                .and_then(|b| b.memory_limit_bytes)
                .unwrap_or(default.broker.memory_limit_bytes),
            store_limit_bytes: broker
                .as_ref()
                .and_then(|b| b.store_limit_bytes)
                .unwrap_or(default.broker.store_limit_bytes),
            gc_sweep_period_ms: broker
                .as_ref()
                .and_then(|b| b.gc_sweep_period_ms)
                .unwrap_or(default.broker.gc_sweep_period_ms),
            max_purged_destinations_per_sweep: broker
                .as_ref()
                .and_then(|b| b.max_purged_destinations_per_sweep)
                .unwrap_or(default.broker.max_purged_destinations_per_sweep),
            expire_sweep_period_ms: broker
                .as_ref()
                .and_then(|b| b.expire_sweep_period_ms)
                .unwrap_or(default.broker.expire_sweep_period_ms),
            log_level: broker
                .as_ref()
                .and_then(|b| b.log_level.clone())
                .unwrap_or(default.broker.log_level),
        },
        policy: partial.policy.unwrap_or(default.policy),
    })
}

#[cfg(test)]
mod tests;
