//! The `config` module loads the server configuration.
//!
//! Values come from an optional `config/default.*` file, then from
//! `CMDBUS_*` environment variables (`__` separates nested keys, as in
//! `CMDBUS_GATEWAY__FEED_PATH`), and whatever neither provides falls back to
//! [`Settings::default`].

mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BusSettings, GatewaySettings, LoggingSettings, ServerSettings, Settings};

pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("CMDBUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge_onto(Settings::default()))
}
