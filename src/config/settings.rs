use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration of the `cmdbus` server.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub gateway: GatewaySettings,
    pub bus: BusSettings,
    pub logging: LoggingSettings,
}

/// Address the WebSocket gateway binds to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Request paths of the two WebSocket endpoints.
///
/// Feeds connect on `<feed_path>/<feedId>`, UI clients on `ui_path`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct GatewaySettings {
    pub feed_path: String,
    pub ui_path: String,
    pub async_send_timeout_ms: Option<u64>,
}

impl GatewaySettings {
    pub fn async_send_timeout(&self) -> Option<Duration> {
        self.async_send_timeout_ms.map(Duration::from_millis)
    }
}

/// Broker-side behaviour of the gateway.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BusSettings {
    /// Share one broker connection across every context the gateway opens.
    pub reuse_connection: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Settings as read from files and the environment, every value optional.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub gateway: Option<PartialGatewaySettings>,
    pub bus: Option<PartialBusSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialGatewaySettings {
    pub feed_path: Option<String>,
    pub ui_path: Option<String>,
    pub async_send_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBusSettings {
    pub reuse_connection: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            gateway: GatewaySettings {
                feed_path: "/feed".to_string(),
                ui_path: "/ui/ws".to_string(),
                async_send_timeout_ms: None,
            },
            bus: BusSettings {
                reuse_connection: true,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl PartialSettings {
    /// Fills every missing value from `defaults`.
    pub fn merge_onto(self, defaults: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let gateway = self.gateway.unwrap_or_default();
        let bus = self.bus.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(defaults.server.host),
                port: server.port.unwrap_or(defaults.server.port),
            },
            gateway: GatewaySettings {
                feed_path: gateway.feed_path.unwrap_or(defaults.gateway.feed_path),
                ui_path: gateway.ui_path.unwrap_or(defaults.gateway.ui_path),
                async_send_timeout_ms: gateway
                    .async_send_timeout_ms
                    .or(defaults.gateway.async_send_timeout_ms),
            },
            bus: BusSettings {
                reuse_connection: bus.reuse_connection.unwrap_or(defaults.bus.reuse_connection),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(defaults.logging.level),
            },
        }
    }
}
