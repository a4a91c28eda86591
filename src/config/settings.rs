use std::time::Duration;

use serde::Deserialize;

use crate::broker::topic::{LineId, UserId};

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub persistence: PersistenceSettings,
    pub simulation: SimulationSettings,
    pub logging: LoggingSettings,
}

/// Address the WebSocket server binds to and how bearer tokens are signed.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub token_ttl_secs: u64,
}

/// Fan-out limits: connection cap, per-connection queue size and the
/// timeouts bounding socket writes and notification persistence.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub max_connections: usize,
    pub queue_capacity: usize,
    pub write_timeout_ms: u64,
    pub persist_timeout_ms: u64,
    /// Capacity of the producer -> publisher channel.
    pub feed_buffer: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PersistenceSettings {
    pub path: String,
    /// 0 keeps notifications forever.
    pub retention_days: u64,
    pub sweep_interval_secs: u64,
    /// JSON file with the line topology; the built-in network when unset.
    pub topology_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SimulationSettings {
    pub enabled: bool,
    pub tick_ms: u64,
    pub trains_per_line: usize,
    pub delay_probability: f64,
    pub arrival_window_secs: u64,
    pub seed: Option<u64>,
    pub watchers: Vec<Watcher>,
}

/// A user who gets arrival and delay notifications for one line.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Watcher {
    pub user: UserId,
    pub line: LineId,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

impl ServerSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

impl BrokerSettings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }
}

impl PersistenceSettings {
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_days > 0).then(|| Duration::from_secs(self.retention_days * 24 * 60 * 60))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl SimulationSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn arrival_window(&self) -> Duration {
        Duration::from_secs(self.arrival_window_secs)
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub simulation: Option<PartialSimulationSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub jwt_secret: Option<String>,
    pub token_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub write_timeout_ms: Option<u64>,
    pub persist_timeout_ms: Option<u64>,
    pub feed_buffer: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPersistenceSettings {
    pub path: Option<String>,
    pub retention_days: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub topology_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialSimulationSettings {
    pub enabled: Option<bool>,
    pub tick_ms: Option<u64>,
    pub trains_per_line: Option<usize>,
    pub delay_probability: Option<f64>,
    pub arrival_window_secs: Option<u64>,
    pub seed: Option<u64>,
    pub watchers: Option<Vec<Watcher>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fill every missing value from `default`.
    pub fn merge(self, default: Settings) -> Settings {
        Settings {
            server: self.server.unwrap_or_default().merge(default.server),
            broker: self.broker.unwrap_or_default().merge(default.broker),
            persistence: self
                .persistence
                .unwrap_or_default()
                .merge(default.persistence),
            simulation: self
                .simulation
                .unwrap_or_default()
                .merge(default.simulation),
            logging: self.logging.unwrap_or_default().merge(default.logging),
        }
    }
}

impl PartialServerSettings {
    fn merge(self, default: ServerSettings) -> ServerSettings {
        ServerSettings {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
            jwt_secret: self.jwt_secret.unwrap_or(default.jwt_secret),
            token_ttl_secs: self.token_ttl_secs.unwrap_or(default.token_ttl_secs),
        }
    }
}

impl PartialBrokerSettings {
    fn merge(self, default: BrokerSettings) -> BrokerSettings {
        BrokerSettings {
            max_connections: self.max_connections.unwrap_or(default.max_connections),
            queue_capacity: self.queue_capacity.unwrap_or(default.queue_capacity),
            write_timeout_ms: self.write_timeout_ms.unwrap_or(default.write_timeout_ms),
            persist_timeout_ms: self.persist_timeout_ms.unwrap_or(default.persist_timeout_ms),
            feed_buffer: self.feed_buffer.unwrap_or(default.feed_buffer),
        }
    }
}

impl PartialPersistenceSettings {
    fn merge(self, default: PersistenceSettings) -> PersistenceSettings {
        PersistenceSettings {
            path: self.path.unwrap_or(default.path),
            retention_days: self.retention_days.unwrap_or(default.retention_days),
            sweep_interval_secs: self
                .sweep_interval_secs
                .unwrap_or(default.sweep_interval_secs),
            topology_path: self.topology_path.or(default.topology_path),
        }
    }
}

impl PartialSimulationSettings {
    fn merge(self, default: SimulationSettings) -> SimulationSettings {
        SimulationSettings {
            enabled: self.enabled.unwrap_or(default.enabled),
            tick_ms: self.tick_ms.unwrap_or(default.tick_ms),
            trains_per_line: self.trains_per_line.unwrap_or(default.trains_per_line),
            delay_probability: self.delay_probability.unwrap_or(default.delay_probability),
            arrival_window_secs: self
                .arrival_window_secs
                .unwrap_or(default.arrival_window_secs),
            seed: self.seed.or(default.seed),
            watchers: self.watchers.unwrap_or(default.watchers),
        }
    }
}

impl PartialLoggingSettings {
    fn merge(self, default: LoggingSettings) -> LoggingSettings {
        LoggingSettings {
            level: self.level.unwrap_or(default.level),
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                jwt_secret: "change-me".to_string(),
                token_ttl_secs: 24 * 60 * 60,
            },
            broker: BrokerSettings {
                max_connections: 1000,
                queue_capacity: 100,
                write_timeout_ms: 3000,
                persist_timeout_ms: 1000,
                feed_buffer: 256,
            },
            persistence: PersistenceSettings {
                path: "railsub_db".to_string(),
                retention_days: 30,
                sweep_interval_secs: 3600,
                topology_path: None,
            },
            simulation: SimulationSettings {
                enabled: true,
                tick_ms: 2000,
                trains_per_line: 4,
                delay_probability: 0.02,
                arrival_window_secs: 300,
                seed: None,
                watchers: Vec::new(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}
