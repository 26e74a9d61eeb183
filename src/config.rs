//! Gateway configuration surface.
//!
//! One struct, grouped by concern the way `server.*`/`pool.*`/`security.*`/
//! `otma.*`/`system_messages.*`/`backends[*]` are grouped, each field backed
//! by a validated domain type so out-of-range values are rejected at
//! construction rather than deep inside a running server. Named presets
//! (`development`, `production`, `testing`) and a chained builder mirror the
//! router configuration this pattern was learned from.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain_types::{
    BackendWeight, ConversationHistoryCap, MaxConversations, MaxSegmentSize, PortNumber,
    QueueCapacity,
};

/// Errors raised while building or loading a [`GatewayConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed a cross-field or range check.
    #[error("invalid configuration field `{field}`: {reason}")]
    ValidationError {
        /// The offending field's name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// Reading or writing the config file failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The config file's contents were not valid JSON for this schema.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// `server.*` settings: the TCP listener and per-connection idle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `server.port`, default 9999.
    pub port: PortNumber,
    /// `server.boss_threads`, default 1 — size of the accept-loop thread group.
    pub boss_threads: usize,
    /// `server.worker_threads`, defaults to the host's available parallelism.
    pub worker_threads: usize,
    /// `server.backlog`, default 128.
    pub backlog: u32,
    /// `server.keepalive`, default true.
    pub keepalive: bool,
    /// `server.tcp_no_delay`, default true.
    pub tcp_no_delay: bool,
    /// `server.read_idle_sec`, default 300.
    pub read_idle_sec: u64,
    /// `server.write_idle_sec`, default 300.
    pub write_idle_sec: u64,
    /// `server.all_idle_sec`, default 600.
    pub all_idle_sec: u64,
    /// `server.shutdown_timeout_sec`, default 30.
    pub shutdown_timeout_sec: u64,
    /// `server.max_message_size`, default 32768.
    pub max_message_size: MaxSegmentSize,
    /// `server.datastore_name`, default `"IMSA"`.
    pub datastore_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: PortNumber::default(),
            boss_threads: 1,
            worker_threads: std::thread::available_parallelism().map_or(4, std::num::NonZero::get),
            backlog: 128,
            keepalive: true,
            tcp_no_delay: true,
            read_idle_sec: 300,
            write_idle_sec: 300,
            all_idle_sec: 600,
            shutdown_timeout_sec: 30,
            max_message_size: MaxSegmentSize::default(),
            datastore_name: "IMSA".to_string(),
        }
    }
}

/// `pool.*` settings: backend connection pool sizing and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// `pool.min_per_backend`, default 2.
    pub min_per_backend: usize,
    /// `pool.max_per_backend`, default 20.
    pub max_per_backend: usize,
    /// `pool.connect_timeout_ms`, default 5000.
    pub connect_timeout_ms: u64,
    /// `pool.max_idle_ms`, default 300000.
    pub max_idle_ms: u64,
    /// `pool.health_check_interval_ms`, default 30000.
    pub health_check_interval_ms: u64,
    /// `pool.max_retries`, default 3.
    pub max_retries: u32,
    /// `pool.retry_delay_ms`, default 1000.
    pub retry_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_per_backend: 2,
            max_per_backend: 20,
            connect_timeout_ms: 5000,
            max_idle_ms: 300_000,
            health_check_interval_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

/// `security.*` and `security.ssl.*` settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// `security.enabled`, default false.
    pub enabled: bool,
    /// `security.ssl.enabled`, default false.
    pub ssl_enabled: bool,
    /// `security.ssl.client_auth_required`, default false.
    pub ssl_client_auth_required: bool,
    /// `security.ssl.protocols`, default `["TLSv1.2", "TLSv1.3"]`.
    pub ssl_protocols: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ssl_enabled: false,
            ssl_client_auth_required: false,
            ssl_protocols: vec!["TLSv1.2".to_string(), "TLSv1.3".to_string()],
        }
    }
}

/// `otma.*` settings: conversation bounds and audit policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtmaConfig {
    /// `otma.enabled`, default true.
    pub enabled: bool,
    /// `otma.conversations.max`, default 1000.
    pub conversations_max: MaxConversations,
    /// `otma.conversations.timeout_ms`, default 300000.
    pub conversations_timeout_ms: u64,
    /// `otma.conversations.cleanup_ms`, default 60000.
    pub conversations_cleanup_ms: u64,
    /// `otma.security.audit_enabled`, default true.
    pub security_audit_enabled: bool,
    /// `otma.security.token_validation_enabled`, default true.
    pub security_token_validation_enabled: bool,
    /// `otma.security.exempt_codes`, transaction codes that skip C10.
    pub security_exempt_codes: Vec<String>,
}

impl Default for OtmaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            conversations_max: MaxConversations::default(),
            conversations_timeout_ms: 300_000,
            conversations_cleanup_ms: 60_000,
            security_audit_enabled: true,
            security_token_validation_enabled: true,
            security_exempt_codes: Vec::new(),
        }
    }
}

/// `system_messages.*` settings for the built-in `IMS.CONNECT` handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMessagesConfig {
    /// `system_messages.enabled`, default true.
    pub enabled: bool,
    /// `system_messages.ping`, default true.
    pub ping: bool,
    /// `system_messages.notify`, default true.
    pub notify: bool,
    /// `system_messages.echo`, default true.
    pub echo: bool,
    /// `system_messages.status`, default true.
    pub status: bool,
    /// `system_messages.require_auth`, default false.
    pub require_auth: bool,
    /// `system_messages.max_message_size`, default 1024.
    pub max_message_size: usize,
}

impl Default for SystemMessagesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ping: true,
            notify: true,
            echo: true,
            status: true,
            require_auth: false,
            max_message_size: 1024,
        }
    }
}

/// One entry of `backends[*]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend name, used as the pool key.
    pub name: String,
    /// Backend host name or address.
    pub host: String,
    /// Backend TCP port.
    pub port: u16,
    /// Whether connections to this backend use SSL.
    pub ssl_enabled: bool,
    /// Load-balancer weight (only consulted by `WeightedRoundRobin`).
    pub weight: BackendWeight,
    /// Per-connection health check timeout, milliseconds.
    pub health_check_timeout_ms: u64,
    /// IMS datastore name this backend serves.
    pub datastore_name: String,
}

/// The full gateway configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener and idle-timeout policy.
    pub server: ServerConfig,
    /// Backend connection pool sizing.
    pub pool: PoolConfig,
    /// Authentication and TLS policy.
    pub security: SecurityConfig,
    /// Conversation bounds and audit policy.
    pub otma: OtmaConfig,
    /// Built-in system message handler policy.
    pub system_messages: SystemMessagesConfig,
    /// Per-client queue capacity.
    pub queue_capacity: QueueCapacity,
    /// Per-conversation bounded history length.
    pub conversation_history_cap: ConversationHistoryCap,
    /// Registered backend IMS systems.
    pub backends: Vec<BackendConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            pool: PoolConfig::default(),
            security: SecurityConfig::default(),
            otma: OtmaConfig::default(),
            system_messages: SystemMessagesConfig::default(),
            queue_capacity: QueueCapacity::default(),
            conversation_history_cap: ConversationHistoryCap::default(),
            backends: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// A configuration suited to local development: security disabled, a
    /// single loopback backend, short cleanup intervals for fast feedback.
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();
        config.security.enabled = false;
        config.otma.conversations_cleanup_ms = 5_000;
        config.backends.push(BackendConfig {
            name: "local".to_string(),
            host: "127.0.0.1".to_string(),
            port: 7000,
            ssl_enabled: false,
            weight: BackendWeight::default(),
            health_check_timeout_ms: 1000,
            datastore_name: "IMSA".to_string(),
        });
        config
    }

    /// A configuration suited to production: security required, TLS
    /// required, conservative timeouts.
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();
        config.security.enabled = true;
        config.security.ssl_enabled = true;
        config.security.ssl_client_auth_required = true;
        config.pool.max_per_backend = 50;
        config
    }

    /// A configuration suited to automated tests: tiny bounds so capacity
    /// and timeout logic can be exercised without waiting on real-world
    /// durations.
    #[must_use]
    pub fn testing() -> Self {
        let mut config = Self::default();
        config.otma.conversations_max = MaxConversations::try_new(4).expect("4 > 0");
        config.queue_capacity = QueueCapacity::try_new(4).expect("4 > 0");
        config.otma.conversations_timeout_ms = 200;
        config.otma.conversations_cleanup_ms = 50;
        config
    }

    /// Cross-field validation beyond what the individual domain types
    /// already enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.min_per_backend > self.pool.max_per_backend {
            return Err(ConfigError::ValidationError {
                field: "pool.min_per_backend",
                reason: "must be <= pool.max_per_backend".to_string(),
            });
        }
        if self.security.ssl_client_auth_required && !self.security.ssl_enabled {
            return Err(ConfigError::ValidationError {
                field: "security.ssl.client_auth_required",
                reason: "requires security.ssl.enabled".to_string(),
            });
        }
        if self.otma.conversations_cleanup_ms == 0 {
            return Err(ConfigError::ValidationError {
                field: "otma.conversations.cleanup_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.server.backlog == 0 {
            return Err(ConfigError::ValidationError {
                field: "server.backlog",
                reason: "must be > 0".to_string(),
            });
        }
        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(ConfigError::ValidationError {
                    field: "backends[*].name",
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Writes this configuration as pretty-printed JSON.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reads and validates a configuration from a JSON file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }
}

/// Chained builder over [`GatewayConfig`], validating on [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Starts from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `server.port`.
    #[must_use]
    pub fn port(mut self, port: PortNumber) -> Self {
        self.config.server.port = port;
        self
    }

    /// Sets `pool.max_per_backend`.
    #[must_use]
    pub fn max_per_backend(mut self, max: usize) -> Self {
        self.config.pool.max_per_backend = max;
        self
    }

    /// Sets `security.enabled`.
    #[must_use]
    pub fn security_enabled(mut self, enabled: bool) -> Self {
        self.config.security.enabled = enabled;
        self
    }

    /// Registers a backend.
    #[must_use]
    pub fn add_backend(mut self, backend: BackendConfig) -> Self {
        self.config.backends.push(backend);
        self
    }

    /// Validates and returns the finished configuration.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_should_validate() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn development_preset_should_validate() {
        assert!(GatewayConfig::development().validate().is_ok());
    }

    #[test]
    fn production_preset_should_validate() {
        assert!(GatewayConfig::production().validate().is_ok());
    }

    #[test]
    fn testing_preset_should_validate() {
        assert!(GatewayConfig::testing().validate().is_ok());
    }

    #[test]
    fn ssl_client_auth_without_ssl_should_fail_validation() {
        let mut config = GatewayConfig::default();
        config.security.ssl_client_auth_required = true;
        config.security.ssl_enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn min_greater_than_max_should_fail_validation() {
        let mut config = GatewayConfig::default();
        config.pool.min_per_backend = 10;
        config.pool.max_per_backend = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_should_produce_valid_config() {
        let config = GatewayConfigBuilder::new()
            .port(PortNumber::try_new(8888).expect("valid port"))
            .max_per_backend(10)
            .security_enabled(true)
            .build();
        assert!(config.is_ok());
    }

    #[test]
    fn save_and_load_should_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.json");
        let original = GatewayConfig::development();
        original.save_to_file(&path).expect("save");
        let loaded = GatewayConfig::load_from_file(&path).expect("load");
        assert_eq!(loaded.server.port, original.server.port);
        assert_eq!(loaded.backends.len(), original.backends.len());
    }
}
