//! Server configuration sourced from environment variables

use hookrelay_reconcile::DEFAULT_GATEWAY_BASE_URL;
use thiserror::Error;

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
pub const DEFAULT_WEBHOOK_BODY_LIMIT: usize = 64 * 1024;
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

/// Where bindings, events, orders and audit entries live
#[derive(Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres {
        database_url: String,
        /// Direct (non-pooled) URL used for migrations
        direct_url: Option<String>,
    },
    /// Process-local store for local runs; nothing survives a restart
    Memory,
}

impl std::fmt::Debug for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Postgres { .. } => write!(f, "Postgres"),
            StoreBackend::Memory => write!(f, "Memory"),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub store: StoreBackend,
    pub bind_address: String,
    pub jwt_secret: String,
    pub gateway_base_url: String,
    pub gateway_access_token: String,
    pub redis_url: Option<String>,
    pub allowed_origins: Vec<String>,
    pub webhook_body_limit_bytes: usize,
    pub run_migrations: bool,
}

// Secrets stay out of logs
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("store", &self.store)
            .field("bind_address", &self.bind_address)
            .field("gateway_base_url", &self.gateway_base_url)
            .field("redis", &self.redis_url.is_some())
            .field("allowed_origins", &self.allowed_origins)
            .field("webhook_body_limit_bytes", &self.webhook_body_limit_bytes)
            .field("run_migrations", &self.run_migrations)
            .finish_non_exhaustive()
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn flag(name: &'static str) -> Result<bool, ConfigError> {
    match optional(name).as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("false") | Some("0") | Some("no") => Ok(false),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some(other) => Err(ConfigError::Invalid {
            name,
            message: format!("expected true/false, got '{}'", other),
        }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let store = match optional("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres {
                database_url: required("DATABASE_URL")?,
                direct_url: optional("DATABASE_DIRECT_URL"),
            },
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "STORE_BACKEND",
                    message: format!("expected 'postgres' or 'memory', got '{}'", other),
                })
            }
        };

        let webhook_body_limit_bytes = match optional("WEBHOOK_BODY_LIMIT_BYTES") {
            None => DEFAULT_WEBHOOK_BODY_LIMIT,
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|limit| *limit > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    name: "WEBHOOK_BODY_LIMIT_BYTES",
                    message: format!("expected a positive integer, got '{}'", raw),
                })?,
        };

        let bind_address =
            optional("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
        if bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid {
                name: "BIND_ADDRESS",
                message: format!("'{}' is not a socket address", bind_address),
            });
        }

        let allowed_origins = optional("ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            store,
            bind_address,
            jwt_secret: required("JWT_SECRET")?,
            gateway_base_url: optional("GATEWAY_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GATEWAY_BASE_URL.to_string()),
            gateway_access_token: optional("GATEWAY_ACCESS_TOKEN").unwrap_or_default(),
            redis_url: optional("REDIS_URL"),
            allowed_origins,
            webhook_body_limit_bytes,
            run_migrations: flag("RUN_MIGRATIONS")?,
        })
    }
}
