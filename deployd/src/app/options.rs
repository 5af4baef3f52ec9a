//! Application configuration options

use std::time::Duration;

use secrecy::SecretString;

use crate::telemetry::DEFAULT_OBSERVER_BUFFER;
use crate::workers::{dispatcher, prober};

/// Orchestrator options
///
/// Holds the database URL and the credential key, so it is not `Clone`
/// and its `Debug` output redacts both.
#[derive(Debug)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Postgres connection string; `None` keeps the queue in memory
    pub database_url: Option<SecretString>,

    /// Base URL of the execution agent
    pub agent_url: String,

    /// 64 hex chars, the AES-256 key for stored credentials
    pub secret_key: SecretString,

    /// Per-observer telemetry buffer, in chunks
    pub relay_buffer: usize,

    /// Enable the health prober
    pub enable_prober: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Dispatcher worker options
    pub dispatcher: dispatcher::Options,

    /// Prober worker options
    pub prober: prober::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            database_url: None,
            agent_url: "http://127.0.0.1:7070".to_string(),
            secret_key: SecretString::from(String::new()),
            relay_buffer: DEFAULT_OBSERVER_BUFFER,
            enable_prober: true,
            server: ServerOptions::default(),
            dispatcher: dispatcher::Options::default(),
            prober: prober::Options::default(),
        }
    }
}

/// Process lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP listener options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl std::str::FromStr for ServerOptions {
    type Err = String;

    /// Parse `host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("Expected host:port, got '{}'", s))?;
        let port = port
            .parse()
            .map_err(|_| format!("Invalid port in '{}'", s))?;
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        })
    }
}
