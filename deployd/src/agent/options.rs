//! Execution agent configuration

use std::path::PathBuf;

use crate::app::options::ServerOptions;

/// Execution agent options
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Directory holding one subdirectory per target
    pub web_root: PathBuf,

    /// Releases kept per target after a successful deployment
    pub retention: usize,

    /// Clone and build as the provisioned user `<prefix><app_id>`; `None` uses the agent user
    pub build_user_prefix: Option<String>,

    /// Restart `<prefix><target>` via systemd; `None` skips the restart
    pub service_prefix: Option<String>,

    /// Where the agent's execution endpoint listens
    pub server: ServerOptions,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            web_root: PathBuf::from("/srv/deployd"),
            retention: 5,
            build_user_prefix: None,
            service_prefix: None,
            server: ServerOptions {
                host: "127.0.0.1".to_string(),
                port: 7070,
            },
        }
    }
}
