//! Application state management

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::errors::DeployError;
use crate::protocol::{ExecutionAgent, HttpAgentClient};
use crate::queue::{MemoryTaskQueue, PgTaskQueue, TaskQueue};
use crate::secrets::SecretCodec;
use crate::telemetry::TelemetryRelay;

/// Long-lived orchestrator components shared by workers and the server
pub struct AppState {
    pub queue: Arc<dyn TaskQueue>,
    pub codec: Arc<SecretCodec>,
    pub relay: Arc<TelemetryRelay>,
    pub agent: Arc<dyn ExecutionAgent>,
}

impl AppState {
    /// Connect the queue, load the credential key and build the agent client
    pub async fn init(options: &AppOptions) -> Result<Self, DeployError> {
        let codec = SecretCodec::from_hex_key(options.secret_key.expose_secret())?;

        let queue: Arc<dyn TaskQueue> = match &options.database_url {
            Some(url) => {
                let max_connections = u32::try_from(options.dispatcher.pool_size)
                    .unwrap_or(u32::MAX)
                    .saturating_add(4);
                let queue = PgTaskQueue::connect(url.expose_secret(), max_connections).await?;
                queue.migrate().await?;
                info!("Using Postgres task queue");
                Arc::new(queue)
            }
            None => {
                warn!("DATABASE_URL not set, tasks are kept in memory only");
                Arc::new(MemoryTaskQueue::new())
            }
        };

        let agent = HttpAgentClient::new(&options.agent_url)?;
        info!("Execution agent at {}", agent.base_url());

        Ok(Self {
            queue,
            codec: Arc::new(codec),
            relay: Arc::new(TelemetryRelay::new(options.relay_buffer)),
            agent: Arc::new(agent),
        })
    }
}
