//! Server state

use std::sync::Arc;

use crate::queue::TaskQueue;
use crate::secrets::SecretCodec;
use crate::telemetry::TelemetryRelay;

/// Server state shared across handlers
pub struct ServerState {
    pub queue: Arc<dyn TaskQueue>,
    pub codec: Arc<SecretCodec>,
    pub relay: Arc<TelemetryRelay>,
}

impl ServerState {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        codec: Arc<SecretCodec>,
        relay: Arc<TelemetryRelay>,
    ) -> Self {
        Self {
            queue,
            codec,
            relay,
        }
    }
}
