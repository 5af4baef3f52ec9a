//! Health prober worker
//!
//! Periodically probes every live target on loopback and logs the result.
//! It never mutates task state.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::{redirect, Client};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::errors::DeployError;
use crate::models::LiveTarget;
use crate::queue::TaskQueue;

/// Prober worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval
    pub interval: Duration,

    /// Probes in flight at once
    pub concurrency: usize,

    /// Per-probe request timeout
    pub timeout: Duration,

    /// Upper bound of the random delay added to each probe
    pub jitter: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            concurrency: 10,
            timeout: Duration::from_secs(5),
            jitter: Duration::from_millis(500),
        }
    }
}

/// Result of probing one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub target_name: String,
    pub target_port: u16,
    pub healthy: bool,
    pub detail: String,
}

/// Loopback HTTP prober
pub struct Prober {
    client: Client,
    options: Options,
}

impl Prober {
    pub fn new(options: Options) -> Result<Self, DeployError> {
        let client = Client::builder()
            .timeout(options.timeout)
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self { client, options })
    }

    /// Probe every live target once, with bounded concurrency
    pub async fn probe_all(&self, queue: &dyn TaskQueue) -> Result<Vec<ProbeResult>, DeployError> {
        let targets = queue.live_targets().await?;
        let permits = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut probes = JoinSet::new();

        for target in targets {
            let client = self.client.clone();
            let permits = permits.clone();
            let jitter = random_jitter(self.options.jitter);
            probes.spawn(async move {
                let _permit = permits.acquire_owned().await;
                tokio::time::sleep(jitter).await;
                probe(&client, target).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!("Probe task panicked: {}", e),
            }
        }
        results.sort_by(|a, b| a.target_name.cmp(&b.target_name));
        Ok(results)
    }
}

async fn probe(client: &Client, target: LiveTarget) -> ProbeResult {
    let url = format!("http://127.0.0.1:{}/", target.target_port);
    let (healthy, detail) = match client.get(&url).send().await {
        // Anything but a server error means the process is up and answering
        Ok(response) => (
            !response.status().is_server_error(),
            response.status().to_string(),
        ),
        Err(e) => (false, e.to_string()),
    };
    ProbeResult {
        target_name: target.target_name,
        target_port: target.target_port,
        healthy,
        detail,
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Run the prober worker
pub async fn run<S, F>(
    options: &Options,
    queue: Arc<dyn TaskQueue>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Prober worker starting...");

    let prober = match Prober::new(options.clone()) {
        Ok(prober) => prober,
        Err(e) => {
            error!("Failed to build prober client: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Prober worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {
                // Continue with probe
            }
        }

        debug!("Probing live targets...");

        match prober.probe_all(queue.as_ref()).await {
            Ok(results) => {
                for result in results {
                    if result.healthy {
                        info!(
                            "{} on port {} is healthy ({})",
                            result.target_name, result.target_port, result.detail
                        );
                    } else {
                        warn!(
                            "{} on port {} is unhealthy: {}",
                            result.target_name, result.target_port, result.detail
                        );
                    }
                }
            }
            Err(e) => {
                error!("Failed to list live targets: {}", e);
            }
        }
    }
}
