//! Process run loops for the orchestrator and the execution agent

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::agent::serve::{self as agent_serve, AgentState};
use crate::agent::{AgentOptions, Executor};
use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::DeployError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::dispatcher::{self, Dispatcher};
use crate::workers::prober;

/// Run the orchestrator until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DeployError> {
    info!("Initializing deployd orchestrator...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start orchestrator: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

/// Run the execution agent until `shutdown_signal` resolves
pub async fn run_agent(
    options: AgentOptions,
    lifecycle: LifecycleOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DeployError> {
    info!("Initializing deployd execution agent...");

    tokio::fs::create_dir_all(&options.web_root).await.map_err(|e| {
        DeployError::ConfigError(format!(
            "Cannot create web root {}: {}",
            options.web_root.display(),
            e
        ))
    })?;

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), lifecycle);

    let executor = Arc::new(Executor::from_options(options.clone()));
    let mut shutdown_rx = shutdown_tx.subscribe();
    let server_handle = agent_serve::serve(
        &options.server,
        Arc::new(AgentState::new(executor)),
        async move {
            let _ = shutdown_rx.recv().await;
        },
    )
    .await?;
    shutdown_manager.with_server_handle(server_handle)?;

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), DeployError> {
    let app_state = AppState::init(options).await?;

    init_dispatcher_worker(
        options.dispatcher.clone(),
        &app_state,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    if options.enable_prober {
        init_prober_worker(
            options.prober.clone(),
            &app_state,
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    init_server(options, &app_state, shutdown_manager, shutdown_tx.subscribe()).await?;
    Ok(())
}

fn init_dispatcher_worker(
    options: dispatcher::Options,
    app_state: &AppState,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployError> {
    info!("Initializing dispatcher worker...");

    let dispatcher = Arc::new(Dispatcher::new(
        options,
        app_state.queue.clone(),
        app_state.codec.clone(),
        app_state.agent.clone(),
        app_state.relay.clone(),
    ));

    let dispatcher_handle = tokio::spawn(async move {
        dispatcher
            .run(
                tokio::time::sleep,
                Box::pin(async move {
                    let _ = shutdown_rx.recv().await;
                }),
            )
            .await;
    });

    shutdown_manager.with_dispatcher_handle(dispatcher_handle)
}

fn init_prober_worker(
    options: prober::Options,
    app_state: &AppState,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployError> {
    info!("Initializing prober worker...");

    let queue = app_state.queue.clone();
    let prober_handle = tokio::spawn(async move {
        prober::run(
            &options,
            queue,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_prober_handle(prober_handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: &AppState,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(
        app_state.queue.clone(),
        app_state.codec.clone(),
        app_state.relay.clone(),
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    server_handle: Option<JoinHandle<Result<(), DeployError>>>,
    dispatcher_handle: Option<JoinHandle<()>>,
    prober_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            server_handle: None,
            dispatcher_handle: None,
            prober_handle: None,
        }
    }

    fn with_dispatcher_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeployError> {
        if self.dispatcher_handle.is_some() {
            return Err(DeployError::ShutdownError("dispatcher_handle already set".to_string()));
        }
        self.dispatcher_handle = Some(handle);
        Ok(())
    }

    fn with_prober_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeployError> {
        if self.prober_handle.is_some() {
            return Err(DeployError::ShutdownError("prober_handle already set".to_string()));
        }
        self.prober_handle = Some(handle);
        Ok(())
    }

    fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), DeployError>>,
    ) -> Result<(), DeployError> {
        if self.server_handle.is_some() {
            return Err(DeployError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), DeployError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}",
                    self.lifecycle_options.max_shutdown_delay
                );
                Err(DeployError::ShutdownError("shutdown timed out".to_string()))
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), DeployError> {
        info!("Shutting down deployd...");

        // 1. Stop accepting requests
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))??;
        }

        // 2. Prober
        if let Some(handle) = self.prober_handle.take() {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))?;
        }

        // 3. Dispatcher, which finalizes every in-flight deployment
        if let Some(handle) = self.dispatcher_handle.take() {
            handle.await.map_err(|e| DeployError::ShutdownError(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
