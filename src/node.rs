use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::{CoordinatorConfig, WorkerConfig};
use crate::coordinator::Coordinator;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::{RelayError, Result};
use crate::grpc::client::coordinator_client_lazy;
use crate::grpc::server::{bind, serve_coordinator, serve_worker};
use crate::grpc::GrpcWorkerClient;
use crate::store::{FileStatusStore, StatusStore};
use crate::worker::{
    DockerEngine, ExecutionEngine, GrpcCompletionReporter, HeartbeatSender, HttpRecipeSource,
};

/// Coordinator process: control loop, gRPC API and optional dashboard.
pub struct CoordinatorNode {
    pub coordinator: Arc<Coordinator>,
    listener: TcpListener,
    dashboard: Option<TcpListener>,
}

impl CoordinatorNode {
    /// Bind every listener and build the coordinator with the gRPC dispatch
    /// client and the file-backed status store.
    pub async fn new(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let store = FileStatusStore::open(&config.status_dir).await?;
        let client = GrpcWorkerClient::new(config.dispatch_timeout());
        Self::with_parts(config, Arc::new(client), Arc::new(store)).await
    }

    pub async fn with_parts(
        config: CoordinatorConfig,
        client: Arc<dyn crate::dispatch::WorkerClient>,
        store: Arc<dyn StatusStore>,
    ) -> Result<Self> {
        let listener = bind(config.listen_addr).await?;
        let dashboard = match config.dashboard_addr {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };
        Ok(Self {
            coordinator: Arc::new(Coordinator::new(config, client, store)),
            listener,
            dashboard,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RelayError::Internal(e.to_string()))
    }

    pub fn dashboard_addr(&self) -> Option<SocketAddr> {
        self.dashboard.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Run until `shutdown` fires.
    ///
    /// 1. Reconciles with registered workers and starts the control loop
    /// 2. Spawns the dashboard if configured
    /// 3. Serves the coordinator API (blocking)
    /// 4. Stops the control loop once the server has drained
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.coordinator.start().await?;

        let dashboard = self.dashboard.map(|listener| {
            let state = DashboardState {
                coordinator: self.coordinator.clone(),
            };
            tokio::spawn(run_dashboard(listener, state, shutdown.clone()))
        });

        let served = serve_coordinator(self.listener, self.coordinator.clone(), shutdown.clone()).await;

        // the server can also end on its own error; make sure the rest follows
        shutdown.cancel();
        self.coordinator.stop().await;
        if let Some(handle) = dashboard {
            let _ = handle.await;
        }
        served
    }
}

/// Worker process: dispatch endpoint, execution engine and heartbeats.
pub struct WorkerNode {
    pub engine: Arc<ExecutionEngine>,
    config: WorkerConfig,
    listener: TcpListener,
    advertised: String,
}

impl WorkerNode {
    /// Bind the dispatch endpoint and build the engine with HTTP recipe
    /// retrieval, Docker and gRPC completion reports.
    pub async fn new(config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        let recipes = HttpRecipeSource::new(config.fetch_timeout())
            .map_err(|e| RelayError::Config(e.to_string()))?;
        let reporter =
            GrpcCompletionReporter::new(&config.coordinator_url, config.heartbeat_interval() * 5)?;

        let engine = ExecutionEngine::new(
            config.worker_id.clone(),
            Arc::new(recipes),
            Arc::new(DockerEngine::new(config.sandbox.clone())),
            Arc::new(reporter),
        );
        Self::with_engine(config, engine).await
    }

    pub async fn with_engine(config: WorkerConfig, engine: ExecutionEngine) -> Result<Self> {
        let listener = bind(config.listen_addr).await?;
        let local = listener
            .local_addr()
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        // a port-0 listen address is only known after binding
        let advertised = match config.advertise_addr {
            Some(_) => config.advertised_address(),
            None => local.to_string(),
        };

        Ok(Self {
            engine: Arc::new(engine),
            config,
            listener,
            advertised,
        })
    }

    pub fn advertised_address(&self) -> &str {
        &self.advertised
    }

    /// Run until `shutdown` fires or the engine hits a fatal error.
    ///
    /// On shutdown the worker stops accepting, lets the current job finish
    /// and report, then stops heartbeating and serving.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let fatal = self.engine.fatal_token();
        let stop = CancellationToken::new();

        let client = coordinator_client_lazy(
            &self.config.coordinator_url,
            self.config.heartbeat_interval() * 5,
        )?;
        let heartbeat = HeartbeatSender::new(
            self.config.worker_id.clone(),
            self.advertised.clone(),
            self.config.heartbeat_interval(),
            client,
            self.engine.clone(),
        );
        let heartbeat_stop = stop.clone();
        let heartbeat = tokio::spawn(async move { heartbeat.run(heartbeat_stop).await });

        let server = tokio::spawn(serve_worker(self.listener, self.engine.clone(), stop.clone()));

        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(worker_id = %self.config.worker_id, "Draining worker");
            }
            _ = fatal.cancelled() => {
                tracing::error!(worker_id = %self.config.worker_id, "Worker stopping after fatal error");
            }
        }

        self.engine.begin_drain().await;
        self.engine.wait_idle().await;
        stop.cancel();

        let _ = heartbeat.await;
        let served = server
            .await
            .map_err(|e| RelayError::Internal(format!("worker server task: {}", e)))?;

        if fatal.is_cancelled() {
            return Err(RelayError::Internal(
                "worker cannot create build contexts".to_string(),
            ));
        }
        served
    }
}
