//! Process-scoped registry
//!
//! 전역 상태 대신 한 번 조립해서 주입합니다.
//! `init` → (serve / run) → `shutdown`

use crate::controller::SessionController;
use pilot_foundation::{EventBus, PilotConfig, Result, StorageConfig};
use pilot_task::{
    Allowlist, ApprovalGate, ArtifactStore, LocalToolInvoker, LocalToolInvokerConfig,
    MemoryArtifactStore, MemoryStore, SqliteStore, Store, TaskEngine, ToolInvoker,
};
use std::sync::Arc;
use tracing::info;

/// Every long-lived component of one Pilot process
pub struct Registry {
    pub config: PilotConfig,
    pub store: Arc<dyn Store>,
    pub bus: Arc<EventBus>,
    pub gate: Arc<ApprovalGate>,
    pub allowlist: Arc<Allowlist>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub engine: Arc<TaskEngine>,
    pub controller: Arc<SessionController>,
}

impl Registry {
    /// Build the components described by `config` with the local tool invoker
    pub async fn init(config: PilotConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match &config.storage {
            StorageConfig::Memory => Arc::new(MemoryStore::new()),
            StorageConfig::Sqlite { data_dir } => Arc::new(SqliteStore::new(data_dir)?),
        };
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let invoker = Arc::new(LocalToolInvoker::new(
            LocalToolInvokerConfig::from(&config.engine),
            Arc::clone(&artifacts),
        ));
        Self::assemble(config, store, artifacts, invoker).await
    }

    /// Wire components around an explicit store and invoker
    ///
    /// Tasks left running by a previous process are marked interrupted.
    pub async fn assemble(
        config: PilotConfig,
        store: Arc<dyn Store>,
        artifacts: Arc<dyn ArtifactStore>,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Result<Self> {
        let bus = Arc::new(EventBus::with_config(config.bus_config()));
        let gate = Arc::new(ApprovalGate::new(Arc::clone(&store), Arc::clone(&bus)));
        let allowlist = Arc::new(Allowlist::new());
        let engine = Arc::new(TaskEngine::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&gate),
            Arc::clone(&allowlist),
            Arc::clone(&invoker),
        ));
        let controller = Arc::new(SessionController::new(
            Arc::clone(&engine),
            config.defaults.clone(),
        ));

        let recovered = engine.recover_interrupted().await?;
        info!(
            invoker = invoker.name(),
            recovered,
            "Registry initialized"
        );

        Ok(Self {
            config,
            store,
            bus,
            gate,
            allowlist,
            artifacts,
            engine,
            controller,
        })
    }

    /// Stop every step loop and drop every observer
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        self.bus.close().await;
        info!("Registry shut down");
    }
}
