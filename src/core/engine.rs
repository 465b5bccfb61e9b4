use std::path::Path;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::core::alert::AlertEvaluator;
use crate::core::envelope::ParamEnvelope;
use crate::core::error::{EngineError, Result};
use crate::core::executor::{ExecOutcome, HostExecutor, SandboxExecutor, ScriptExecutor};
use crate::core::registry::ExecutorRegistry;
use crate::core::scheduler::SchedulerService;
use crate::core::store::Store;
use crate::core::store::types::{ExecStatus, ExecutionRecord};
use crate::core::supervisor::{ExecutionSupervisor, MANUAL_TERMINATION};
use crate::core::version::VersionStore;

pub use crate::core::supervisor::ExecTarget;

/// Front door of the crate: wires the store, executors, supervisors, version
/// store, alert evaluator and scheduler together. Entity CRUD that needs no
/// orchestration goes straight through [`ExecutionEngine::store`].
pub struct ExecutionEngine {
    store: Store,
    config: Arc<EngineConfig>,
    registry: ExecutorRegistry,
    alerts: Arc<AlertEvaluator>,
    versions: VersionStore,
    scheduler: Arc<SchedulerService>,
}

impl ExecutionEngine {
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let store = Store::open(config.storage.data_dir.join("scriptdeck.db"))?;
        Ok(Self::with_store(store, config))
    }

    /// Build on an existing store; tests pass an in-memory one.
    pub fn with_store(store: Store, config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let registry = ExecutorRegistry::new();
        let alerts = Arc::new(AlertEvaluator::new(store.clone(), config.smtp.as_ref()));
        let versions = VersionStore::new(store.clone(), config.storage.scripts_dir.clone());
        let scheduler = Arc::new(SchedulerService::new(
            store.clone(),
            config.clone(),
            alerts.clone(),
            registry.clone(),
        ));
        Self {
            store,
            config,
            registry,
            alerts,
            versions,
            scheduler,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    pub fn scheduler(&self) -> &Arc<SchedulerService> {
        &self.scheduler
    }

    /// Fire-and-forget: validates the target, creates the running record and
    /// returns its id. Poll [`ExecutionEngine::get_execution`] for progress.
    pub async fn submit(&self, target: ExecTarget, params: serde_json::Value) -> Result<i64> {
        let envelope = ParamEnvelope::from_value(params)?;
        ExecutionSupervisor::launch(
            &self.store,
            &self.config,
            &self.alerts,
            &self.registry,
            target,
            envelope,
        )
        .await
    }

    /// Stop a running execution. True when this call made the running →
    /// failed transition; false when the record was already terminal.
    pub async fn stop(&self, execution_id: i64) -> Result<bool> {
        if let Some(wrote) = self.registry.stop(execution_id).await? {
            return Ok(wrote);
        }
        // Not registered: the worker already finished, or the record is a
        // leftover from a previous process. Converge it directly.
        self.store
            .finalize_execution(execution_id, ExecStatus::Failed, None, Some(MANUAL_TERMINATION))
            .await
    }

    pub async fn get_execution(&self, execution_id: i64) -> Result<ExecutionRecord> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", execution_id))
    }

    pub async fn publish_version(
        &self,
        script_id: i64,
        body: &str,
        label: Option<&str>,
        force: bool,
    ) -> Result<i64> {
        self.versions.publish(script_id, body, label, force).await
    }

    /// Synchronous try-out run: no history record, no streaming, no alerts.
    pub async fn run_once(
        &self,
        script_id: i64,
        params: serde_json::Value,
    ) -> Result<ExecOutcome> {
        let script = self
            .store
            .get_script(script_id)
            .await?
            .filter(|s| !s.deleted)
            .ok_or_else(|| EngineError::not_found("script", script_id))?;
        if script.file_path.is_empty() {
            return Ok(ExecOutcome::failure(format!(
                "script '{}' has no published body",
                script.name
            )));
        }
        let mut envelope = ParamEnvelope::from_value(params)?;
        envelope.stamp_execution_time();

        let executor: Box<dyn ScriptExecutor> = if self.config.sandbox.enabled {
            Box::new(SandboxExecutor::new(
                self.config.timeout(),
                self.config.sandbox.image.clone(),
            ))
        } else {
            Box::new(HostExecutor::new(self.config.timeout(), self.config.stop_grace()))
        };
        executor
            .run(Path::new(&script.file_path), script.interpreter, &envelope)
            .await
    }
}
