use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::error::Result;
use crate::core::store::Store;
use crate::core::supervisor::ExecutionSupervisor;

/// Live supervisors keyed by execution id. Workers deregister themselves on
/// exit; [`ExecutorRegistry::reconcile`] is the per-tick safety net for
/// entries whose record went terminal without that happening.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    inner: Arc<Mutex<HashMap<i64, Arc<ExecutionSupervisor>>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, execution_id: i64, supervisor: Arc<ExecutionSupervisor>) {
        self.inner.lock().await.insert(execution_id, supervisor);
    }

    pub async fn remove(&self, execution_id: i64) {
        self.inner.lock().await.remove(&execution_id);
    }

    pub async fn get(&self, execution_id: i64) -> Option<Arc<ExecutionSupervisor>> {
        self.inner.lock().await.get(&execution_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Stop one registered execution. `Ok(None)` means it was not registered.
    pub async fn stop(&self, execution_id: i64) -> Result<Option<bool>> {
        let supervisor = self.get(execution_id).await;
        match supervisor {
            Some(supervisor) => {
                let wrote = supervisor.stop().await?;
                self.remove(execution_id).await;
                Ok(Some(wrote))
            }
            None => Ok(None),
        }
    }

    /// Drop entries whose execution record is already terminal (or gone).
    pub async fn reconcile(&self, store: &Store) {
        let ids: Vec<i64> = self.inner.lock().await.keys().copied().collect();
        for id in ids {
            let stale = match store.get_execution(id).await {
                Ok(Some(record)) => record.status.is_terminal(),
                Ok(None) => true,
                Err(e) => {
                    warn!("Registry reconcile could not read execution {id}: {e}");
                    false
                }
            };
            if stale {
                debug!("Dropping finished execution {id} from the registry");
                self.remove(id).await;
            }
        }
    }

    /// Stop everything, bounded by `grace` overall. Used at shutdown.
    pub async fn stop_all(&self, grace: Duration) {
        let supervisors: Vec<Arc<ExecutionSupervisor>> =
            self.inner.lock().await.drain().map(|(_, s)| s).collect();
        if supervisors.is_empty() {
            return;
        }
        let stop_everything = async {
            for supervisor in &supervisors {
                if let Err(e) = supervisor.stop().await {
                    warn!("Stop failed for execution {}: {e}", supervisor.execution_id());
                }
            }
        };
        if tokio::time::timeout(grace, stop_everything).await.is_err() {
            warn!("Shutdown grace of {grace:?} elapsed with executions still stopping");
        }
    }
}
