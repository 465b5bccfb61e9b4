use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::core::alert::AlertEvaluator;
use crate::core::envelope::ParamEnvelope;
use crate::core::error::Result;
use crate::core::registry::ExecutorRegistry;
use crate::core::store::Store;
use crate::core::store::types::ScheduledTaskRecord;
use crate::core::supervisor::{ExecTarget, ExecutionSupervisor};

/// Background polling loop that turns due scheduled tasks into executions.
/// All state is explicit: the loop task, the cancel token and the registry of
/// live supervisors it hands work to.
pub struct SchedulerService {
    store: Store,
    config: Arc<EngineConfig>,
    alerts: Arc<AlertEvaluator>,
    registry: ExecutorRegistry,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerService {
    pub fn new(
        store: Store,
        config: Arc<EngineConfig>,
        alerts: Arc<AlertEvaluator>,
        registry: ExecutorRegistry,
    ) -> Self {
        Self {
            store,
            config,
            alerts,
            registry,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.handle.lock().await;
        if slot.is_some() {
            warn!("Scheduler already running");
            return;
        }
        info!(
            "Scheduler started (polling every {}s)",
            self.config.scheduler.poll_interval_secs
        );
        let svc = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(svc.config.poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => svc.tick().await,
                    _ = svc.cancel.cancelled() => break,
                }
            }
        }));
    }

    /// One scheduler pass. Every per-task error is caught and logged here;
    /// nothing a task does can stall the loop.
    pub async fn tick(&self) {
        self.registry.reconcile(&self.store).await;

        let now = Utc::now();
        let due = match self.store.due_tasks(now).await {
            Ok(due) => due,
            Err(e) => {
                error!("Scheduler could not query due tasks: {e}");
                return;
            }
        };
        for task in due {
            if let Err(e) = self.dispatch_task(&task, now).await {
                error!("Scheduled task {} ('{}') failed to dispatch: {e}", task.id, task.name);
            }
        }
    }

    async fn dispatch_task(&self, task: &ScheduledTaskRecord, now: DateTime<Utc>) -> Result<()> {
        let target = match (task.script_id, task.chain_id) {
            (Some(id), _) => ExecTarget::Script(id),
            (None, Some(id)) => ExecTarget::Chain(id),
            (None, None) => {
                warn!("Scheduled task {} targets nothing, deactivating", task.id);
                self.store.set_task_active(task.id, false).await?;
                return Ok(());
            }
        };
        let envelope = ParamEnvelope::from_value(
            task.params.clone().unwrap_or(serde_json::Value::Null),
        )?;
        let execution_id = ExecutionSupervisor::launch(
            &self.store,
            &self.config,
            &self.alerts,
            &self.registry,
            target,
            envelope,
        )
        .await?;
        info!("Scheduled task '{}' dispatched as execution {execution_id}", task.name);

        // Recompute at dispatch, not at completion, so a slow run never
        // delays its own next slot. Overlapping runs are allowed.
        let next = next_run_after(&task.cron_expression, now);
        self.store.task_dispatched(task.id, now, next).await?;
        Ok(())
    }

    /// Cancel the loop and stop every registered execution, bounded by the
    /// configured shutdown grace.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        self.registry
            .stop_all(Duration::from_secs(self.config.scheduler.shutdown_grace_secs))
            .await;
        info!("Scheduler stopped");
    }
}

/// Next fire time strictly after `after`. Accepts both 5-field crontab
/// expressions (normalized with a leading seconds field) and 6/7-field ones.
/// Anything unparsable falls back to one hour out, logged.
pub fn next_run_after(expression: &str, after: DateTime<Utc>) -> DateTime<Utc> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    match Schedule::from_str(&normalized) {
        Ok(schedule) => schedule
            .after(&after)
            .next()
            .unwrap_or_else(|| after + ChronoDuration::hours(1)),
        Err(_) => {
            warn!("Invalid cron expression '{expression}', scheduling one hour out");
            after + ChronoDuration::hours(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::interpreter::InterpreterKind;
    use crate::core::store::types::OutputMode;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_are_accepted() {
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 30).unwrap();
        let next = next_run_after("*/5 * * * *", after);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn six_field_expressions_pass_through() {
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = next_run_after("30 * * * * *", after);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 30).unwrap());
    }

    #[test]
    fn invalid_expressions_fall_back_an_hour() {
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = next_run_after("every full moon", after);
        assert_eq!(next, after + ChronoDuration::hours(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tick_dispatches_due_tasks_and_advances_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("ok.sh");
        std::fs::write(&script_path, "#!/bin/bash\necho done\n").unwrap();

        let store = Store::open_in_memory().unwrap();
        let config = Arc::new(EngineConfig::default());
        let alerts = Arc::new(AlertEvaluator::new(store.clone(), None));
        let registry = ExecutorRegistry::new();
        let scheduler =
            SchedulerService::new(store.clone(), config, alerts, registry.clone());

        let script_id = store
            .create_script("ok", "", InterpreterKind::Shell, OutputMode::Text, None)
            .await
            .unwrap();
        store
            .update_script_path(script_id, &script_path.to_string_lossy())
            .await
            .unwrap();
        let now = Utc::now();
        let task_id = store
            .create_task("every minute", "* * * * *", Some(script_id), None, None, now)
            .await
            .unwrap();

        scheduler.tick().await;

        let executions = store.list_executions(10, 0).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].script_id, Some(script_id));

        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert!(task.last_run.is_some());
        assert!(task.next_run.unwrap() > now);

        // Second tick within the same minute dispatches nothing new.
        scheduler.tick().await;
        assert_eq!(store.list_executions(10, 0).await.unwrap().len(), 1);
    }
}
