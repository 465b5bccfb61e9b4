use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::core::alert::AlertEvaluator;
use crate::core::envelope::ParamEnvelope;
use crate::core::error::{EngineError, Result};
use crate::core::executor::{
    ChainStep, ExecOutcome, HostExecutor, SandboxExecutor, ScriptExecutor, terminate_child,
};
use crate::core::registry::ExecutorRegistry;
use crate::core::store::Store;
use crate::core::store::types::{ExecStatus, ScriptRecord};

/// Error text written when an execution is stopped by an operator rather
/// than by the script itself.
pub const MANUAL_TERMINATION: &str = "Script execution was manually terminated";

/// What an execution runs: one script or one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecTarget {
    Script(i64),
    Chain(i64),
}

enum StreamLine {
    Out(String),
    Err(String),
}

/// Owns exactly one execution record from dispatch to its terminal write.
/// Nothing else writes that record; progress and terminal updates both go
/// through the store's `status = 'running'` guard, so a late writer (a
/// straggling flush, a second stop, the worker racing a stop) is a no-op.
pub struct ExecutionSupervisor {
    execution_id: i64,
    store: Store,
    config: Arc<EngineConfig>,
    alerts: Arc<AlertEvaluator>,
    cancel: CancellationToken,
}

impl ExecutionSupervisor {
    /// Validate the target, create the running record, register a supervisor
    /// and spawn the background worker. Returns the execution id without
    /// waiting for the script.
    pub async fn launch(
        store: &Store,
        config: &Arc<EngineConfig>,
        alerts: &Arc<AlertEvaluator>,
        registry: &ExecutorRegistry,
        target: ExecTarget,
        mut envelope: ParamEnvelope,
    ) -> Result<i64> {
        let (script_id, chain_id) = match target {
            ExecTarget::Script(id) => {
                store
                    .get_script(id)
                    .await?
                    .filter(|s| !s.deleted)
                    .ok_or_else(|| EngineError::not_found("script", id))?;
                (Some(id), None)
            }
            ExecTarget::Chain(id) => {
                store
                    .get_chain(id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("chain", id))?;
                (None, Some(id))
            }
        };

        envelope.stamp_execution_time();
        let execution_id = store
            .insert_execution(script_id, chain_id, Some(&envelope.to_json()))
            .await?;

        let supervisor = Arc::new(Self {
            execution_id,
            store: store.clone(),
            config: config.clone(),
            alerts: alerts.clone(),
            cancel: CancellationToken::new(),
        });
        registry.insert(execution_id, supervisor.clone()).await;

        let registry = registry.clone();
        tokio::spawn(async move {
            supervisor.run_worker(target, envelope).await;
            registry.remove(supervisor.execution_id).await;
        });
        Ok(execution_id)
    }

    pub fn execution_id(&self) -> i64 {
        self.execution_id
    }

    /// Operator stop: cancel the worker (which kills the live child) and
    /// write the terminal record immediately. Returns whether this call made
    /// the transition; false means the record was already terminal.
    pub async fn stop(&self) -> Result<bool> {
        self.cancel.cancel();
        self.finish(ExecStatus::Failed, None, Some(MANUAL_TERMINATION)).await
    }

    async fn run_worker(&self, target: ExecTarget, envelope: ParamEnvelope) {
        let result = match target {
            ExecTarget::Script(id) => self.run_script(id, envelope).await,
            ExecTarget::Chain(id) => self.run_chain(id, envelope).await,
        };
        match result {
            Ok(()) => {}
            Err(EngineError::Cancelled) => {
                // stop() already wrote the terminal record; this is the
                // convergence path in case it lost the race.
                let _ = self
                    .finish(ExecStatus::Failed, None, Some(MANUAL_TERMINATION))
                    .await;
            }
            Err(e) => {
                error!("Execution {} worker failed: {e}", self.execution_id);
                let _ = self
                    .finish(ExecStatus::Failed, None, Some(&e.to_string()))
                    .await;
            }
        }
    }

    async fn run_script(&self, script_id: i64, envelope: ParamEnvelope) -> Result<()> {
        let script = self
            .store
            .get_script(script_id)
            .await?
            .ok_or_else(|| EngineError::not_found("script", script_id))?;
        let outcome = self.run_step(&script, &envelope, true).await?;
        self.finish_outcome(outcome).await
    }

    async fn run_chain(&self, chain_id: i64, base: ParamEnvelope) -> Result<()> {
        let chain = self
            .store
            .get_chain(chain_id)
            .await?
            .ok_or_else(|| EngineError::not_found("chain", chain_id))?;
        let nodes = self.store.chain_nodes(chain_id).await?;
        if nodes.is_empty() {
            self.finish(
                ExecStatus::Failed,
                None,
                Some(&format!("chain '{}' has no steps", chain.name)),
            )
            .await?;
            return Ok(());
        }

        let mut steps = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let script = self
                .store
                .get_script(node.script_id)
                .await?
                .ok_or_else(|| EngineError::not_found("script", node.script_id))?;
            steps.push((node.rank, script));
        }

        if self.config.sandbox.enabled {
            return self.run_chain_sandboxed(&steps, &base).await;
        }

        let total = steps.len();
        let mut outputs = Map::new();
        let mut prev: Option<String> = None;
        for (i, (rank, script)) in steps.iter().enumerate() {
            // Keep the accumulated step outputs visible to pollers; the
            // banner alone would wipe what earlier steps already produced.
            let banner = format!(
                "{}\n[{}/{total}] running step {rank}: {}",
                Value::Object(outputs.clone()),
                i + 1,
                script.name
            );
            self.flush_progress(&banner, "").await;
            let mut envelope = base.clone();
            if let Some(prev) = &prev {
                envelope.set_prev_output(prev);
            }
            // Chain steps run captured, not streamed; the per-step progress
            // line above is the live signal.
            let outcome = self.run_step(script, &envelope, false).await?;
            outputs.insert(script.id.to_string(), Value::String(outcome.stdout.clone()));
            if !outcome.success {
                let aggregate = Value::Object(outputs).to_string();
                self.finish(
                    ExecStatus::Failed,
                    Some(&aggregate),
                    Some(&format!(
                        "chain stopped at step {rank} ({}): {}",
                        script.name,
                        outcome.stderr.trim_end()
                    )),
                )
                .await?;
                return Ok(());
            }
            prev = Some(outcome.stdout);
        }

        let aggregate = Value::Object(outputs).to_string();
        self.finish(ExecStatus::Completed, Some(&aggregate), None).await?;
        Ok(())
    }

    async fn run_chain_sandboxed(
        &self,
        steps: &[(i64, ScriptRecord)],
        base: &ParamEnvelope,
    ) -> Result<()> {
        let executor =
            SandboxExecutor::new(self.config.timeout(), self.config.sandbox.image.clone())
                .with_cancellation(self.cancel.clone());
        let chain_steps: Vec<ChainStep> = steps
            .iter()
            .map(|(_, script)| ChainStep {
                script_id: script.id,
                script_name: script.name.clone(),
                script_path: PathBuf::from(&script.file_path),
                kind: script.interpreter,
            })
            .collect();

        let results = executor.run_chain_in_container(&chain_steps, base).await?;

        let mut outputs = Map::new();
        let mut failure = None;
        for (i, (script_id, outcome)) in results.iter().enumerate() {
            outputs.insert(script_id.to_string(), Value::String(outcome.stdout.clone()));
            if !outcome.success {
                let (rank, script) = &steps[i];
                failure = Some(format!(
                    "chain stopped at step {rank} ({}): {}",
                    script.name,
                    outcome.stderr.trim_end()
                ));
            }
        }
        let aggregate = Value::Object(outputs).to_string();
        match failure {
            Some(reason) => {
                self.finish(ExecStatus::Failed, Some(&aggregate), Some(&reason)).await?
            }
            None => self.finish(ExecStatus::Completed, Some(&aggregate), None).await?,
        };
        Ok(())
    }

    /// Run one script in the configured backend. `streaming` selects the
    /// line-by-line host path used for single-script executions.
    async fn run_step(
        &self,
        script: &ScriptRecord,
        envelope: &ParamEnvelope,
        streaming: bool,
    ) -> Result<ExecOutcome> {
        if script.file_path.is_empty() {
            return Ok(ExecOutcome::failure(format!(
                "script '{}' has no published body",
                script.name
            )));
        }
        let path = Path::new(&script.file_path);

        if self.config.sandbox.enabled {
            // The executor owns cancellation so the cancel path kills the
            // live container, not just the docker client.
            let executor =
                SandboxExecutor::new(self.config.timeout(), self.config.sandbox.image.clone())
                    .with_cancellation(self.cancel.clone());
            let outcome = executor
                .run_in_container(path, script.interpreter, envelope)
                .await?;
            // One flush on return; containers are not streamed.
            self.flush_progress(&outcome.stdout, &outcome.stderr).await;
            return Ok(outcome);
        }

        let executor = HostExecutor::new(self.config.timeout(), self.config.stop_grace());
        if streaming {
            let (child, _params) =
                executor.spawn_streaming(path, script.interpreter, envelope)?;
            self.stream_child(child).await
        } else {
            tokio::select! {
                outcome = executor.run(path, script.interpreter, envelope) => outcome,
                _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            }
        }
    }

    /// Line-by-line streaming: two reader tasks feed one consumer, which is
    /// the only writer of this record. Stdout flushes in batches, stderr
    /// flushes immediately; the watchdog and the cancel token share the same
    /// select loop so all exits converge on one code path.
    async fn stream_child(&self, mut child: Child) -> Result<ExecOutcome> {
        let (tx, mut rx) = mpsc::channel::<StreamLine>(256);
        if let Some(pipe) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(StreamLine::Out(line)).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(pipe) = child.stderr.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(StreamLine::Err(line)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let flush_every = self.config.execution.progress_flush_lines.max(1);
        let mut out_buf = String::new();
        let mut err_buf = String::new();
        let mut unflushed = 0usize;
        let deadline = tokio::time::sleep(self.config.timeout());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                line = rx.recv() => match line {
                    Some(StreamLine::Out(line)) => {
                        out_buf.push_str(&line);
                        out_buf.push('\n');
                        unflushed += 1;
                        if unflushed >= flush_every {
                            self.flush_progress(&out_buf, &err_buf).await;
                            unflushed = 0;
                        }
                    }
                    Some(StreamLine::Err(line)) => {
                        err_buf.push_str(&line);
                        err_buf.push('\n');
                        self.flush_progress(&out_buf, &err_buf).await;
                        unflushed = 0;
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(
                        "Execution {} exceeded the {}s watchdog, terminating",
                        self.execution_id, self.config.execution.timeout_secs
                    );
                    terminate_child(&mut child, self.config.stop_grace()).await;
                    return Ok(self.timed_out_outcome(out_buf, err_buf));
                }
                _ = self.cancel.cancelled() => {
                    terminate_child(&mut child, self.config.stop_grace()).await;
                    return Err(EngineError::Cancelled);
                }
            }
        }

        // Readers drained; the child should exit promptly, still bounded by
        // the same watchdog.
        let status = tokio::select! {
            status = child.wait() => status?,
            _ = &mut deadline => {
                terminate_child(&mut child, self.config.stop_grace()).await;
                return Ok(self.timed_out_outcome(out_buf, err_buf));
            }
        };
        Ok(ExecOutcome::from_parts(status.success(), out_buf, err_buf))
    }

    fn timed_out_outcome(&self, stdout: String, stderr: String) -> ExecOutcome {
        let mut outcome = ExecOutcome::timed_out_after(self.config.execution.timeout_secs);
        if !stderr.trim().is_empty() {
            outcome.stderr = format!("{}\n{}", stderr.trim_end(), outcome.stderr);
        }
        outcome.stdout = stdout;
        outcome
    }

    async fn finish_outcome(&self, outcome: ExecOutcome) -> Result<()> {
        if outcome.success {
            self.finish(ExecStatus::Completed, Some(&outcome.stdout), None).await?;
        } else {
            self.finish(
                ExecStatus::Failed,
                Some(&outcome.stdout),
                Some(outcome.stderr.trim_end()),
            )
            .await?;
        }
        Ok(())
    }

    /// The single terminal code path. When this call wins the running →
    /// terminal transition, the alert rules run before the worker exits;
    /// alert failures are logged and dropped.
    async fn finish(
        &self,
        status: ExecStatus,
        output: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        let wrote = self
            .store
            .finalize_execution(self.execution_id, status, output, error)
            .await?;
        if wrote {
            info!("Execution {} finished: {}", self.execution_id, status.as_str());
            if let Ok(Some(record)) = self.store.get_execution(self.execution_id).await
                && let Err(e) = self.alerts.on_terminal(&record).await
            {
                warn!("Alert evaluation failed for execution {}: {e}", self.execution_id);
            }
        }
        Ok(wrote)
    }

    async fn flush_progress(&self, output: &str, error: &str) {
        match self.store.update_progress(self.execution_id, output, error).await {
            Ok(_) => {}
            Err(e) => warn!("Progress write failed for execution {}: {e}", self.execution_id),
        }
    }
}
