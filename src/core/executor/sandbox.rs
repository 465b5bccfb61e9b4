use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ChainStep, ExecOutcome, ScriptExecutor};
use crate::core::envelope::ParamEnvelope;
use crate::core::error::{EngineError, Result};
use crate::core::interpreter::InterpreterKind;

/// Runs scripts inside throwaway docker containers. The script's directory is
/// mounted at /app and the parameter file's directory at /params, so the
/// script sees the same argv[1] contract as on the host and can drop output
/// files next to itself.
pub struct SandboxExecutor {
    timeout: Duration,
    image_override: Option<String>,
    cancel: CancellationToken,
}

impl SandboxExecutor {
    pub fn new(timeout: Duration, image_override: Option<String>) -> Self {
        Self {
            timeout,
            image_override,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie this executor to an external cancellation token. When it fires
    /// mid-run, the live container is killed the same way the watchdog kills
    /// it; killing only the docker client would leave the container running.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Check the container runtime once before any work is staged.
    pub async fn ensure_available() -> Result<()> {
        let check = Command::new("docker")
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await;
        match check {
            Ok(output) if output.status.success() => Ok(()),
            _ => Err(EngineError::SandboxUnavailable),
        }
    }

    fn image_for(&self, kind: InterpreterKind) -> String {
        self.image_override
            .clone()
            .unwrap_or_else(|| kind.container_image().to_string())
    }

    pub async fn run_in_container(
        &self,
        script_path: &Path,
        kind: InterpreterKind,
        envelope: &ParamEnvelope,
    ) -> Result<ExecOutcome> {
        Self::ensure_available().await?;

        let script_dir = script_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| {
                EngineError::Parameter(format!(
                    "script path {} has no parent directory",
                    script_path.display()
                ))
            })?;
        let script_name = script_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                EngineError::Parameter(format!("unusable script path {}", script_path.display()))
            })?;

        // Staging directory for the parameter file; the guard removes it on
        // every exit path, panics included.
        let staging = tempfile::Builder::new().prefix("scriptdeck-sandbox-").tempdir()?;
        let body = serde_json::to_string(envelope)?;
        std::fs::write(staging.path().join("params.json"), body)?;

        let install_requirements =
            kind == InterpreterKind::Python && script_dir.join("requirements.txt").exists();
        let image = self.image_for(kind);
        let name = format!("scriptdeck-{}", Uuid::new_v4());

        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(&name)
            .arg("--network=host")
            .arg("-v")
            .arg(format!("{}:/app", script_dir.display()))
            .arg("-v")
            .arg(format!("{}:/params", staging.path().display()))
            .arg(&image)
            .args(kind.container_command(script_name, "params.json", install_requirements))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {script_name} in container {name} ({image})");
        let child = cmd.spawn()?;
        let finished = child.wait_with_output();
        tokio::pin!(finished);
        tokio::select! {
            output = &mut finished => {
                let output = output?;
                Ok(ExecOutcome::from_parts(
                    output.status.success(),
                    String::from_utf8_lossy(&output.stdout).into_owned(),
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                ))
            }
            _ = tokio::time::sleep(self.timeout) => {
                warn!(
                    "Container {name} exceeded the {}s watchdog, killing",
                    self.timeout.as_secs()
                );
                // Dropping the wait future only SIGKILLs the docker client
                // (kill_on_drop); the container itself needs an explicit kill.
                kill_container(&name).await;
                Ok(ExecOutcome::timed_out_after(self.timeout.as_secs()))
            }
            _ = self.cancel.cancelled() => {
                kill_container(&name).await;
                Err(EngineError::Cancelled)
            }
        }
    }

    /// Run a whole chain in the sandbox, one container per step, relaying the
    /// previous step's stdout through the reserved system key. Stops at the
    /// first failing step; the returned list holds outcomes for the steps
    /// that actually ran, keyed by script id.
    pub async fn run_chain_in_container(
        &self,
        steps: &[ChainStep],
        base: &ParamEnvelope,
    ) -> Result<Vec<(i64, ExecOutcome)>> {
        Self::ensure_available().await?;

        let mut results = Vec::with_capacity(steps.len());
        let mut prev_output: Option<String> = None;
        for step in steps {
            let mut envelope = base.clone();
            if let Some(prev) = &prev_output {
                envelope.set_prev_output(prev);
            }
            info!("Chain step {} ({}) in sandbox", step.script_id, step.script_name);
            let outcome = self
                .run_in_container(&step.script_path, step.kind, &envelope)
                .await?;
            let success = outcome.success;
            prev_output = Some(outcome.stdout.clone());
            results.push((step.script_id, outcome));
            if !success {
                break;
            }
        }
        Ok(results)
    }
}

/// Both the watchdog and the cancel path converge here: the `--rm` flag
/// makes the killed container clean itself up.
async fn kill_container(name: &str) {
    let _ = Command::new("docker").args(["kill", name]).output().await;
}

#[async_trait]
impl ScriptExecutor for SandboxExecutor {
    async fn run(
        &self,
        script_path: &Path,
        kind: InterpreterKind,
        envelope: &ParamEnvelope,
    ) -> Result<ExecOutcome> {
        self.run_in_container(script_path, kind, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn docker_ready(image: &str) -> bool {
        SandboxExecutor::ensure_available().await.is_ok()
            && Command::new("docker")
                .args(["image", "inspect", image])
                .stdin(Stdio::null())
                .output()
                .await
                .is_ok_and(|o| o.status.success())
    }

    #[tokio::test]
    async fn cancellation_kills_the_live_container() {
        let image = "ubuntu:22.04";
        if !docker_ready(image).await {
            // No container runtime (or base image) on this machine.
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hang.sh");
        std::fs::write(&script, "#!/bin/bash\nsleep 30\n").unwrap();

        let cancel = CancellationToken::new();
        let executor = SandboxExecutor::new(Duration::from_secs(60), None)
            .with_cancellation(cancel.clone());
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            stopper.cancel();
        });

        let result = executor
            .run_in_container(&script, InterpreterKind::Shell, &ParamEnvelope::default())
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));

        // Give the kill a moment, then confirm nothing of ours survived.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let ps = Command::new("docker")
            .args(["ps", "-q", "--filter", "name=scriptdeck-"])
            .output()
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&ps.stdout).trim().is_empty());
    }

    #[test]
    fn override_beats_the_default_image() {
        let plain = SandboxExecutor::new(Duration::from_secs(5), None);
        assert_eq!(plain.image_for(InterpreterKind::Python), "python:3.11-slim");

        let pinned =
            SandboxExecutor::new(Duration::from_secs(5), Some("python:3.12-slim".to_string()));
        assert_eq!(pinned.image_for(InterpreterKind::Python), "python:3.12-slim");
        assert_eq!(pinned.image_for(InterpreterKind::Node), "python:3.12-slim");
    }
}
