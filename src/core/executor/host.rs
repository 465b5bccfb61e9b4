use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{ExecOutcome, ScriptExecutor, terminate_child};
use crate::core::envelope::ParamEnvelope;
use crate::core::error::Result;
use crate::core::interpreter::InterpreterKind;

/// Runs scripts directly on the host with the interpreter dispatch table.
pub struct HostExecutor {
    timeout: Duration,
    stop_grace: Duration,
}

impl HostExecutor {
    pub fn new(timeout: Duration, stop_grace: Duration) -> Self {
        Self { timeout, stop_grace }
    }

    /// Spawn a configured child with piped stdio and hand it to the caller,
    /// which owns streaming and the watchdog. The returned temp-file guard
    /// must outlive the child; dropping it deletes the parameter file.
    pub fn spawn_streaming(
        &self,
        script_path: &Path,
        kind: InterpreterKind,
        envelope: &ParamEnvelope,
    ) -> Result<(Child, NamedTempFile)> {
        let params = envelope.write_temp()?;
        prepare_script(script_path, kind)?;
        let mut cmd = kind.host_command(script_path, params.path());
        configure(&mut cmd);
        debug!("Spawning {} interpreter for {}", kind, script_path.display());
        let child = cmd.spawn()?;
        Ok((child, params))
    }
}

#[async_trait]
impl ScriptExecutor for HostExecutor {
    async fn run(
        &self,
        script_path: &Path,
        kind: InterpreterKind,
        envelope: &ParamEnvelope,
    ) -> Result<ExecOutcome> {
        let (mut child, _params) = self.spawn_streaming(script_path, kind, envelope)?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let out_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut pipe) = stdout_pipe {
                pipe.read_to_string(&mut buf).await.ok();
            }
            buf
        });
        let err_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr_pipe {
                pipe.read_to_string(&mut buf).await.ok();
            }
            buf
        });

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                let stdout = out_task.await.unwrap_or_default();
                let stderr = err_task.await.unwrap_or_default();
                Ok(ExecOutcome::from_parts(status.success(), stdout, stderr))
            }
            Err(_) => {
                warn!(
                    "{} exceeded the {}s watchdog, terminating",
                    script_path.display(),
                    self.timeout.as_secs()
                );
                terminate_child(&mut child, self.stop_grace).await;
                let mut outcome = ExecOutcome::timed_out_after(self.timeout.as_secs());
                // The kill closed the pipes, so the readers finish with
                // whatever partial output the process managed to emit.
                outcome.stdout = out_task.await.unwrap_or_default();
                let partial_err = err_task.await.unwrap_or_default();
                if !partial_err.trim().is_empty() {
                    outcome.stderr = format!("{}\n{}", partial_err.trim_end(), outcome.stderr);
                }
                Ok(outcome)
            }
        }
    }
}

fn configure(cmd: &mut Command) {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // The child leads its own process group so a group signal reaches any
    // grandchildren it spawns.
    #[cfg(unix)]
    cmd.process_group(0);
}

/// Shell scripts uploaded through the API arrive without the executable bit.
#[cfg(unix)]
fn prepare_script(path: &Path, kind: InterpreterKind) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if kind != InterpreterKind::Shell {
        return Ok(());
    }
    let mut perms = std::fs::metadata(path)?.permissions();
    if perms.mode() & 0o111 == 0 {
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn prepare_script(_path: &Path, _kind: InterpreterKind) -> Result<()> {
    Ok(())
}
