pub mod host;
pub mod sandbox;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::core::envelope::ParamEnvelope;
use crate::core::error::{EngineError, Result};
use crate::core::interpreter::InterpreterKind;

pub use host::HostExecutor;
pub use sandbox::SandboxExecutor;

/// What a finished (or killed) script process looked like. Executors report
/// process-level failure through this struct rather than through `Err`, so
/// the supervisor can always complete its terminal write; `Err` is reserved
/// for setup problems (bad envelope, unwritable temp file, missing runtime).
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutcome {
    pub fn from_parts(exit_ok: bool, stdout: String, stderr: String) -> Self {
        Self {
            success: exit_ok,
            stdout,
            stderr,
            timed_out: false,
        }
    }

    pub fn timed_out_after(secs: u64) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: EngineError::Timeout(secs).to_string(),
            timed_out: true,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.into(),
            timed_out: false,
        }
    }
}

/// One node of a chain, resolved to concrete paths before execution starts.
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub script_id: i64,
    pub script_name: String,
    pub script_path: PathBuf,
    pub kind: InterpreterKind,
}

/// Seam between the supervisor/engine and the two execution backends.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Run one script to completion, capturing output in memory. The watchdog
    /// is applied inside; on expiry the outcome carries `timed_out = true`.
    async fn run(
        &self,
        script_path: &Path,
        kind: InterpreterKind,
        envelope: &ParamEnvelope,
    ) -> Result<ExecOutcome>;
}

/// Signal an entire process group via the system `kill`. Children of the
/// script (the group leader) would otherwise survive the leader's death.
#[cfg(unix)]
pub(crate) async fn signal_group(pid: u32, signal: &str) {
    let _ = tokio::process::Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .output()
        .await;
}

#[cfg(not(unix))]
pub(crate) async fn signal_group(_pid: u32, _signal: &str) {}

/// Graceful-then-forced termination of a spawned child: TERM the group, wait
/// the grace period, KILL the child and sweep the group again.
pub(crate) async fn terminate_child(child: &mut tokio::process::Child, grace: std::time::Duration) {
    let pid = child.id();
    if let Some(pid) = pid {
        signal_group(pid, "TERM").await;
    }
    tokio::time::sleep(grace).await;
    let _ = child.kill().await;
    if let Some(pid) = pid {
        signal_group(pid, "KILL").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_outcome_carries_the_message() {
        let outcome = ExecOutcome::timed_out_after(30);
        assert!(!outcome.success);
        assert!(outcome.timed_out);
        assert!(outcome.stderr.contains("timed out after 30 seconds"));
    }

    #[test]
    fn plain_failure_is_not_a_timeout() {
        let outcome = ExecOutcome::failure("exit 2");
        assert!(!outcome.success);
        assert!(!outcome.timed_out);
    }
}
