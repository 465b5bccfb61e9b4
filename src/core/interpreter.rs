use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// The closed set of supported script interpreters. Behavior that used to be
/// a string-keyed switch (invocation command, container image, container
/// command line) hangs off this enum instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpreterKind {
    Python,
    Shell,
    Batch,
    PowerShell,
    Node,
}

impl InterpreterKind {
    pub const ALL: &'static [InterpreterKind] = &[
        InterpreterKind::Python,
        InterpreterKind::Shell,
        InterpreterKind::Batch,
        InterpreterKind::PowerShell,
        InterpreterKind::Node,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InterpreterKind::Python => "python",
            InterpreterKind::Shell => "shell",
            InterpreterKind::Batch => "batch",
            InterpreterKind::PowerShell => "powershell",
            InterpreterKind::Node => "node",
        }
    }

    /// Canonical file extension for stored script bodies.
    pub fn extension(&self) -> &'static str {
        match self {
            InterpreterKind::Python => "py",
            InterpreterKind::Shell => "sh",
            InterpreterKind::Batch => "bat",
            InterpreterKind::PowerShell => "ps1",
            InterpreterKind::Node => "js",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "py" => Some(InterpreterKind::Python),
            "sh" | "bash" => Some(InterpreterKind::Shell),
            "bat" => Some(InterpreterKind::Batch),
            "ps1" => Some(InterpreterKind::PowerShell),
            "js" => Some(InterpreterKind::Node),
            _ => None,
        }
    }

    /// Host invocation: interpreter binary plus fixed leading arguments.
    /// The script path and the parameter-file path are appended by the caller.
    pub fn host_program(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            InterpreterKind::Python => ("python3", &[]),
            InterpreterKind::Shell => ("bash", &[]),
            InterpreterKind::Batch => ("cmd.exe", &["/C"]),
            InterpreterKind::PowerShell => {
                ("powershell", &["-ExecutionPolicy", "Bypass", "-File"])
            }
            InterpreterKind::Node => ("node", &[]),
        }
    }

    /// Build the full host command for a script and its parameter file.
    pub fn host_command(
        &self,
        script_path: &Path,
        params_path: &Path,
    ) -> tokio::process::Command {
        let (program, args) = self.host_program();
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).arg(script_path).arg(params_path);
        cmd
    }

    /// Default container image when the sandbox config does not override it.
    pub fn container_image(&self) -> &'static str {
        match self {
            InterpreterKind::Python => "python:3.11-slim",
            InterpreterKind::Node => "node:20-alpine",
            InterpreterKind::Shell => "ubuntu:22.04",
            InterpreterKind::PowerShell => "mcr.microsoft.com/powershell:latest",
            // Windows containers need a Windows host; kept for completeness.
            InterpreterKind::Batch => "mcr.microsoft.com/windows/servercore:ltsc2022",
        }
    }

    /// Command line executed inside the container. The script directory is
    /// mounted at /app and the parameter file's directory at /params. For
    /// Python, `install_requirements` prefixes a pip install of the
    /// requirements.txt sitting next to the script; that cost is budgeted
    /// into the same watchdog timeout as the script itself.
    pub fn container_command(
        &self,
        script_name: &str,
        params_name: &str,
        install_requirements: bool,
    ) -> Vec<String> {
        let own = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match self {
            InterpreterKind::Python if install_requirements => own(&[
                "sh",
                "-c",
                &format!(
                    "pip install --no-cache-dir -r /app/requirements.txt >/dev/null \
                     && python /app/{script_name} /params/{params_name}"
                ),
            ]),
            InterpreterKind::Python => {
                own(&["python", &format!("/app/{script_name}"), &format!("/params/{params_name}")])
            }
            InterpreterKind::Node => {
                own(&["node", &format!("/app/{script_name}"), &format!("/params/{params_name}")])
            }
            InterpreterKind::Shell => {
                own(&["bash", &format!("/app/{script_name}"), &format!("/params/{params_name}")])
            }
            InterpreterKind::PowerShell => own(&[
                "pwsh",
                "-File",
                &format!("/app/{script_name}"),
                &format!("/params/{params_name}"),
            ]),
            InterpreterKind::Batch => own(&[
                "cmd.exe",
                "/C",
                &format!("C:\\app\\{script_name}"),
                &format!("C:\\params\\{params_name}"),
            ]),
        }
    }
}

impl fmt::Display for InterpreterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterpreterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(InterpreterKind::Python),
            "shell" | "sh" | "bash" => Ok(InterpreterKind::Shell),
            "batch" | "bat" => Ok(InterpreterKind::Batch),
            "powershell" | "ps1" => Ok(InterpreterKind::PowerShell),
            "node" | "js" | "javascript" => Ok(InterpreterKind::Node),
            other => Err(format!("unsupported interpreter kind: {other}")),
        }
    }
}
