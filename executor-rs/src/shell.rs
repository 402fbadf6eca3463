// executor-rs/src/shell.rs
// Host shell selection for running generated command text

use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Interpreter used to run a command string, e.g. `sh -c <command>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn sh() -> Self {
        Self::new("sh", vec!["-c".to_string()])
    }

    pub fn bash() -> Self {
        Self::new("bash", vec!["-c".to_string()])
    }

    pub fn powershell() -> Self {
        Self::new(
            "powershell",
            vec![
                "-NoProfile".to_string(),
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-Command".to_string(),
            ],
        )
    }

    pub fn cmd() -> Self {
        Self::new("cmd", vec!["/C".to_string()])
    }

    /// Look up one of the known shells by name (`sh`, `bash`, `powershell`, `cmd`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sh" => Some(Self::sh()),
            "bash" => Some(Self::bash()),
            "powershell" | "pwsh" => Some(Self::powershell()),
            "cmd" => Some(Self::cmd()),
            _ => None,
        }
    }

    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Self::powershell()
        } else {
            Self::sh()
        }
    }

    /// Short name used in prompts and logs.
    pub fn name(&self) -> &str {
        &self.program
    }

    pub(crate) fn command_for(&self, code: &str) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(code);
        command
    }
}

impl Default for ShellSpec {
    fn default() -> Self {
        Self::platform_default()
    }
}
