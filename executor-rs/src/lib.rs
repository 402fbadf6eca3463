//! Executor Library
//! Runs generated command text on the host shell under a wall-clock timeout

mod execution_logic;
mod shell;

pub use execution_logic::DEFAULT_POLL_INTERVAL;
pub use shell::ShellSpec;

use std::time::Duration;

use async_trait::async_trait;
use shared_types::ExecutionReport;

/// Anything able to run a command string and report back.
///
/// Implementations must not return before the command has exited or been
/// killed, and must never panic on launch failures.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, timeout_secs: u64) -> ExecutionReport;
}

/// Core Executor implementation
#[derive(Debug, Clone)]
pub struct SupervisedExecutor {
    shell: ShellSpec,
    poll_interval: Duration,
}

impl SupervisedExecutor {
    pub fn new(shell: ShellSpec) -> Self {
        Self {
            shell,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        // A zero interval would spin the runtime.
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn shell(&self) -> &ShellSpec {
        &self.shell
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

impl Default for SupervisedExecutor {
    fn default() -> Self {
        Self::new(ShellSpec::platform_default())
    }
}

#[async_trait]
impl CommandRunner for SupervisedExecutor {
    async fn run(&self, command: &str, timeout_secs: u64) -> ExecutionReport {
        execution_logic::run_supervised(
            &self.shell,
            command,
            Duration::from_secs(timeout_secs),
            self.poll_interval,
        )
        .await
    }
}
