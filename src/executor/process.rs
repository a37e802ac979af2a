use super::{CodeExecutor, DisplayItem, ExecutionOutput, OutputTag};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Runs code as `<interpreter> -c <code>` in a child process
pub struct ProcessExecutor {
    interpreter: String,
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(interpreter: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CodeExecutor for ProcessExecutor {
    async fn execute(&self, code: &str) -> Result<ExecutionOutput> {
        debug!("Executing {} bytes of code with {}", code.len(), self.interpreter);

        let mut command = Command::new(&self.interpreter);
        command.arg("-c").arg(code).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .with_context(|| format!("execution timed out after {}s", self.timeout.as_secs()))?
            .with_context(|| format!("failed to start interpreter '{}'", self.interpreter))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        let mut display = Vec::new();
        if !stdout.is_empty() {
            display.push(DisplayItem::new(OutputTag::Stdout, stdout.clone()));
        }

        let mut text_for_model = stdout;
        if !output.status.success() {
            display.push(DisplayItem::new(OutputTag::Error, stderr.clone()));
            text_for_model.push_str(&stderr);
        }

        Ok(ExecutionOutput {
            text_for_model,
            display,
        })
    }
}
