use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{error, info};

use crate::server::mirror::template::render_on_missing;
use crate::server::mirror::{CompiledTemplate, RewriteContext};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("Failed to render on-missing command: {0}")]
    Render(#[from] tera::Error),

    #[error("Failed to start on-missing command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("On-missing command timed out after {0:?}")]
    Timeout(Duration),

    #[error("On-missing command exited with {status}")]
    Failed { status: String, output: String },
}

/// Executes a rendered command line and returns its combined output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<String, HookError>;
}

/// Runs commands through `sh -c`, bounded by a timeout.
///
/// The child is killed when the returned future is dropped, so a client
/// disconnect or the timeout both terminate it.
pub struct ShellRunner {
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<String, HookError> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(HookError::Spawn)?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| HookError::Timeout(self.timeout))?
            .map_err(HookError::Spawn)?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(HookError::Failed {
                status: output.status.to_string(),
                output: combined,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// The template rendered to nothing
    NotConfigured,
    Executed,
}

/// Render the on-missing template for `context` and run it.
pub async fn run_on_missing(
    runner: &dyn CommandRunner,
    template: &CompiledTemplate,
    context: &RewriteContext,
) -> Result<HookOutcome, HookError> {
    let command = render_on_missing(
        template,
        &context.raw_view(),
        &context.raw,
        &context.mirror_view(),
        &context.mirror,
    )?;
    if command.is_empty() {
        return Ok(HookOutcome::NotConfigured);
    }

    info!(command = %command, raw = %context.raw, mirror = %context.mirror, "Running on-missing hook");
    match runner.run(&command).await {
        Ok(output) => {
            info!(command = %command, output = %output.trim_end(), "On-missing hook finished");
            Ok(HookOutcome::Executed)
        }
        Err(e) => {
            if let HookError::Failed { output, .. } = &e {
                error!(command = %command, output = %output.trim_end(), "On-missing hook failed");
            }
            Err(e)
        }
    }
}
