use std::io::ErrorKind;
use std::process::Stdio;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::HandlerConfig;
use crate::event::{EventHandler, InboundEvent};

/// Runs an external program per event.
///
/// The event is written to the child's stdin as one JSON document and
/// `EVENT_NAME` is set in its environment. A non-zero exit status is a
/// failed attempt; the error carries the child's stderr.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    command: String,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Run the command once with `input` on stdin and return its stdout.
    pub async fn run(&self, input: &[u8], envs: &[(&str, &str)]) -> anyhow::Result<Vec<u8>> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(envs.iter().copied())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn `{}`", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits without reading its input is judged by its status.
            match stdin.write_all(input).await {
                Err(e) if e.kind() != ErrorKind::BrokenPipe => {
                    return Err(e).context("Failed to write to child stdin");
                }
                _ => {}
            }
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for `{}`", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "`{}` exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            );
        }

        debug!(
            command = %self.command,
            stdout_bytes = output.stdout.len(),
            "Command finished"
        );
        Ok(output.stdout)
    }
}

impl From<&HandlerConfig> for CommandHandler {
    fn from(config: &HandlerConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

#[async_trait]
impl EventHandler for CommandHandler {
    async fn handle(&self, event: &InboundEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(event).context("Failed to serialize event")?;
        self.run(&payload, &[("EVENT_NAME", event.name.as_str())])
            .await?;
        Ok(())
    }
}
