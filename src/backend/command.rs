use std::io;
use std::process::{ExitStatus, Stdio};

use eyre::Result;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, span, Instrument, Level};

use crate::backend::Evacuate;
use crate::metadata::ScheduledEvent;

/// Shell commands run by the command backend. A missing command is a successful no-op.
#[derive(Clone, Debug, Default)]
pub struct CommandConfig {
    pub test: Option<String>,
    pub drain: Option<String>,
    pub uncordon: Option<String>,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn '{command}'")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("'{command}' exited with {status}")]
    Failed { command: String, status: ExitStatus },
}

pub struct CommandBackend {
    config: CommandConfig,
    instance_name: String,
}

impl CommandBackend {
    pub fn new(config: CommandConfig, instance_name: impl Into<String>) -> Self {
        Self {
            config,
            instance_name: instance_name.into(),
        }
    }

    async fn run(&self, command: &str, event: Option<&ScheduledEvent>) -> Result<(), CommandError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(event) = event {
            cmd.envs(event.env_vars());
        }

        debug!(%command, "exec");
        let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
            command: command.to_owned(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (_, _, status) = tokio::join!(
            forward_lines(stdout, "stdout"),
            forward_lines(stderr, "stderr"),
            child.wait(),
        );

        let status = status.map_err(|source| CommandError::Spawn {
            command: command.to_owned(),
            source,
        })?;
        if !status.success() {
            return Err(CommandError::Failed {
                command: command.to_owned(),
                status,
            });
        }

        Ok(())
    }

    async fn run_logged(&self, action: &str, command: &str, event: Option<&ScheduledEvent>) -> bool {
        let span = span!(Level::INFO, "command", action);
        async move {
            match self.run(command, event).await {
                Ok(()) => true,
                Err(err) => {
                    error!(?err, "command failed");
                    false
                }
            }
        }
        .instrument(span)
        .await
    }
}

async fn forward_lines(pipe: Option<impl AsyncRead + Unpin>, stream: &'static str) {
    let Some(pipe) = pipe else {
        return;
    };

    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(command = "sh", stream, "{line}"),
            Ok(None) => break,
            Err(err) => {
                debug!(?err, stream, "unable to read command output");
                break;
            }
        }
    }
}

impl Evacuate for CommandBackend {
    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    async fn test(&self) -> Result<()> {
        if let Some(command) = &self.config.test {
            self.run(command, None).await?;
        }

        Ok(())
    }

    async fn drain(&self, event: &ScheduledEvent) -> bool {
        match &self.config.drain {
            Some(command) => self.run_logged("drain", command, Some(event)).await,
            None => true,
        }
    }

    async fn uncordon(&self) -> bool {
        match &self.config.uncordon {
            Some(command) => self.run_logged("uncordon", command, None).await,
            None => true,
        }
    }
}
