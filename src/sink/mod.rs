// SPDX-License-Identifier: MIT
//! The submission sink: a long-lived `send_bolo` child process that holds
//! the upstream connection. bmad feeds it newline-delimited records over
//! its stdin and otherwise leaves the transport alone.

use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tracing::{debug, error};

use crate::checks::submit::Submitter;

pub struct Sink {
    stdin: ChildStdin,
    pid: u32,
}

impl Sink {
    /// Spawn the configured submission command and hold its stdin open.
    /// Failing to spawn here is fatal at startup; on reload the caller
    /// decides.
    pub fn connect(command: &str) -> Result<Self> {
        let argv = shlex::split(command)
            .ok_or_else(|| anyhow!("unparseable send_bolo command {command:?}"))?;
        let Some(program) = argv.first() else {
            anyhow::bail!("empty send_bolo command");
        };
        debug!(?argv, "spawning submission sink");

        let mut child = Command::new(program)
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning submission sink {program:?}"))?;
        let stdin = child.stdin.take().context("submission sink has no stdin")?;
        let pid = child.id().unwrap_or(0);

        // The handle's only remaining job is reaping the child when it
        // exits; a detached task waits on it so no zombie lingers.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(%status, "submission sink exited"),
                Err(e) => error!("error waiting on submission sink: {e}"),
            }
        });

        Ok(Self { stdin, pid })
    }

    /// Close the pipe. The sink child sees EOF, drains whatever it has
    /// buffered, and exits on its own schedule.
    pub fn disconnect(self) {
        debug!(pid = self.pid, "closing submission sink pipe");
    }
}

#[async_trait]
impl Submitter for Sink {
    async fn send(&mut self, msg: &str) -> Result<()> {
        self.stdin
            .write_all(msg.as_bytes())
            .await
            .context("writing to submission sink")?;
        self.stdin.flush().await.context("flushing submission sink")?;
        Ok(())
    }
}
