// SPDX-License-Identifier: MIT
//! Check execution: spawning, non-blocking reaping, timeout escalation.
//!
//! The supervisor never blocks on a child. `spawn` starts the process with
//! piped stdout/stderr drained by background tasks; `reap` polls with
//! `try_wait`, sending SIGTERM at `timeout` and SIGKILL two seconds later
//! if the child won't die, and finalizes accounting once the child has
//! exited and its pipes are fully drained.

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{Check, Status};

/// Grace period between SIGTERM and SIGKILL, in seconds. Gives a
/// cooperative child a chance to flush before the forcible kill.
const KILL_GRACE: i64 = 2;

/// How long after the child's exit the reaper keeps waiting for the
/// output pipes to hit EOF. A grandchild that inherited the pipes can
/// hold them open indefinitely; past this the run is finalized with
/// whatever output has arrived.
const DRAIN_GRACE: i64 = 1;

/// Why a check could not be started. Per-check and non-fatal: the
/// supervisor records the failure via [`Check::fail`] and moves on.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("check {name}[{pid}] is already running")]
    AlreadyRunning { name: String, pid: u32 },
    #[error("check {0} has no command")]
    NoCommand(String),
    #[error("unknown user {0:?}")]
    UnknownUser(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Check {
    /// Start one run of this check.
    ///
    /// The child gets the merged environment (and nothing else), `/` as its
    /// working directory, and, when `run_as` is set, the uid/gid of that
    /// user. Its stdout/stderr are drained into in-memory buffers by
    /// dedicated tasks so the child can never block on a full pipe.
    ///
    /// `started_at` is recorded before any fallible work: a spawn that
    /// fails must still push `next_run` forward (via [`Check::fail`]), or
    /// a broken check would be retried every tick.
    pub fn spawn(&mut self, now: DateTime<Utc>) -> Result<(), SpawnError> {
        if self.running {
            return Err(SpawnError::AlreadyRunning {
                name: self.name.clone(),
                pid: self.pid,
            });
        }
        let Some(program) = self.argv.first() else {
            return Err(SpawnError::NoCommand(self.name.clone()));
        };

        self.started_at = now;

        let mut cmd = Command::new(program);
        cmd.args(&self.argv[1..])
            .env_clear()
            .envs(&self.env)
            .current_dir("/")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(user) = &self.run_as {
            let account = uzers::get_user_by_name(user)
                .ok_or_else(|| SpawnError::UnknownUser(user.clone()))?;
            debug!(check = %self.name, user = %user, uid = account.uid(), "running as alternate user");
            cmd.uid(account.uid()).gid(account.primary_group_id());
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        debug!(check = %self.name, pid, "check initiated");

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let mut drains = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            drains.push(drain(pipe, stdout.clone()));
        }
        if let Some(pipe) = child.stderr.take() {
            drains.push(drain(pipe, stderr.clone()));
        }

        self.process = Some(child);
        self.pid = pid;
        self.running = true;
        self.exit_status = None;
        self.exit_observed_at = None;
        self.ended_at = None;
        self.duration = Duration::zero();
        self.sig_term = false;
        self.sig_kill = false;
        self.stdout = stdout;
        self.stderr = stderr;
        self.drains = drains;
        Ok(())
    }

    /// Poll a running check without blocking.
    ///
    /// Returns `true` only once the child has exited and the accounting is
    /// finalized. While the child is alive, the timeout escalation runs:
    /// past `timeout` the child gets SIGTERM, past `timeout + 2s` SIGKILL;
    /// both paths return `false` and a later tick observes the exit. Wait
    /// errors are logged and retried on the next tick. Calling this on an
    /// idle check is a no-op returning `false`.
    pub fn reap(&mut self, now: DateTime<Utc>) -> bool {
        let Some(child) = self.process.as_mut() else {
            return false;
        };

        if self.exit_status.is_none() {
            match child.try_wait() {
                Err(e) => {
                    error!(check = %self.name, pid = self.pid, "error waiting on process: {e}");
                    return false;
                }
                Ok(None) => {
                    self.escalate(now);
                    return false;
                }
                Ok(Some(status)) => {
                    self.exit_status = Some(status);
                    self.exit_observed_at = Some(now);
                }
            }
        }

        // The child is gone but the pipe drains may still be flushing
        // buffered output; finalizing now would truncate large outputs.
        if self.drains.iter().any(|d| !d.is_finished()) {
            let waited_out = self
                .exit_observed_at
                .is_some_and(|seen| now >= seen + Duration::seconds(DRAIN_GRACE));
            if !waited_out {
                return false;
            }
            // Something (a grandchild, usually) still holds the pipes
            // open; take what we have.
            warn!(check = %self.name, pid = self.pid, "output pipes still open after exit, finalizing with partial output");
            for handle in &self.drains {
                handle.abort();
            }
        }

        let Some(status) = self.exit_status.take() else {
            return false;
        };
        self.exit_observed_at = None;
        self.process = None;
        self.drains.clear();
        self.running = false;
        self.ended_at = Some(now);
        self.duration = now - self.started_at;
        self.latency = self.started_at - self.next_run;
        self.output = String::from_utf8_lossy(&take_buffer(&self.stdout)).into_owned();
        self.err_msg = String::from_utf8_lossy(&take_buffer(&self.stderr)).into_owned();

        self.rc = match status.code() {
            Some(code @ 0..=3) => Status::from_code(code),
            Some(code) => {
                debug!(check = %self.name, code, "invalid exit code, recording UNKNOWN");
                Status::Unknown
            }
            None => {
                debug!(check = %self.name, "exited abnormally (signalled), recording UNKNOWN");
                Status::Unknown
            }
        };

        self.reschedule();

        if now > self.next_run {
            warn!(
                check = %self.name,
                duration_s = self.duration.num_seconds(),
                "run overran its interval; consider tuning timeout"
            );
        }
        true
    }

    /// Record a spawn failure as a completed UNKNOWN run, so the retry
    /// ladder and schedule advance exactly as they would for a check that
    /// ran and failed.
    pub fn fail(&mut self, err: &dyn std::fmt::Display, now: DateTime<Utc>) {
        self.ended_at = Some(now);
        self.duration = now - self.started_at;
        self.latency = self.started_at - self.next_run;
        self.output = String::new();
        self.err_msg = format!("failed to exec: {err}");
        self.rc = Status::Unknown;
        self.sig_term = false;
        self.sig_kill = false;
        self.reschedule();
    }

    /// Advance `next_run` and the retry ladder after a finished run.
    ///
    /// The base schedule is `started_at + every`. Non-bulk failures bump
    /// `attempts` and, while the retry budget lasts, run again at
    /// `started_at + retry_every` instead. Any OK run resets the ladder.
    fn reschedule(&mut self) {
        self.schedule(self.started_at, self.every);
        if self.bulk {
            return;
        }
        if self.rc == Status::Ok {
            self.attempts = 0;
        } else {
            self.attempts += 1;
            if self.attempts < self.retries {
                self.schedule(self.started_at, self.retry_every);
            }
        }
    }

    fn escalate(&mut self, now: DateTime<Utc>) {
        let deadline = self.started_at + Duration::seconds(self.timeout);
        if now >= deadline + Duration::seconds(KILL_GRACE) {
            warn!(check = %self.name, pid = self.pid, "SIGTERM ignored, sending SIGKILL");
            self.signal(libc::SIGKILL);
            self.sig_kill = true;
        } else if !self.sig_kill && now >= deadline {
            warn!(check = %self.name, pid = self.pid, timeout_s = self.timeout, "timed out, sending SIGTERM");
            self.signal(libc::SIGTERM);
            self.sig_term = true;
        }
    }

    fn signal(&self, signal: i32) {
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, signal) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            error!(check = %self.name, pid = self.pid, signal, "error signalling process: {err}");
        }
    }
}

fn take_buffer(buf: &Arc<Mutex<Vec<u8>>>) -> Vec<u8> {
    std::mem::take(&mut *buf.lock().unwrap_or_else(PoisonError::into_inner))
}

fn drain(
    mut pipe: impl AsyncReadExt + Unpin + Send + 'static,
    buf: Arc<Mutex<Vec<u8>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]),
            }
        }
    })
}
