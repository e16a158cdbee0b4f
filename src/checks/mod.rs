// SPDX-License-Identifier: MIT
//! Check data model and scheduling.
//!
//! A [`Check`] owns everything about one configured command: the static
//! definition loaded from config, the schedule, and (while a run is in
//! flight) the child process handle and its output buffers. The executor
//! and reaper live in [`runner`], result submission in [`submit`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::process::Child;
use tokio::task::JoinHandle;

pub mod runner;
pub mod submit;

/// Smallest interval (in seconds) a check may be scheduled at.
pub const MIN_INTERVAL: i64 = 10;

/// Exit classification of a check run.
///
/// Checks signal their STATE through their exit code. Anything outside the
/// 0–3 range, and any signal-terminated exit, is recorded as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Warning = 1,
    Critical = 2,
    Unknown = 3,
}

impl Status {
    /// The wire representation of this status.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub(crate) fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Warning,
            2 => Self::Critical,
            _ => Self::Unknown,
        }
    }
}

/// One configured check: definition plus runtime accounting.
#[derive(Debug)]
pub struct Check {
    /// Unique name of the check within the agent.
    pub name: String,
    /// Command to execute, as configured.
    pub command: String,
    /// Interval at which to run the check (seconds).
    pub every: i64,
    /// Interval at which to retry after failure (seconds).
    pub retry_every: i64,
    /// Consecutive failures permitted before output is submitted.
    pub retries: i32,
    /// Maximum wall-clock execution time (seconds).
    pub timeout: i64,
    /// Environment for the child, already merged with global defaults.
    pub env: HashMap<String, String>,
    /// User to run the check as, when not the agent's own user.
    pub run_as: Option<String>,
    /// Bulk checks submit many datapoints per run and bypass retry logic.
    pub bulk: bool,
    /// Bulk checks may report their own exit as a synthetic STATE record.
    pub report: bool,

    /// `command` split into an exec vector. Never empty after config load.
    pub argv: Vec<String>,

    // Runtime accounting. Live only between spawn and reap where noted.
    pub running: bool,
    pub process: Option<Child>,
    pub pid: u32,
    pub exit_status: Option<std::process::ExitStatus>,
    pub exit_observed_at: Option<DateTime<Utc>>,
    pub stdout: Arc<Mutex<Vec<u8>>>,
    pub stderr: Arc<Mutex<Vec<u8>>>,
    pub drains: Vec<JoinHandle<()>>,
    pub output: String,
    pub err_msg: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    /// `started_at - next_run` for the latest run. Signed: a check that
    /// starts ahead of schedule records a negative latency.
    pub latency: Duration,
    pub duration: Duration,
    pub attempts: i32,
    pub rc: Status,
    pub sig_term: bool,
    pub sig_kill: bool,
}

impl Check {
    /// A check with global default settings and an empty command. The
    /// config loader fills in the definition; `next_run` starts in the
    /// past so an unscheduled check is immediately eligible.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: String::new(),
            every: 300,
            retry_every: 60,
            retries: 1,
            timeout: 45,
            env: HashMap::new(),
            run_as: None,
            bulk: false,
            report: false,
            argv: Vec::new(),
            running: false,
            process: None,
            pid: 0,
            exit_status: None,
            exit_observed_at: None,
            stdout: Arc::new(Mutex::new(Vec::new())),
            stderr: Arc::new(Mutex::new(Vec::new())),
            drains: Vec::new(),
            output: String::new(),
            err_msg: String::new(),
            started_at: DateTime::<Utc>::MIN_UTC,
            ended_at: None,
            next_run: DateTime::<Utc>::MIN_UTC,
            latency: Duration::zero(),
            duration: Duration::zero(),
            attempts: 0,
            rc: Status::Ok,
            sig_term: false,
            sig_kill: false,
        }
    }

    /// Schedule the next run at `anchor + interval_seconds`, falling back
    /// to `every` when the interval is unset or nonsensical.
    pub fn schedule(&mut self, anchor: DateTime<Utc>, interval_seconds: i64) {
        let interval = if interval_seconds <= 0 {
            self.every
        } else {
            interval_seconds
        };
        self.next_run = anchor + Duration::seconds(interval);
    }

    /// First-run scheduling: `now + jitter`, where the loader draws the
    /// jitter uniformly from `[0, every)` seconds. Spreading first runs
    /// keeps a config (re)load from starting every check on the same tick.
    pub fn schedule_first_run(&mut self, now: DateTime<Utc>, jitter_ms: i64) {
        let jitter = jitter_ms.clamp(0, self.every.saturating_mul(1000));
        self.next_run = now + Duration::milliseconds(jitter);
    }

    /// Whether the supervisor should start this check on the current tick.
    pub fn should_run(&self, now: DateTime<Utc>) -> bool {
        !self.running && now >= self.next_run
    }

    /// Carry all runtime state over from a previous incarnation of this
    /// check, keeping the (possibly changed) configured fields of `self`.
    /// Used on config reload so schedules, retry ladders, and any
    /// still-running child survive the swap.
    pub fn merge_runtime(&mut self, old: Check) {
        self.running = old.running;
        self.process = old.process;
        self.pid = old.pid;
        self.exit_status = old.exit_status;
        self.exit_observed_at = old.exit_observed_at;
        self.stdout = old.stdout;
        self.stderr = old.stderr;
        self.drains = old.drains;
        self.output = old.output;
        self.err_msg = old.err_msg;
        self.started_at = old.started_at;
        self.ended_at = old.ended_at;
        self.next_run = old.next_run;
        self.latency = old.latency;
        self.duration = old.duration;
        self.attempts = old.attempts;
        self.rc = old.rc;
        self.sig_term = old.sig_term;
        self.sig_kill = old.sig_kill;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn schedule_uses_every_when_interval_unset() {
        let mut check = Check::new("sched");
        check.every = 300;
        check.schedule(at(42), 0);
        assert_eq!(check.next_run, at(342));

        check.schedule(at(42), 60);
        assert_eq!(check.next_run, at(102));

        check.schedule(at(42), -5);
        assert_eq!(check.next_run, at(342));
    }

    #[test]
    fn should_run_gates_on_running_and_next_run() {
        let now = Utc::now();
        let mut check = Check::new("gate");
        assert!(check.should_run(now), "fresh check with past next_run runs");

        check.running = true;
        assert!(!check.should_run(now), "running check never starts again");

        check.running = false;
        check.next_run = now + Duration::hours(1);
        assert!(!check.should_run(now), "future next_run holds the check");

        check.next_run = now - Duration::hours(1);
        assert!(check.should_run(now));
    }

    #[test]
    fn first_run_jitter_is_bounded_by_every() {
        let now = at(1_000);
        let mut check = Check::new("jitter");
        check.every = 30;

        check.schedule_first_run(now, 0);
        assert_eq!(check.next_run, now);

        check.schedule_first_run(now, 12_345);
        assert_eq!(check.next_run, now + Duration::milliseconds(12_345));

        // Out-of-range offsets clamp rather than schedule into the past
        // or past one full interval.
        check.schedule_first_run(now, -5);
        assert_eq!(check.next_run, now);
        check.schedule_first_run(now, 90_000);
        assert_eq!(check.next_run, now + Duration::seconds(30));
    }

    #[test]
    fn merge_runtime_keeps_new_definition_and_old_state() {
        let mut old = Check::new("third");
        old.command = "echo \"third success\"".into();
        old.argv = vec!["echo".into(), "third success".into()];
        old.next_run = at(42);
        old.started_at = at(15);
        old.ended_at = Some(at(20));
        old.duration = Duration::seconds(5);
        old.latency = Duration::milliseconds(1_345);
        old.attempts = 2;
        old.rc = Status::Critical;
        old.output = "old output".into();
        old.err_msg = "old error".into();
        old.sig_term = true;
        old.sig_kill = true;
        old.running = true;
        old.pid = 4321;

        let mut new = Check::new("third");
        new.command = "echo \"new command\"".into();
        new.argv = vec!["echo".into(), "new command".into()];
        new.every = 40;
        new.retry_every = 27;
        new.retries = 15;
        new.timeout = 22;

        new.merge_runtime(old);

        assert_eq!(new.command, "echo \"new command\"");
        assert_eq!(new.every, 40);
        assert_eq!(new.retries, 15);
        assert_eq!(new.next_run, at(42));
        assert_eq!(new.started_at, at(15));
        assert_eq!(new.ended_at, Some(at(20)));
        assert_eq!(new.duration, Duration::seconds(5));
        assert_eq!(new.latency, Duration::milliseconds(1_345));
        assert_eq!(new.attempts, 2);
        assert_eq!(new.rc, Status::Critical);
        assert_eq!(new.output, "old output");
        assert_eq!(new.err_msg, "old error");
        assert!(new.sig_term && new.sig_kill && new.running);
        assert_eq!(new.pid, 4321);
    }

    #[test]
    fn status_codes_round_trip() {
        assert_eq!(Status::from_code(0), Status::Ok);
        assert_eq!(Status::from_code(1), Status::Warning);
        assert_eq!(Status::from_code(2), Status::Critical);
        assert_eq!(Status::from_code(3), Status::Unknown);
        assert_eq!(Status::from_code(15), Status::Unknown);
        assert_eq!(Status::from_code(-1), Status::Unknown);
        assert_eq!(Status::Critical.code(), 2);
    }
}
