// SPDX-License-Identifier: MIT
//! bmad, the Bolo Monitoring Agent.
//!
//! bmad executes configured monitoring checks at periodic intervals and
//! streams their output, plus meta-stats about the check runs themselves,
//! up to a bolo server through a `send_bolo` child process.
//!
//! Configuration is YAML. The main file (`/etc/bmad.conf` by default)
//! carries global defaults and a `checks` map; every `*.conf` file in
//! `include_dir` contributes additional check definitions:
//!
//! ```yaml
//! send_bolo:   /usr/bin/send_bolo -t stream -e tcp://bolo.example.com:2999
//! every:       300
//! retry_every: 60
//! checks:
//!   hostinfo:
//!     command: /usr/lib/bolo/collectors/hostinfo
//!     every:   3600
//!     bulk:    true
//! ```
//!
//! Checks exit with their STATE: 0 OK, 1 WARNING, 2 CRITICAL, 3 UNKNOWN.
//! Non-bulk checks that fail are retried at `retry_every` until `retries`
//! consecutive failures, at which point their output is submitted. Bulk
//! checks bypass the retry logic and may report their own exit as a
//! synthetic STATE record (`report: true`).

pub mod checks;
pub mod config;
pub mod hostname;
pub mod signals;
pub mod sink;
pub mod supervisor;
