// SPDX-License-Identifier: MIT
//! Result submission: the check's own output, the synthetic STATE for
//! bulk+report checks, and the meta-stats bmad derives about every run.
//!
//! The wire format is newline-delimited ASCII records; the upstream parser
//! depends on the exact field layout, so every line here is single-space
//! separated with timestamps in whole seconds and durations as `%.4f`
//! seconds.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use super::{Check, Status};

/// Where finished check results go. The daemon feeds the `send_bolo`
/// pipe ([`crate::sink::Sink`]); tests capture records in memory.
#[async_trait]
pub trait Submitter: Send {
    async fn send(&mut self, msg: &str) -> Result<()>;
}

impl Check {
    /// Whether this run's own output is forwarded upstream. Bulk checks
    /// always submit; non-bulk checks hold output back until the retry
    /// budget is exhausted (the definitive failure) or the run came back
    /// OK. Meta-stats are never gated.
    pub fn submits_output(&self) -> bool {
        self.bulk || self.rc == Status::Ok || self.attempts >= self.retries
    }

    /// Submit the finished run.
    ///
    /// `full_stats` adds the agent-wide latency sample and check counter
    /// that only make sense from the daemon loop; one-shot mode leaves
    /// them out.
    pub async fn submit(
        &self,
        host: &str,
        full_stats: bool,
        sink: &mut dyn Submitter,
    ) -> Result<()> {
        let ts = Utc::now().timestamp();
        let name = &self.name;

        if self.submits_output() && !self.output.is_empty() {
            if self.output.ends_with('\n') {
                sink.send(&self.output).await?;
            } else {
                sink.send(&format!("{}\n", self.output)).await?;
            }
        }

        if self.bulk && self.report {
            let msg = if self.rc == Status::Ok {
                format!("{name} completed successfully!")
            } else {
                self.err_msg.replace('\n', " ")
            };
            let rc = self.rc.code();
            sink.send(&format!("STATE {ts} {host}:bmad:{name} {rc} {msg}\n"))
                .await?;
        }

        let exec_time = seconds(self.duration);
        sink.send(&format!(
            "SAMPLE {ts} {host}:bmad:{name}:exec-time {exec_time:.4}\n"
        ))
        .await?;
        sink.send(&format!("SAMPLE {ts} {host}:bmad:exec-time {exec_time:.4}\n"))
            .await?;

        if full_stats {
            let latency = seconds(self.latency);
            sink.send(&format!("SAMPLE {ts} {host}:bmad:latency {latency:.4}\n"))
                .await?;
            sink.send(&format!("COUNTER {ts} {host}:bmad:checks\n")).await?;
        }
        Ok(())
    }
}

fn seconds(d: chrono::Duration) -> f64 {
    match d.num_microseconds() {
        Some(us) => us as f64 / 1e6,
        None => d.num_milliseconds() as f64 / 1e3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn seconds_keeps_sign_and_precision() {
        assert_eq!(seconds(Duration::milliseconds(24)), 0.024);
        assert_eq!(seconds(Duration::seconds(42)), 42.0);
        assert_eq!(seconds(Duration::milliseconds(-150)), -0.15);
        assert_eq!(format!("{:.4}", seconds(Duration::milliseconds(24))), "0.0240");
    }

    #[test]
    fn gating_follows_bulk_rc_and_attempts() {
        let mut check = Check::new("gate");
        check.retries = 3;

        check.rc = Status::Critical;
        check.attempts = 1;
        assert!(!check.submits_output(), "failing non-bulk within budget is withheld");

        check.attempts = 3;
        assert!(check.submits_output(), "budget exhausted submits");

        check.attempts = 1;
        check.rc = Status::Ok;
        assert!(check.submits_output(), "OK always submits");

        check.rc = Status::Critical;
        check.bulk = true;
        assert!(check.submits_output(), "bulk always submits");
    }
}
