// SPDX-License-Identifier: MIT
//! The supervisor: a single tick loop that owns the whole check set.
//!
//! Every 100ms the loop honors the lifecycle flags, starts checks whose
//! schedule came due, and polls in-flight children. Checks are OS
//! processes, not tasks, so one slow check never holds up another; the
//! loop itself never blocks on a child.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::config::{self, Config};
use crate::signals::Flags;
use crate::sink::Sink;

/// Supervisor cadence.
pub const TICK: Duration = Duration::from_millis(100);

/// Pause between closing the old sink pipe and spawning the new one on
/// reload, so buffered records get read before the EOF lands.
const SINK_DRAIN: Duration = Duration::from_millis(250);

/// Daemon mode: run checks on their schedules until shutdown.
///
/// In-flight runs are tracked by name and re-resolved against the check
/// map each tick; a reload merges runtime state (including live child
/// handles) into the new set, so surviving checks keep being reaped and
/// removed ones orphan their children to the OS.
pub async fn run(mut cfg: Config, cfg_path: &Path, flags: Arc<Flags>) -> Result<()> {
    let mut sink = Sink::connect(&cfg.send_bolo).context("spawning submission sink")?;
    let mut in_flight: Vec<String> = Vec::new();

    loop {
        if flags.shutdown_requested() {
            info!("shutdown requested");
            sink.disconnect();
            return Ok(());
        }

        if flags.take_reload() {
            info!("configuration reload requested");
            match config::load(cfg_path) {
                Ok(mut next) => {
                    next.merge_runtime(&mut cfg);
                    cfg = next;
                    in_flight.retain(|name| cfg.checks.get(name).is_some_and(|c| c.running));
                    // Give the old sink a moment to drain before the
                    // respawn picks up any new submit command.
                    tokio::time::sleep(SINK_DRAIN).await;
                    sink.disconnect();
                    sink = Sink::connect(&cfg.send_bolo)
                        .context("respawning submission sink after reload")?;
                }
                Err(e) => error!("couldn't reload config: {e:#}"),
            }
        }

        if flags.take_dump() {
            info!("configuration dump requested");
            warn!("configuration dumping unsupported");
        }

        let host = cfg.host.clone();
        let now = Utc::now();
        for check in cfg.checks.values_mut() {
            if !check.should_run(now) {
                continue;
            }
            debug!(check = %check.name, "spawning check");
            match check.spawn(now) {
                Ok(()) => in_flight.push(check.name.clone()),
                Err(e) => {
                    error!(check = %check.name, "error spawning check: {e}");
                    check.fail(&e, Utc::now());
                    if let Err(e) = check.submit(&host, true, &mut sink).await {
                        error!(check = %check.name, "error submitting results: {e:#}");
                    }
                }
            }
        }

        let now = Utc::now();
        let mut still_running = Vec::with_capacity(in_flight.len());
        for name in in_flight.drain(..) {
            let Some(check) = cfg.checks.get_mut(&name) else {
                continue;
            };
            if check.reap(now) {
                debug!(check = %name, rc = check.rc.code(), "check reaped");
                if let Err(e) = check.submit(&host, true, &mut sink).await {
                    error!(check = %name, "error submitting results: {e:#}");
                }
            } else {
                still_running.push(name);
            }
        }
        in_flight = still_running;

        tokio::time::sleep(TICK).await;
    }
}

/// One-shot `--test` mode: run every check whose name matches `pattern`,
/// sequentially and in the foreground, printing results to the console.
/// Submission is skipped entirely in noop mode.
pub async fn run_once(cfg: &mut Config, pattern: &Regex, noop: bool) -> Result<()> {
    let mut sink = if noop {
        None
    } else {
        Some(Sink::connect(&cfg.send_bolo).context("spawning submission sink")?)
    };
    let host = cfg.host.clone();

    let mut names: Vec<String> = cfg.checks.keys().cloned().collect();
    names.sort();

    let mut ran = 0usize;
    for name in names {
        if !pattern.is_match(&name) {
            continue;
        }
        let Some(check) = cfg.checks.get_mut(&name) else {
            continue;
        };
        ran += 1;

        println!("---------------------------");
        println!("Executing {name} in --test mode");
        println!("---------------------------");

        match check.spawn(Utc::now()) {
            Ok(()) => {
                while !check.reap(Utc::now()) {
                    tokio::time::sleep(TICK).await;
                }
            }
            Err(e) => {
                println!("Error executing {name}: {e}");
                check.fail(&e, Utc::now());
            }
        }

        println!("Results:");
        for line in check.output.lines() {
            println!("\t{line}");
        }

        match sink.as_mut() {
            Some(sink) => {
                print!("Sending results to bolo...");
                match check.submit(&host, false, sink).await {
                    Ok(()) => println!("Ok"),
                    Err(e) => println!("Error submitting results: {e:#}"),
                }
            }
            None => println!("no-op mode enabled. Skipping check result submission"),
        }
        println!();
    }

    println!("---------------------------");
    println!("Found and ran {ran} checks matching `{pattern}`");
    println!("---------------------------");
    Ok(())
}
