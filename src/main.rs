// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use regex::Regex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bmad::{config, signals, supervisor};

#[derive(Parser)]
#[command(
    name = "bmad",
    about = "Bolo monitoring agent: runs checks at their intervals and submits results upstream",
    version
)]
struct Args {
    /// Alternate configuration file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG)]
    config: PathBuf,

    /// Ignore scheduling and execute one run of all matching checks, sequentially
    #[arg(short, long)]
    test: bool,

    /// Regex for filtering checks in --test mode
    #[arg(short, long, default_value = ".")]
    r#match: String,

    /// Disable result submission (only used with --test)
    #[arg(short, long)]
    noop: bool,

    /// Log filter, overriding the config's log.level
    #[arg(long, env = "BMAD_LOG")]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Help is not a successful run of the agent.
            let code = match e.kind() {
                ErrorKind::DisplayHelp => 1,
                ErrorKind::DisplayVersion => 0,
                _ => 2,
            };
            e.print().ok();
            exit(code);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&args))
        .compact()
        .init();

    let mut cfg = config::load(&args.config)
        .with_context(|| format!("couldn't load config file {}", args.config.display()))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %cfg.host,
        checks = cfg.checks.len(),
        "bmad starting up"
    );

    if args.test {
        let pattern = Regex::new(&args.r#match).context("invalid --match regex")?;
        supervisor::run_once(&mut cfg, &pattern, args.noop).await
    } else {
        let flags = signals::install().context("installing signal handlers")?;
        supervisor::run(cfg, &args.config, flags).await
    }
}

/// Filter precedence: an explicit `--log`/`BMAD_LOG` wins, then the
/// config's `log.level` (peeked before the subscriber goes up so the
/// full load's diagnostics are captured), then `RUST_LOG`, then `info`.
/// Level changes in the config take effect on restart, not reload.
fn log_filter(args: &Args) -> EnvFilter {
    if let Some(level) = &args.log {
        return EnvFilter::new(level);
    }
    let peeked = config::peek_log(&args.config);
    if !peeked.level.is_empty() {
        return EnvFilter::new(&peeked.level);
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
