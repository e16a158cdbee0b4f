// SPDX-License-Identifier: MIT
//! Configuration loading.
//!
//! The main YAML file carries global defaults and a `checks` map; every
//! `*.conf` file in `include_dir` is a bare map of additional check
//! definitions. Raw entries are deserialized with optional fields, then
//! normalized: defaults applied, intervals clamped into sane relations,
//! environments merged. Invalid checks are dropped with a log; only an
//! unreadable or unparseable root file fails the whole load.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::checks::{Check, MIN_INTERVAL};

pub const DEFAULT_CONFIG: &str = "/etc/bmad.conf";
const DEFAULT_SEND_BOLO: &str = "send_bolo -t stream";
const DEFAULT_INCLUDE_DIR: &str = "/etc/bmad.d";

/// Logging facility settings. Only `level` is interpreted; the rest of
/// the object (type, facility, file) is accepted as opaque so existing
/// configs keep loading.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: String,
}

/// The agent configuration after normalization.
#[derive(Debug)]
pub struct Config {
    /// Command spawned to hold the upstream connection.
    pub send_bolo: String,
    pub every: i64,
    pub retry_every: i64,
    pub retries: i32,
    pub timeout: i64,
    pub bulk: bool,
    pub report: bool,
    pub env: HashMap<String, String>,
    /// Hostname prefixed onto every emitted metric.
    pub host: String,
    pub include_dir: PathBuf,
    pub log: LogConfig,
    /// All checks to run, keyed by name.
    pub checks: HashMap<String, Check>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    send_bolo: Option<String>,
    every: Option<i64>,
    retry_every: Option<i64>,
    retries: Option<i32>,
    timeout: Option<i64>,
    bulk: Option<bool>,
    report: Option<bool>,
    env: Option<HashMap<String, String>>,
    host: Option<String>,
    include_dir: Option<PathBuf>,
    log: Option<LogConfig>,
    // Kept as raw values so one type-invalid check is dropped on its own
    // instead of failing the whole document.
    checks: Option<HashMap<String, serde_yaml::Value>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawCheck {
    command: Option<String>,
    /// Overrides the map key the check was defined under.
    name: Option<String>,
    every: Option<i64>,
    retry_every: Option<i64>,
    retries: Option<i32>,
    timeout: Option<i64>,
    env: Option<HashMap<String, String>>,
    run_as: Option<String>,
    bulk: Option<bool>,
    report: Option<bool>,
}

/// Load and normalize the configuration at `path`.
pub fn load(path: &Path) -> Result<Config> {
    load_with_jitter(path, |every_s| {
        rand::thread_rng().gen_range(0..every_s.max(1) * 1000)
    })
}

/// Load with an injected first-run jitter source. `jitter_ms` receives a
/// check's `every` in seconds and returns the initial schedule offset in
/// milliseconds. This is the only non-determinism in scheduling, pinned
/// down here so tests can fix it.
pub fn load_with_jitter(path: &Path, mut jitter_ms: impl FnMut(i64) -> i64) -> Result<Config> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let raw: RawConfig = serde_yaml::from_str(&source)
        .with_context(|| format!("parsing config file {}", path.display()))?;

    let mut cfg = Config {
        send_bolo: raw.send_bolo.unwrap_or_else(|| DEFAULT_SEND_BOLO.into()),
        every: raw.every.unwrap_or(300),
        retry_every: raw.retry_every.unwrap_or(60),
        retries: raw.retries.unwrap_or(1),
        timeout: raw.timeout.unwrap_or(45),
        bulk: raw.bulk.unwrap_or(false),
        report: raw.report.unwrap_or(false),
        env: raw.env.unwrap_or_default(),
        host: raw.host.unwrap_or_else(crate::hostname::discover),
        include_dir: raw.include_dir.unwrap_or_else(|| DEFAULT_INCLUDE_DIR.into()),
        log: raw.log.unwrap_or_default(),
        checks: HashMap::new(),
    };

    let mut defs: HashMap<String, serde_yaml::Value> = raw.checks.unwrap_or_default();
    for (file, entries) in include_files(&cfg.include_dir) {
        for (name, check) in entries {
            if defs.contains_key(&name) {
                warn!(check = %name, file = %file.display(), "check defined in multiple config files, ignoring this definition");
                continue;
            }
            defs.insert(name, check);
        }
    }

    let now = Utc::now();
    let mut names: Vec<String> = defs.keys().cloned().collect();
    names.sort();
    for key in names {
        let Some(value) = defs.remove(&key) else {
            continue;
        };
        match build_check(&key, value, &cfg) {
            Ok(mut check) => {
                if cfg.checks.contains_key(&check.name) {
                    warn!(check = %check.name, "duplicate check name after override, ignoring this definition");
                    continue;
                }
                check.schedule_first_run(now, jitter_ms(check.every));
                debug!(check = %check.name, every = check.every, timeout = check.timeout, "check defined");
                cfg.checks.insert(check.name.clone(), check);
            }
            Err(e) => error!(check = %key, "invalid check config: {e:#} (skipping)"),
        }
    }

    Ok(cfg)
}

/// Read just the `log` object from the root file, so logging can be
/// initialized before the full load runs (and its diagnostics have
/// somewhere to go). Errors are ignored here; the real load reports them.
pub fn peek_log(path: &Path) -> LogConfig {
    #[derive(Deserialize)]
    struct Peek {
        #[serde(default)]
        log: LogConfig,
    }

    fs::read_to_string(path)
        .ok()
        .and_then(|source| serde_yaml::from_str::<Peek>(&source).ok())
        .map(|peek| peek.log)
        .unwrap_or_default()
}

impl Config {
    /// Carry runtime state from the previous configuration into this one,
    /// matching checks by name. Checks that disappeared from the config
    /// are dropped along with `old`; new checks keep their jittered first
    /// run.
    pub fn merge_runtime(&mut self, old: &mut Config) {
        for (name, check) in self.checks.iter_mut() {
            if let Some(prev) = old.checks.remove(name) {
                debug!(check = %name, "preserving runtime state across reload");
                check.merge_runtime(prev);
            }
        }
    }
}

/// Parse every `*.conf` in `dir` as a map of check definitions, in sorted
/// file order so "first definition wins" is deterministic. A missing or
/// unreadable directory only costs a log line.
fn include_files(dir: &Path) -> Vec<(PathBuf, HashMap<String, serde_yaml::Value>)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), "not loading auxiliary configs: {e}");
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "conf"))
        .collect();
    files.sort();

    let mut parsed = Vec::with_capacity(files.len());
    for file in files {
        debug!(file = %file.display(), "loading auxiliary config");
        let source = match fs::read_to_string(&file) {
            Ok(source) => source,
            Err(e) => {
                warn!(file = %file.display(), "couldn't read auxiliary config: {e}");
                continue;
            }
        };
        match serde_yaml::from_str::<HashMap<String, serde_yaml::Value>>(&source) {
            Ok(checks) => parsed.push((file, checks)),
            Err(e) => warn!(file = %file.display(), "couldn't parse auxiliary config: {e}"),
        }
    }
    parsed
}

/// Deserialize one raw check definition and normalize it. Failures here
/// (a type-invalid field as much as a missing command) cost only this
/// check.
fn build_check(key: &str, value: serde_yaml::Value, defaults: &Config) -> Result<Check> {
    let raw: RawCheck = serde_yaml::from_value(value).context("invalid check definition")?;
    normalize_check(key, raw, defaults)
}

/// Apply defaults and clamp the interval relations:
/// `MIN_INTERVAL ≤ every`, `0 < retry_every ≤ every`,
/// `0 < timeout < retry_every`, `retries >= 1`. Idempotent: normalizing
/// an already-normalized check changes nothing.
fn normalize_check(key: &str, raw: RawCheck, defaults: &Config) -> Result<Check> {
    let command = raw.command.ok_or_else(|| anyhow!("unspecified command"))?;
    let argv = shlex::split(&command)
        .ok_or_else(|| anyhow!("unparseable command {command:?}"))?;
    if argv.is_empty() {
        return Err(anyhow!("empty command"));
    }

    let mut check = Check::new(raw.name.unwrap_or_else(|| key.to_string()));
    check.command = command;
    check.argv = argv;

    check.every = raw.every.unwrap_or(0);
    if check.every <= 0 {
        check.every = defaults.every;
    } else if check.every <= MIN_INTERVAL {
        check.every = MIN_INTERVAL;
    }
    if check.every <= 0 {
        check.every = MIN_INTERVAL * 30;
    }

    check.retry_every = raw.retry_every.unwrap_or(0);
    if check.retry_every <= 0 {
        check.retry_every = defaults.retry_every;
    }
    if check.retry_every > check.every || check.retry_every <= 0 {
        check.retry_every = check.every;
    }

    check.retries = raw.retries.unwrap_or(0);
    if check.retries <= 0 {
        check.retries = defaults.retries;
    }
    if check.retries <= 0 {
        check.retries = 1;
    }

    check.timeout = raw.timeout.unwrap_or(0);
    if check.timeout <= 0 {
        check.timeout = defaults.timeout;
    }
    if check.timeout >= check.retry_every || check.timeout <= 0 {
        check.timeout = check.retry_every - 1;
    }
    if check.timeout <= 0 {
        check.timeout = MIN_INTERVAL - 1;
    }

    check.bulk = raw.bulk.unwrap_or(defaults.bulk);
    check.report = raw.report.unwrap_or(defaults.report);
    check.run_as = raw.run_as.filter(|user| !user.is_empty());

    check.env = raw.env.unwrap_or_default();
    for (key, value) in &defaults.env {
        check
            .env
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }

    Ok(check)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Config {
        Config {
            send_bolo: DEFAULT_SEND_BOLO.into(),
            every: 300,
            retry_every: 60,
            retries: 1,
            timeout: 45,
            bulk: false,
            report: false,
            env: HashMap::new(),
            host: "test01.example.com".into(),
            include_dir: DEFAULT_INCLUDE_DIR.into(),
            log: LogConfig::default(),
            checks: HashMap::new(),
        }
    }

    fn raw(command: &str) -> RawCheck {
        RawCheck {
            command: Some(command.into()),
            name: None,
            every: None,
            retry_every: None,
            retries: None,
            timeout: None,
            env: None,
            run_as: None,
            bulk: None,
            report: None,
        }
    }

    #[test]
    fn missing_command_is_rejected() {
        let mut r = raw("echo hi");
        r.command = None;
        assert!(normalize_check("broken", r, &defaults()).is_err());
    }

    #[test]
    fn type_invalid_check_fails_alone() {
        let value: serde_yaml::Value =
            serde_yaml::from_str("command: echo hi\nbulk: \"true\"\n").unwrap();
        assert!(
            build_check("loud", value, &defaults()).is_err(),
            "stringly-typed bulk is rejected for this check only"
        );

        let value: serde_yaml::Value = serde_yaml::from_str("command: echo hi\n").unwrap();
        assert!(build_check("quiet", value, &defaults()).is_ok());
    }

    #[test]
    fn defaults_fill_unset_fields() {
        let check = normalize_check("plain", raw("echo hi"), &defaults()).unwrap();
        assert_eq!(check.name, "plain");
        assert_eq!(check.argv, vec!["echo", "hi"]);
        assert_eq!(check.every, 300);
        assert_eq!(check.retry_every, 60);
        assert_eq!(check.retries, 1);
        assert_eq!(check.timeout, 45);
        assert!(!check.bulk && !check.report);
    }

    #[test]
    fn intervals_are_clamped_into_relation() {
        let mut r = raw("echo hi");
        r.every = Some(3);
        let check = normalize_check("fast", r, &defaults()).unwrap();
        assert_eq!(check.every, MIN_INTERVAL, "sub-minimum every clamps up");

        let mut r = raw("echo hi");
        r.every = Some(30);
        r.retry_every = Some(90);
        let check = normalize_check("eager", r, &defaults()).unwrap();
        assert_eq!(check.retry_every, 30, "retry_every clamps to every");
        assert_eq!(check.timeout, 29, "timeout stays under retry_every");

        let mut r = raw("echo hi");
        r.retry_every = Some(20);
        r.timeout = Some(100);
        let check = normalize_check("slow", r, &defaults()).unwrap();
        assert_eq!(check.timeout, 19);
    }

    #[test]
    fn retries_invariant_is_at_least_one() {
        let mut base = defaults();
        base.retries = 0;
        let mut r = raw("echo hi");
        r.retries = Some(-2);
        let check = normalize_check("stubborn", r, &base).unwrap();
        assert_eq!(check.retries, 1);
    }

    #[test]
    fn env_merges_with_check_winning() {
        let mut base = defaults();
        base.env.insert("SHARED".into(), "global".into());
        base.env.insert("GLOBAL_ONLY".into(), "yes".into());
        let mut r = raw("echo hi");
        r.env = Some(HashMap::from([("SHARED".into(), "mine".into())]));

        let check = normalize_check("envy", r, &base).unwrap();
        assert_eq!(check.env["SHARED"], "mine");
        assert_eq!(check.env["GLOBAL_ONLY"], "yes");
    }

    #[test]
    fn name_key_can_be_overridden() {
        let mut r = raw("echo hi");
        r.name = Some("renamed".into());
        let check = normalize_check("key", r, &defaults()).unwrap();
        assert_eq!(check.name, "renamed");
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut r = raw("echo hi");
        r.every = Some(3);
        r.retry_every = Some(90);
        r.timeout = Some(100);
        r.retries = Some(-1);

        let once = normalize_check("idem", r, &defaults()).unwrap();
        let again = RawCheck {
            command: Some(once.command.clone()),
            name: Some(once.name.clone()),
            every: Some(once.every),
            retry_every: Some(once.retry_every),
            retries: Some(once.retries),
            timeout: Some(once.timeout),
            env: Some(once.env.clone()),
            run_as: once.run_as.clone(),
            bulk: Some(once.bulk),
            report: Some(once.report),
        };
        let twice = normalize_check("idem", again, &defaults()).unwrap();

        assert_eq!(twice.every, once.every);
        assert_eq!(twice.retry_every, once.retry_every);
        assert_eq!(twice.retries, once.retries);
        assert_eq!(twice.timeout, once.timeout);
        assert_eq!(twice.env, once.env);
    }
}
