//! Agent configuration: defaults, then `MEMWATCH_*` environment variables,
//! then command-line flags.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::aggregator::AggregatorConfig;
use crate::error::AgentError;
use crate::hotspots::ProfilerConfig;
use crate::process::ProcessSelector;

pub const USAGE: &str = "Usage: memwatch_agent [--port PORT|-p PORT] [--bind ADDR] \
[--interval-ms MS] [--history N] [--top N] [--hotspots N] [--source-timeout-ms MS] \
[--fleet-url URL] [--fleet-timeout-ms MS] [--process-pattern REGEX] [--no-profiler] \
[--profiler-sample-rate N] [--profiler-min-bytes N]";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub interval: Duration,
    pub history_capacity: usize,
    pub top_k: usize,
    pub hotspot_count: usize,
    pub source_timeout: Duration,
    pub fleet_url: Option<String>,
    pub fleet_timeout: Duration,
    pub process_pattern: Option<String>,
    pub profiler: ProfilerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let agg = AggregatorConfig::default();
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            interval: agg.interval,
            history_capacity: agg.history_capacity,
            top_k: agg.top_k,
            hotspot_count: agg.hotspot_count,
            source_timeout: agg.source_timeout,
            fleet_url: None,
            fleet_timeout: agg.fleet_timeout,
            process_pattern: Some("python".into()),
            profiler: ProfilerConfig::default(),
        }
    }
}

#[derive(Debug)]
pub enum ParseOutcome {
    Run(AgentConfig),
    Help,
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, AgentError> {
    raw.trim()
        .parse()
        .map_err(|_| AgentError::Config(format!("invalid value for {key}: {raw:?}")))
}

fn millis(key: &str, raw: &str) -> Result<Duration, AgentError> {
    parse::<u64>(key, raw).map(Duration::from_millis)
}

fn truthy(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

impl AgentConfig {
    /// `env` is a lookup (normally `std::env::var(..).ok()`), `args` includes
    /// the program name.
    pub fn load<E, I>(env: E, args: I) -> Result<ParseOutcome, AgentError>
    where
        E: Fn(&str) -> Option<String>,
        I: IntoIterator<Item = String>,
    {
        let mut cfg = AgentConfig::default();
        cfg.apply_env(&env)?;
        if cfg.apply_args(args)? {
            return Ok(ParseOutcome::Help);
        }
        cfg.validate()?;
        Ok(ParseOutcome::Run(cfg))
    }

    fn apply_env<E: Fn(&str) -> Option<String>>(&mut self, env: &E) -> Result<(), AgentError> {
        for (key, flag) in [
            ("MEMWATCH_PORT", "--port"),
            ("MEMWATCH_BIND", "--bind"),
            ("MEMWATCH_INTERVAL_MS", "--interval-ms"),
            ("MEMWATCH_HISTORY", "--history"),
            ("MEMWATCH_TOP", "--top"),
            ("MEMWATCH_HOTSPOTS", "--hotspots"),
            ("MEMWATCH_SOURCE_TIMEOUT_MS", "--source-timeout-ms"),
            ("MEMWATCH_FLEET_URL", "--fleet-url"),
            ("MEMWATCH_FLEET_TIMEOUT_MS", "--fleet-timeout-ms"),
            ("MEMWATCH_PROCESS_PATTERN", "--process-pattern"),
            ("MEMWATCH_PROFILER_SAMPLE_RATE", "--profiler-sample-rate"),
            ("MEMWATCH_PROFILER_MIN_BYTES", "--profiler-min-bytes"),
        ] {
            if let Some(v) = env(key) {
                self.set(flag, &v).map_err(|e| match e {
                    AgentError::Config(msg) => AgentError::Config(format!("{key}: {msg}")),
                    other => other,
                })?;
            }
        }
        if let Some(v) = env("MEMWATCH_PROFILER") {
            self.profiler.enabled = truthy(&v);
        }
        Ok(())
    }

    /// Returns `true` when help was requested.
    fn apply_args<I: IntoIterator<Item = String>>(&mut self, args: I) -> Result<bool, AgentError> {
        let mut it = args.into_iter();
        let _ = it.next(); // program name
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "-h" | "--help" => return Ok(true),
                "--no-profiler" => self.profiler.enabled = false,
                "-p" => {
                    let v = it
                        .next()
                        .ok_or_else(|| AgentError::Config("-p needs a value".into()))?;
                    self.set("--port", &v)?;
                }
                _ if arg.starts_with("--") => {
                    let (flag, value) = match arg.split_once('=') {
                        Some((f, v)) => (f.to_string(), v.to_string()),
                        None => {
                            let v = it
                                .next()
                                .ok_or_else(|| AgentError::Config(format!("{arg} needs a value")))?;
                            (arg.clone(), v)
                        }
                    };
                    self.set(&flag, &value)?;
                }
                _ => {
                    return Err(AgentError::Config(format!(
                        "unexpected argument {arg:?}. {USAGE}"
                    )))
                }
            }
        }
        Ok(false)
    }

    fn set(&mut self, flag: &str, v: &str) -> Result<(), AgentError> {
        match flag {
            "--port" => self.port = parse(flag, v)?,
            "--bind" => self.bind = parse(flag, v)?,
            "--interval-ms" => self.interval = millis(flag, v)?,
            "--history" => self.history_capacity = parse(flag, v)?,
            "--top" => self.top_k = parse(flag, v)?,
            "--hotspots" => self.hotspot_count = parse(flag, v)?,
            "--source-timeout-ms" => self.source_timeout = millis(flag, v)?,
            "--fleet-url" => {
                let v = v.trim();
                self.fleet_url = (!v.is_empty()).then(|| v.to_string());
            }
            "--fleet-timeout-ms" => self.fleet_timeout = millis(flag, v)?,
            "--process-pattern" => {
                self.process_pattern = (!v.is_empty()).then(|| v.to_string());
            }
            "--profiler-sample-rate" => self.profiler.sample_rate = parse(flag, v)?,
            "--profiler-min-bytes" => self.profiler.min_alloc_bytes = parse(flag, v)?,
            other => {
                return Err(AgentError::Config(format!(
                    "unknown flag {other:?}. {USAGE}"
                )))
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), AgentError> {
        let positive = [
            ("interval", self.interval.is_zero()),
            ("source timeout", self.source_timeout.is_zero()),
            ("fleet timeout", self.fleet_timeout.is_zero()),
            ("history capacity", self.history_capacity == 0),
            ("top", self.top_k == 0),
            ("profiler sample rate", self.profiler.sample_rate == 0),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, bad)| *bad) {
            return Err(AgentError::Config(format!("{name} must be greater than zero")));
        }
        if let Some(p) = &self.process_pattern {
            ProcessSelector::name_matches(p)?;
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn aggregator_config(&self) -> Result<AggregatorConfig, AgentError> {
        Ok(AggregatorConfig {
            interval: self.interval,
            history_capacity: self.history_capacity,
            top_k: self.top_k,
            hotspot_count: self.hotspot_count,
            source_timeout: self.source_timeout,
            fleet_timeout: self.fleet_timeout,
            process_group: self
                .process_pattern
                .as_deref()
                .map(ProcessSelector::name_matches)
                .transpose()?,
        })
    }
}
