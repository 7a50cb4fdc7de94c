//! Layered configuration: defaults, environment, then flags.

use std::collections::HashMap;
use std::time::Duration;

use memwatch_agent::config::{AgentConfig, ParseOutcome};
use memwatch_agent::error::AgentError;

fn load(env: &[(&str, &str)], args: &[&str]) -> Result<ParseOutcome, AgentError> {
    let env: HashMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let argv = std::iter::once("memwatch_agent")
        .chain(args.iter().copied())
        .map(String::from);
    AgentConfig::load(|k| env.get(k).cloned(), argv)
}

fn run(env: &[(&str, &str)], args: &[&str]) -> AgentConfig {
    match load(env, args) {
        Ok(ParseOutcome::Run(cfg)) => cfg,
        other => panic!("expected a runnable config, got {other:?}"),
    }
}

#[test]
fn defaults_without_env_or_flags() {
    let cfg = run(&[], &[]);
    assert_eq!(cfg.port, 3000);
    assert_eq!(cfg.interval, Duration::from_secs(3));
    assert_eq!(cfg.history_capacity, 50);
    assert_eq!(cfg.top_k, 10);
    assert_eq!(cfg.fleet_url, None);
    assert_eq!(cfg.process_pattern.as_deref(), Some("python"));
    assert_eq!(cfg.addr().to_string(), "0.0.0.0:3000");
}

#[test]
fn port_short_long_and_inline_forms() {
    assert_eq!(run(&[], &["-p", "8081"]).port, 8081);
    assert_eq!(run(&[], &["--port", "8082"]).port, 8082);
    assert_eq!(run(&[], &["--port=8083"]).port, 8083);
}

#[test]
fn flags_override_environment() {
    let env = [("MEMWATCH_PORT", "9000"), ("MEMWATCH_HISTORY", "7")];
    let cfg = run(&env, &[]);
    assert_eq!(cfg.port, 9000);
    assert_eq!(cfg.history_capacity, 7);

    let cfg = run(&env, &["--port", "9001"]);
    assert_eq!(cfg.port, 9001);
    assert_eq!(cfg.history_capacity, 7);
}

#[test]
fn timing_and_fleet_settings() {
    let cfg = run(
        &[
            ("MEMWATCH_INTERVAL_MS", "500"),
            ("MEMWATCH_FLEET_URL", "http://flower:5555"),
        ],
        &["--fleet-timeout-ms", "250", "--source-timeout-ms=900"],
    );
    assert_eq!(cfg.interval, Duration::from_millis(500));
    assert_eq!(cfg.fleet_timeout, Duration::from_millis(250));
    assert_eq!(cfg.source_timeout, Duration::from_millis(900));
    assert_eq!(cfg.fleet_url.as_deref(), Some("http://flower:5555"));

    let agg = cfg.aggregator_config().unwrap();
    assert_eq!(agg.interval, Duration::from_millis(500));
    assert!(agg.process_group.is_some());
}

#[test]
fn empty_pattern_disables_process_group() {
    let cfg = run(&[("MEMWATCH_PROCESS_PATTERN", "")], &[]);
    assert_eq!(cfg.process_pattern, None);
    assert!(cfg.aggregator_config().unwrap().process_group.is_none());
}

#[test]
fn profiler_switches() {
    assert!(run(&[], &[]).profiler.enabled);
    assert!(!run(&[("MEMWATCH_PROFILER", "off")], &[]).profiler.enabled);
    assert!(!run(&[], &["--no-profiler"]).profiler.enabled);
    assert_eq!(
        run(&[], &["--profiler-sample-rate", "8"]).profiler.sample_rate,
        8
    );
}

#[test]
fn help_short_circuits() {
    assert!(matches!(load(&[], &["--help"]), Ok(ParseOutcome::Help)));
    // help wins even when later flags would fail
    assert!(matches!(load(&[], &["-h", "--port", "nope"]), Ok(ParseOutcome::Help)));
}

#[test]
fn rejects_bad_values() {
    for (env, args) in [
        (vec![], vec!["--port", "not-a-port"]),
        (vec![], vec!["--port"]),
        (vec![], vec!["--interval-ms", "0"]),
        (vec![], vec!["--history", "0"]),
        (vec![], vec!["--bogus", "1"]),
        (vec![], vec!["stray"]),
        (vec![], vec!["--process-pattern", "(unclosed"]),
        (vec![("MEMWATCH_PORT", "70000")], vec![]),
    ] {
        let err = load(&env, &args).expect_err("should be rejected");
        assert!(matches!(err, AgentError::Config(_)), "{err}");
    }
}

#[test]
fn env_errors_name_the_variable() {
    let err = load(&[("MEMWATCH_TOP", "many")], &[]).unwrap_err();
    assert!(err.to_string().contains("MEMWATCH_TOP"), "{err}");
}
