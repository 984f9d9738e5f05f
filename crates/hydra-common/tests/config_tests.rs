//! ---
//! hydra_section: "01-core-functionality"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Shared primitives and utilities for the Hydra runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
use std::env;
use std::fs;
use std::time::Duration;

use hydra_common::config::HydraConfig;
use hydra_common::LogFormat;

const TOML_CONFIG: &str = r#"
serviceName = "hydra-router"
serviceIP = "127.0.0.1"
servicePort = 5353
serviceType = "router"

[redis]
host = "cache.internal"
port = 6380
db = 3
prefix = "hydra:service"

[presence]
tickInterval = 2
healthEveryTicks = 3
keyTtl = 6

[queue]
backoffMs = [5, 500, 1500]

[logging]
format = "structured-json"
"#;

#[test]
fn loads_toml_by_extension() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("hydra.toml");
    fs::write(&path, TOML_CONFIG).expect("write config");

    let config = HydraConfig::load(&path).expect("load toml");
    assert_eq!(config.service_name, "hydra-router");
    assert_eq!(config.service_port, Some(5353));
    assert_eq!(config.redis.url(), "redis://cache.internal:6380/3");
    assert_eq!(config.presence.tick_interval, Duration::from_secs(2));
    assert_eq!(config.presence.health_every_ticks, 3);
    assert_eq!(
        config.queue.backoff_ms,
        vec![
            Duration::from_millis(5),
            Duration::from_millis(500),
            Duration::from_millis(1500)
        ]
    );
    assert_eq!(config.logging.format, LogFormat::StructuredJson);
}

#[test]
fn load_rejects_invalid_service_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("hydra.json");
    fs::write(&path, r#"{"hydra":{"serviceName":"bad:name"}}"#).expect("write config");

    let err = HydraConfig::load(&path).expect_err("invalid name");
    assert!(err.to_string().contains("must not contain"));
}

#[test]
fn env_override_takes_precedence_over_candidates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let candidate = dir.path().join("candidate.json");
    let overridden = dir.path().join("override.json");
    fs::write(&candidate, r#"{"hydra":{"serviceName":"from-candidate"}}"#).expect("write");
    fs::write(&overridden, r#"{"serviceName":"from-env"}"#).expect("write");

    env::remove_var(HydraConfig::ENV_CONFIG_PATH);
    let loaded = HydraConfig::load_with_source(&[&candidate]).expect("candidate loads");
    assert_eq!(loaded.config.service_name, "from-candidate");
    assert_eq!(loaded.source, candidate);

    env::set_var(HydraConfig::ENV_CONFIG_PATH, &overridden);
    let loaded = HydraConfig::load_with_source(&[&candidate]).expect("override loads");
    env::remove_var(HydraConfig::ENV_CONFIG_PATH);
    assert_eq!(loaded.config.service_name, "from-env");

    let missing = dir.path().join("missing.json");
    let err = HydraConfig::load_with_source(&[&missing]).expect_err("nothing to load");
    assert!(err.to_string().contains("no configuration files found"));
}
