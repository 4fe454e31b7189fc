//! Integration tests for multipool-config

use multipool_config::*;
use std::io::Write;
use std::time::Duration;
use temp_env::with_vars;

#[test]
fn test_default_config_validation() {
    let config = MultipoolConfig::default();
    assert!(config.validate_all().is_ok());
}

#[test]
fn test_config_loader_from_env() {
    let vars = vec![
        ("MULTIPOOL_PROCESSES", Some("4")),
        ("MULTIPOOL_THREADS", Some("2")),
        ("MULTIPOOL_QUEUE_COUNT", Some("2")),
        ("MULTIPOOL_MAX_TASKS_PER_CHILD", Some("10")),
        ("MULTIPOOL_POLL_INTERVAL_MS", Some("20")),
        ("MULTIPOOL_LOG_LEVEL", Some("debug")),
    ];

    with_vars(vars, || {
        let loader = ConfigLoader::new();
        let config = loader.from_env().unwrap();

        assert_eq!(config.pool.process_count(), 4);
        assert_eq!(config.pool.thread_width(), 2);
        assert_eq!(config.pool.queue_count, 2);
        assert_eq!(config.pool.effective_ttl(), 20);
        assert_eq!(config.pool.poll_interval, Duration::from_millis(20));
        assert_eq!(config.logging.level, LogLevel::Debug);
    });
}

#[test]
fn test_env_queue_count_above_processes_fails() {
    let vars = vec![
        ("MULTIPOOL_PROCESSES", Some("2")),
        ("MULTIPOOL_QUEUE_COUNT", Some("3")),
    ];

    with_vars(vars, || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert!(matches!(err, ConfigError::DomainError { ref domain, .. } if domain == "pool"));
    });
}

#[test]
fn test_invalid_env_value() {
    with_vars(vec![("MULTIPOOL_THREADS", Some("many"))], || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert!(matches!(err, ConfigError::EnvError(_)));
    });
}

#[test]
fn test_custom_prefix() {
    with_vars(vec![("POOLTEST_PROCESSES", Some("3"))], || {
        let config = ConfigLoader::with_prefix("POOLTEST").from_env().unwrap();
        assert_eq!(config.pool.processes, Some(3));
    });
}

#[test]
fn test_yaml_config_serialization() {
    let yaml = MultipoolConfig::generate_sample();
    let parsed: MultipoolConfig = serde_yaml::from_str(&yaml).unwrap();
    assert!(parsed.validate_all().is_ok());
}

#[test]
fn test_config_from_file() {
    let yaml = r#"
pool:
  processes: 2
  threads: 4
  queue_count: 2
  max_tasks_per_child: 5
  child_concurrency: 2
  poll_interval: 10
  shutdown_timeout: 3
  restart_on_crash: false

logging:
  level: warn
  format: json
"#;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    let config = ConfigLoader::new().from_file(file.path()).unwrap();
    assert_eq!(config.pool.process_count(), 2);
    assert_eq!(config.pool.effective_ttl(), 20);
    assert_eq!(config.pool.effective_concurrency(), 8);
    assert_eq!(config.pool.poll_interval, Duration::from_millis(10));
    assert_eq!(config.pool.shutdown_timeout, Duration::from_secs(3));
    assert!(!config.pool.restart_on_crash);
    assert_eq!(config.logging.level, LogLevel::Warn);
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
fn test_missing_file() {
    let result = ConfigLoader::new().load(Some("/definitely/not/here.yaml"));
    assert!(matches!(result, Err(ConfigError::FileReadError(_))));
}
