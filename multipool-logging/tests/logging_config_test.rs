use multipool_logging::{init_logging_from_config, LogFormat, LogLevel, LoggingConfig};

#[test]
fn test_logging_config_integration() {
    let yaml_config = r#"
level: debug
format: json
include_location: true
"#;

    let config: LoggingConfig = serde_yaml::from_str(yaml_config).unwrap();

    assert_eq!(config.level, LogLevel::Debug);
    assert_eq!(config.format, LogFormat::Json);
    assert!(config.include_location);
    assert!(config.propagate_to_workers);

    init_logging_from_config(&config).unwrap();
    tracing::info!(worker_id = 1, "logging initialised");
}

#[test]
fn test_minimal_logging_config() {
    let config: LoggingConfig = serde_yaml::from_str("{}").unwrap();

    assert_eq!(config.level, LogLevel::Info);
    assert_eq!(config.format, LogFormat::Text);
    assert!(!config.include_location);
}

#[test]
fn test_unknown_format_is_rejected() {
    let result = serde_yaml::from_str::<LoggingConfig>("format: xml");
    assert!(result.is_err());
}
