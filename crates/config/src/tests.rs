use crate::{AppConfig, ConfigError, FailureMode, PolicyConfig, RedisConfig};
use figment::Jail;
use secrecy::{ExposeSecret, Secret};

#[test]
fn test_secret_redaction() {
    let config = RedisConfig {
        url: Secret::new("redis://:hunter2@localhost:6379".to_string()),
        command_timeout_ms: 250,
    };
    let debug_output = format!("{:?}", config);
    assert!(!debug_output.contains("hunter2"));
    assert!(debug_output.contains("Secret([REDACTED"));
}

#[test]
fn test_defaults_are_valid() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());
    assert!(config.redis.is_none());
    assert_eq!(config.gateway.api_prefix, "/api/v1");
    assert_eq!(config.throttle.failure_mode, FailureMode::Open);
    assert_eq!(
        config.throttle.policies["auth"],
        PolicyConfig {
            window_ms: 900_000,
            limit: 5
        }
    );
}

#[test]
fn test_load_from_file_and_env() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "default.toml",
            r#"
            app_name = "glimmr-test"

            [gateway]
            api_version = "v2"
            api_prefix = "/api/v2"

            [redis]
            url = "redis://localhost:6379"

            [throttle]
            failure_mode = "closed"

            [throttle.policies.default]
            window_ms = 1000
            limit = 3
            "#,
        )?;
        jail.set_env("GLIMMR_SERVER__PORT", "9090");

        let config = AppConfig::load(".").map_err(|e| e.to_string())?;

        assert_eq!(config.app_name, "glimmr-test");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.gateway.api_version, "v2");
        assert_eq!(config.throttle.failure_mode, FailureMode::Closed);
        assert_eq!(config.throttle.policies["default"].limit, 3);

        let redis = config.redis.expect("redis section");
        assert_eq!(redis.url.expose_secret(), "redis://localhost:6379");
        assert_eq!(redis.command_timeout_ms, 250);
        Ok(())
    });
}

#[test]
fn test_missing_default_policy_rejected() {
    Jail::expect_with(|jail| {
        jail.create_file(
            "default.toml",
            r#"
            [throttle]
            default_policy = "missing"
            "#,
        )?;

        let result = AppConfig::load(".");
        assert!(result.is_err());
        Ok(())
    });
}

#[test]
fn test_zero_limit_rejected() {
    let mut config = AppConfig::default();
    config.throttle.policies.insert(
        "broken".to_string(),
        PolicyConfig {
            window_ms: 1000,
            limit: 0,
        },
    );
    assert!(config.validate().is_err());
}

#[test]
fn test_relative_prefix_rejected() {
    let mut config = AppConfig::default();
    config.gateway.api_prefix = "api".to_string();
    assert!(config.validate().is_err());

    config.gateway.api_prefix = String::new();
    assert!(config.validate().is_ok());
}

#[test]
fn test_api_version_must_be_header_safe() {
    let mut config = AppConfig::default();
    config.gateway.api_version = "v1\n".to_string();
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

    config.gateway.api_version = String::new();
    assert!(config.validate().is_err());

    config.gateway.api_version = "2024-06-01".to_string();
    assert!(config.validate().is_ok());
}
