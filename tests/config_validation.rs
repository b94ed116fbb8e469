//! Configuration parsing and validation coverage.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use scard_proxy::{ProxyConfig, ProxyError};

#[test]
fn full_config_parses() {
    let config = ProxyConfig::from_toml(
        r#"
        listen = "127.0.0.1:24000"
        allowed_ips = ["192.168.1.0/24", "10.0.0.1", "2001:db8::/32"]
        "#,
    )
    .unwrap();

    assert_eq!(config.listen, "127.0.0.1:24000");
    assert_eq!(config.allowed_ips.len(), 3);
    assert!(config.validate().is_empty());
}

#[test]
fn missing_fields_fall_back_to_defaults() {
    let config = ProxyConfig::from_toml("").unwrap();
    assert_eq!(config.listen, "0.0.0.0:24000");
    assert!(config.allowed_ips.is_empty());
}

#[test]
fn malformed_toml_is_a_config_error() {
    let err = ProxyConfig::from_toml("listen = [").unwrap_err();
    assert!(matches!(err, ProxyError::Config(_)));
}

#[test]
fn invalid_listen_address_is_reported() {
    let config = ProxyConfig {
        listen: "not-an-address".to_string(),
        allowed_ips: vec!["127.0.0.1".to_string()],
    };
    let errors = config.validate();
    assert!(
        errors.iter().any(|e| e.contains("listen address")),
        "got: {errors:?}"
    );
}

#[test]
fn invalid_cidr_is_reported() {
    let config = ProxyConfig {
        listen: "0.0.0.0:24000".to_string(),
        allowed_ips: vec!["192.168.1.0/40".to_string()],
    };
    let errors = config.validate();
    assert!(
        errors.iter().any(|e| e.contains("invalid CIDR")),
        "got: {errors:?}"
    );
    assert!(config.allow_list().is_err());
}

#[test]
fn empty_allow_list_is_flagged() {
    let config = ProxyConfig::default();
    let errors = config.validate();
    assert!(
        errors.iter().any(|e| e.contains("allowed_ips is empty")),
        "got: {errors:?}"
    );
}

#[test]
fn validate_strict_collects_every_problem() {
    let config = ProxyConfig {
        listen: String::new(),
        allowed_ips: vec!["bogus".to_string()],
    };
    let err = config.validate_strict().unwrap_err();
    let message = err.to_string();
    assert!(message.contains("cannot be empty"));
    assert!(message.contains("invalid CIDR 'bogus'"));
}

#[test]
fn config_round_trips_through_a_file() {
    let path = std::env::temp_dir().join(format!(
        "scard-proxy-config-test-{}.toml",
        std::process::id()
    ));
    std::fs::write(
        &path,
        "listen = \"127.0.0.1:9999\"\nallowed_ips = [\"127.0.0.1\"]\n",
    )
    .unwrap();

    let config = ProxyConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(config.listen, "127.0.0.1:9999");
    assert!(config.validate().is_empty());
}

#[test]
fn missing_file_is_a_config_error() {
    let err = ProxyConfig::from_file("/no/such/path/scard-proxy.toml").unwrap_err();
    match err {
        ProxyError::Config(message) => assert!(message.contains("failed to read")),
        other => panic!("unexpected error: {other:?}"),
    }
}
