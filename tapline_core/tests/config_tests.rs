use std::io::Write;
use std::time::Duration;
use tapline_core::config::{Config, ConfigError};
use tapline_core::crypto::TunnelKey;
use tapline_core::logging::options_from_config;
use tempfile::NamedTempFile;
use tracing::Level;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_full_config_to_session() {
    let key = TunnelKey::generate();
    let file = write_config(&format!(
        r#"
        [adapter]
        instance_id = "{{A0B1C2D3-E4F5-4A6B-8C7D-8E9F0A1B2C3D}}"
        description_markers = ["My VPN Adapter"]
        read_poll_ms = 100

        [remote]
        address = "[::1]:6000"
        local_bind = "[::1]:0"

        [security]
        key = "{}"

        [tunnel]
        frame_capacity = 1600
        shutdown_timeout_ms = 2000

        [logging]
        level = "trace"
        log_to_file = true
        log_dir = "/var/log/tapline"
        json_format = true
    "#,
        key.to_base64()
    ));

    let config = Config::load(file.path()).unwrap();
    let session = config.session().unwrap();
    assert_eq!(
        session.adapter_id.to_string(),
        "{A0B1C2D3-E4F5-4A6B-8C7D-8E9F0A1B2C3D}"
    );
    assert_eq!(session.remote, "[::1]:6000".parse().unwrap());
    assert_eq!(session.key, key);

    let options = config.engine_options().unwrap();
    assert_eq!(options.frame_capacity, 1600);
    assert_eq!(options.shutdown_timeout, Duration::from_secs(2));
    assert_eq!(options.retry_delay, Duration::from_secs(1));
    assert_eq!(options.local_bind, Some("[::1]:0".parse().unwrap()));
    assert_eq!(config.adapter.read_poll(), Duration::from_millis(100));

    let log = options_from_config(&config);
    assert_eq!(log.level, Level::TRACE);
    assert!(log.log_to_file);
    assert!(log.json_format);
    assert_eq!(log.log_dir, "/var/log/tapline");
}

#[test]
fn test_incomplete_config_is_rejected_but_readable() {
    let file = write_config(
        r#"
        [adapter]
        component_ids = ["tap0901"]
    "#,
    );

    assert!(matches!(
        Config::load(file.path()),
        Err(ConfigError::MissingValue(_))
    ));

    let partial = Config::load_partial(file.path()).unwrap();
    assert_eq!(partial.adapter.component_ids, vec!["tap0901"]);
    assert!(partial.session().is_err());
}

#[test]
fn test_malformed_toml() {
    let file = write_config("[adapter\ninstance_id = ");
    assert!(matches!(
        Config::load(file.path()),
        Err(ConfigError::TomlError(_))
    ));
}

#[test]
fn test_save_creates_missing_directories() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::new();
    config.adapter.instance_id = Some("a0b1c2d3-e4f5-4a6b-8c7d-8e9f0a1b2c3d".to_string());
    config.remote.address = Some("198.51.100.4:443".to_string());
    config.security.key = Some(TunnelKey::generate().to_base64());

    let path = dir.path().join("nested").join("tapline.toml");
    config.save(&path).unwrap();

    let reloaded = Config::load_partial(&path).unwrap();
    assert_eq!(reloaded.adapter, config.adapter);
    assert_eq!(reloaded.security, config.security);
}

#[test]
fn test_default_path_is_tapline_specific() {
    let path = Config::default_path();
    assert!(path.ends_with("config.toml"));
    assert!(path.to_string_lossy().contains("tapline") || path == std::path::Path::new("config.toml"));
}
