//! Configuration loading and validation tests
//!
//! Tests focus on behavior of configuration loading, validation and credential resolution.

use hubclient::config::{ConfigError, HubConfig, DEFAULT_API_VERSION};
use hubclient::protocol::addresses::DEFAULT_CONSUMER_GROUP;
use hubclient::HubError;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[device]
connection_string = "HostName=hub.example.net;DeviceId=dev-1;SharedAccessKey=c2VjcmV0"

[mqtt]
port = 8884
keep_alive_secs = 30

[eventhub]
hostname = "ns.example.net"
name = "telemetry"

[tokens]
renewal_interval_secs = 900
"#,
    );

    let config = HubConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.port, 8884);
    assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(30));
    assert_eq!(config.mqtt.api_version, DEFAULT_API_VERSION);
    assert_eq!(config.tokens.renewal_interval(), Duration::from_secs(900));

    let eventhub = config.eventhub.unwrap();
    assert_eq!(eventhub.name, "telemetry");
    assert_eq!(eventhub.consumer_group, DEFAULT_CONSUMER_GROUP);

    let credentials = config.device.resolve_credentials().unwrap();
    assert_eq!(credentials.device_id(), "dev-1");
    assert_eq!(credentials.hostname(), "hub.example.net");
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = HubConfig::from_toml("").unwrap();

    assert_eq!(config, HubConfig::default());
    assert_eq!(config.mqtt.port, 8883);
    assert_eq!(config.tokens.renewal_interval(), Duration::from_secs(3600));
    assert!(config.eventhub.is_none());
}

#[test]
fn test_config_missing_file_returns_error() {
    let result = HubConfig::load_from_file(std::path::Path::new("/nonexistent/hubclient.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_malformed_toml_returns_error() {
    let temp_file = write_config("[mqtt\nport = ");
    let result = HubConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_invalid_values() {
    for content in [
        "[mqtt]\nport = 0",
        "[mqtt]\nkeep_alive_secs = 1",
        "[tokens]\nrenewal_interval_secs = 0",
        "[eventhub]\nhostname = \"ns\"\nname = \"\"",
    ] {
        let result = HubConfig::from_toml(content);
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(_))),
            "accepted {content:?}"
        );
    }
}

#[test]
fn test_missing_environment_connection_string() {
    let config = HubConfig::from_toml(
        r#"
[device]
connection_string_env = "HUBCLIENT_TEST_UNSET_CONNECTION_STRING"
"#,
    )
    .unwrap();

    let result = config.device.resolve_credentials();
    assert!(matches!(result, Err(HubError::Config(_))));
}

#[test]
fn test_debug_output_hides_connection_string() {
    let config = HubConfig::from_toml(
        r#"
[device]
connection_string = "HostName=h;DeviceId=d;SharedAccessKey=c2VjcmV0"
"#,
    )
    .unwrap();

    let debug = format!("{config:?}");
    assert!(!debug.contains("c2VjcmV0"));
}
