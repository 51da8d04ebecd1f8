//! Configuration loading from TOML files and environment overrides.

use packet_cache::codec::MessageFormat;
use packet_cache::config::CacheConfig;
use packet_cache::{ChannelId, ServiceOptions};
use serial_test::serial;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const OVERRIDE_VAR: &str = "PACKET_CACHE_CACHE__MAX_PACKETS_PER_CHANNEL";

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
#[serial]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, CacheConfig::default());
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_file_values_are_loaded() {
    let file = write_config(
        r#"
        [cache]
        max_packets_per_channel = 12
        max_total_packets = 500
        blacklist = ["LH*"]

        [interpolation]
        gap_tolerance = "250ms"
        default_sampling_rate = 40.0

        [interpolation.channel_sampling_rates]
        "UU.FORK.HHZ.01" = 100.0

        [requestor]
        timeout = "2s"
        format = "json"

        [logging]
        level = "debug"
        format = "compact"
        "#,
    );
    let config = CacheConfig::load_from(file.path()).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.cache.max_packets_per_channel, 12);
    assert_eq!(config.cache.max_total_packets, 500);
    assert_eq!(config.cache.query_workers, 4);
    assert_eq!(config.interpolation.gap_tolerance, Duration::from_millis(250));
    assert_eq!(config.requestor.timeout, Duration::from_secs(2));
    assert_eq!(config.requestor.format, MessageFormat::Json);

    let vertical = ChannelId::new("UU", "FORK", "HHZ", "01").unwrap();
    let north = vertical.with_channel("HHN").unwrap();
    assert_eq!(config.sampling_rate_for(&vertical), Some(100.0));
    assert_eq!(config.sampling_rate_for(&north), Some(40.0));

    let settings = config.collection_settings().unwrap();
    assert!(settings.blacklist.matches("LHZ"));
    assert!(!settings.blacklist.matches("HHZ"));

    let options = ServiceOptions::from_config(&config).unwrap();
    assert_eq!(options.sampling_rate_for(&vertical), Some(100.0));
    assert_eq!(options.gap_tolerance, Duration::from_millis(250));
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config("[cache]\nmax_packets_per_channel = 12\n");
    std::env::set_var(OVERRIDE_VAR, "77");
    let loaded = CacheConfig::load_from(file.path());
    std::env::remove_var(OVERRIDE_VAR);

    assert_eq!(loaded.unwrap().cache.max_packets_per_channel, 77);
}

#[test]
#[serial]
fn test_invalid_values_fail_validation() {
    let file = write_config(
        r#"
        [cache]
        query_workers = 0

        [interpolation.channel_sampling_rates]
        "not-a-channel" = 100.0
        "#,
    );
    let config = CacheConfig::load_from(file.path()).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.contains("query_workers"));
    assert!(ServiceOptions::from_config(&config).is_err());
}

#[test]
#[serial]
fn test_malformed_toml_is_a_config_error() {
    let file = write_config("[cache\nmax_packets_per_channel = ");
    assert!(CacheConfig::load_from(file.path()).is_err());
}
