//! Link configuration loading

mod common;

use common::*;

#[test]
fn test_load_from_file() {
    let path = std::env::temp_dir().join(format!("isplink-config-{}.json", std::process::id()));
    std::fs::write(
        &path,
        r#"{
            "transport": { "write_chunk": 32 },
            "timeouts": { "short": 500, "update_complete": 60000 },
            "retry": { "max_attempts": 200 },
            "strict_checksum": true
        }"#,
    )
    .unwrap();

    let config = LinkConfig::from_json_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.transport.write_chunk, 32);
    assert_eq!(config.transport.read_chunk, 512);
    assert_eq!(config.timeouts.short, Duration::from_millis(500));
    assert_eq!(config.timeouts.update_complete, Duration::from_secs(60));
    assert_eq!(config.timeouts.medium, Duration::from_secs(2));
    assert_eq!(config.retry.max_attempts, 200);
    assert_eq!(config.retry.short_attempts, 10);
    assert!(config.strict_checksum);
    assert_eq!(config.firmware_chunk, DEFAULT_FIRMWARE_CHUNK);
}

#[test]
fn test_missing_file_is_io_error() {
    let err = LinkConfig::from_json_file("/nonexistent/isplink.json").unwrap_err();
    assert!(matches!(err, IspError::Io(_)));
}

#[test]
fn test_malformed_json_is_config_error() {
    let err = LinkConfig::from_json_str("{ not json").unwrap_err();
    assert!(matches!(err, IspError::Config(_)));
    assert_eq!(err.code(), -22);
}

#[test]
fn test_device_rejects_invalid_config() {
    let sim = SimulatedIsp::default();
    let config = LinkConfig::default().with_firmware_chunk(0);
    assert!(matches!(
        Isp::new(sim.bus(), sim.pins(), config),
        Err(IspError::Config(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_custom_write_chunk_applies() {
    let config = LinkConfig::from_json_str(r#"{ "transport": { "write_chunk": 4 } }"#).unwrap();
    let (isp, sim) = connected_with(config, SimBehavior::default());

    isp.set_u8(0x1003, 0x05).await.unwrap();
    assert_eq!(sim.out_transfers(), vec![4, 4, 2]);
}
