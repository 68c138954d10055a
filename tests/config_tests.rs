use loop_counters::config::{CliArgs, Config};
use loop_counters::{CounterError, WriteStrategy};
use rstest::rstest;
use std::io::Write;
use tempfile::NamedTempFile;

#[rstest]
#[case(0)]
#[case(1001)]
#[case(u32::MAX)]
fn test_shard_count_out_of_range(#[case] shards: u32) {
    let mut config = Config::default();
    config.counters.default_shards = shards;

    match config.validate() {
        Err(CounterError::ValidationError(issues)) => {
            assert!(issues.iter().any(|i| i.field == "counters.default_shards"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[rstest]
#[case(1)]
#[case(10)]
#[case(1000)]
fn test_shard_count_in_range(#[case] shards: u32) {
    let mut config = Config::default();
    config.counters.default_shards = shards;
    assert!(config.validate().is_ok(), "{} shards should be valid", shards);
}

#[test]
fn test_validation_reports_every_issue() {
    let mut config = Config::default();
    config.counters.default_shards = 0;
    config.counters.collection = "a/b".to_string();

    match config.validate() {
        Err(CounterError::ValidationError(issues)) => assert!(issues.len() >= 2),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn test_reserved_collection_rejected() {
    let mut config = Config::default();
    config.counters.collection = "counter_families".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_env_overrides_and_parse_errors() {
    std::env::set_var("LOOP_COUNTERS_SHARDS", "25");
    std::env::set_var("LOOP_COUNTERS_WRITE_STRATEGY", "read_then_write");
    let config = Config::default().merge_from_env();
    std::env::remove_var("LOOP_COUNTERS_SHARDS");
    std::env::remove_var("LOOP_COUNTERS_WRITE_STRATEGY");

    let config = config.unwrap();
    assert_eq!(config.counters.default_shards, 25);
    assert_eq!(config.counters.write_strategy, WriteStrategy::ReadThenWrite);

    std::env::set_var("LOOP_COUNTERS_SHARDS", "-3");
    let result = Config::default().merge_from_env();
    std::env::remove_var("LOOP_COUNTERS_SHARDS");
    assert!(
        result.is_err(),
        "negative shard count from environment should fail to parse"
    );
}

#[test]
fn test_cli_overrides_file() {
    let mut file = NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(
        file,
        "[counters]\ndefault_shards = 4\n\n[cache]\nmax_entries = 77\n\n[logging]\nlevel = \"warn\""
    )
    .unwrap();

    let cli = CliArgs {
        shards: Some(12),
        ..Default::default()
    };
    let config = Config::from_file(file.path()).unwrap().merge_from_cli(&cli);
    assert_eq!(config.counters.default_shards, 12);
    assert_eq!(config.cache.max_entries, 77);
    assert_eq!(config.logging.level, "warn");
}

#[test]
fn test_json_config_file() {
    let mut file = NamedTempFile::with_suffix(".json").unwrap();
    write!(
        file,
        r#"{{"cache": {{"aggregate_ttl_secs": 30}}, "feed": {{"page_limit": 20}}}}"#
    )
    .unwrap();

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.cache.aggregate_ttl_secs, 30);
    assert_eq!(config.feed.page_limit, 20);
    assert_eq!(config.counters.default_shards, 10);
}

#[test]
fn test_malformed_config_file() {
    let mut file = NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(file, "[counters\ndefault_shards = ").unwrap();
    assert!(matches!(
        Config::from_file(file.path()),
        Err(CounterError::ParseError(_))
    ));
}
