use super::*;
use tempfile::TempDir;

#[test]
fn default_config_is_valid() {
    TsdbConfig::default().validate().unwrap();
}

#[test]
fn out_of_range_fields_are_rejected() {
    let cases = [
        TsdbConfig {
            max_tables: 9,
            ..TsdbConfig::default()
        },
        TsdbConfig {
            days_per_file: 61,
            ..TsdbConfig::default()
        },
        TsdbConfig {
            min_rows_per_file_block: 5,
            ..TsdbConfig::default()
        },
        TsdbConfig {
            max_rows_per_file_block: 20_000,
            ..TsdbConfig::default()
        },
        TsdbConfig {
            keep: 0,
            ..TsdbConfig::default()
        },
        TsdbConfig {
            max_cache_size: 1024,
            ..TsdbConfig::default()
        },
    ];

    for cfg in cases {
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}

#[test]
fn min_rows_must_not_exceed_max_rows() {
    let cfg = TsdbConfig {
        min_rows_per_file_block: 1000,
        max_rows_per_file_block: 200,
        ..TsdbConfig::default()
    };
    assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
}

#[test]
fn update_may_only_change_keep_and_cache_size() {
    let base = TsdbConfig::default();

    let ok = TsdbConfig {
        keep: 30,
        max_cache_size: 32 * 1024 * 1024,
        ..base.clone()
    };
    base.validate_update(&ok).unwrap();

    let bad = TsdbConfig {
        days_per_file: 1,
        ..base.clone()
    };
    assert!(matches!(
        base.validate_update(&bad),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn encoded_size_matches_constant() {
    let bytes = crate::encoding::encode_to_vec(&TsdbConfig::default()).unwrap();
    assert_eq!(bytes.len(), CONFIG_ENCODED_SIZE);
}

#[test]
fn config_file_round_trip() {
    let tmp = TempDir::new().unwrap();
    let cfg = TsdbConfig {
        tsdb_id: 7,
        days_per_file: 1,
        keep: 30,
        ..TsdbConfig::default()
    };

    write_config(tmp.path(), &cfg).unwrap();
    let loaded = read_config(tmp.path()).unwrap();
    assert_eq!(loaded, cfg);
}

#[test]
fn corrupt_config_is_detected() {
    let tmp = TempDir::new().unwrap();
    write_config(tmp.path(), &TsdbConfig::default()).unwrap();

    let path = tmp.path().join(CONFIG_FILENAME);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[4] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        read_config(tmp.path()),
        Err(ConfigError::Corrupt(_))
    ));
}

#[test]
fn fid_math_covers_negative_keys() {
    let cfg = TsdbConfig {
        days_per_file: 1,
        ..TsdbConfig::default()
    };
    let span = cfg.partition_span();
    assert_eq!(span, 86_400_000);

    assert_eq!(cfg.fid_of(0), 0);
    assert_eq!(cfg.fid_of(86_399_999), 0);
    assert_eq!(cfg.fid_of(86_400_000), 1);
    assert_eq!(cfg.fid_of(-1), -1);

    let (lo, hi) = cfg.fid_window(1);
    assert_eq!((lo, hi), (86_400_000, 172_799_999));
}
