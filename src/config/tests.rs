use std::io::Write as _;

use config::FileFormat;
use serial_test::serial;

use super::*;
use crate::cache::CacheConfig;

fn from_toml(toml: &str) -> Result<Settings, LoadError> {
    let raw: RawSettings = Config::builder()
        .add_source(File::from_str(toml, FileFormat::Toml))
        .build()?
        .try_deserialize()?;
    Settings::from_raw(raw)
}

#[test]
fn defaults_match_documented_values() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.database.url, None);
    assert_eq!(settings.database.max_connections.get(), 8);
    assert!(settings.database.run_migrations);
    assert_eq!(settings.cache.auto_consume_interval_ms, 5000);
    assert_eq!(settings.cache.consume_batch_limit.get(), 100);
    assert_eq!(settings.cache.rebuild_page_size.get(), 500);
    assert!(settings.cache.serve_stale_on_unavailable);

    let fallback = Settings::default();
    assert_eq!(
        fallback.cache.consume_batch_limit,
        settings.cache.consume_batch_limit
    );
}

#[test]
fn toml_sections_override_defaults() {
    let settings = from_toml(
        r#"
        [logging]
        level = "debug"
        json = true

        [database]
        url = "  postgres://localhost/nucache  "
        max_connections = 3

        [cache]
        consume_on_write = false
        rebuild_page_size = 50
        "#,
    )
    .expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert!(matches!(settings.logging.format, LogFormat::Json));
    assert_eq!(
        settings.database.url.as_deref(),
        Some("postgres://localhost/nucache")
    );
    assert_eq!(settings.database.max_connections.get(), 3);
    assert!(!settings.cache.consume_on_write);
    assert_eq!(settings.cache.rebuild_page_size.get(), 50);
}

#[test]
fn blank_database_url_is_treated_as_unset() {
    let settings = from_toml("[database]\nurl = \"   \"\n").expect("valid settings");
    assert_eq!(settings.database.url, None);
}

#[test]
fn zero_batch_limit_is_rejected() {
    let err = from_toml("[cache]\nconsume_batch_limit = 0\n").unwrap_err();
    match err {
        LoadError::Invalid { key, .. } => assert_eq!(key, "cache.consume_batch_limit"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn unknown_log_level_is_rejected() {
    let err = from_toml("[logging]\nlevel = \"chatty\"\n").unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn cache_config_mirrors_settings() {
    let settings = from_toml("[cache]\nauto_consume_interval_ms = 0\nverify_on_startup = false\n")
        .expect("valid settings");
    let config = CacheConfig::from(&settings.cache);

    assert_eq!(config.auto_consume_interval(), None);
    assert!(!config.verify_on_startup);
    assert_eq!(config.consume_batch_limit, 100);
}

#[test]
#[serial]
fn environment_overrides_files() {
    let path = std::env::temp_dir().join(format!("nucache-config-{}.toml", std::process::id()));
    let mut file = std::fs::File::create(&path).expect("create config file");
    writeln!(file, "[cache]\nconsume_batch_limit = 7\nrebuild_page_size = 9").expect("write");
    drop(file);

    // SAFETY: serialized with other environment-mutating tests.
    unsafe { std::env::set_var("NUCACHE__CACHE__REBUILD_PAGE_SIZE", "11") };
    let settings = load(Some(path.as_path()));
    unsafe { std::env::remove_var("NUCACHE__CACHE__REBUILD_PAGE_SIZE") };
    let _ = std::fs::remove_file(&path);

    let settings = settings.expect("valid settings");
    assert_eq!(settings.cache.consume_batch_limit.get(), 7);
    assert_eq!(settings.cache.rebuild_page_size.get(), 11);
}
