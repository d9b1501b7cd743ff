use std::time::Duration;

use abe_core::config::{
    Config, ConfigError, ConfigLoader, CorsConfig, DatabaseConfig, env_key, format_duration,
    parse_duration,
};
use serde_json::json;

fn no_env() -> Vec<(String, String)> {
    Vec::new()
}

// ═══ Layering ═══

#[test]
fn test_defaults() {
    let config = Config::from_yaml_str("{}").unwrap();
    let settings = config.settings();
    assert_eq!(settings.app.name, "abe");
    assert_eq!(settings.server.address, "127.0.0.1:8080");
    assert_eq!(settings.server.shutdown_timeout, Duration::from_secs(5));
    assert!(!settings.swagger.enabled);
    assert!(!settings.i18n.enabled);
    assert!(settings.database.auto_migrate);
    assert!(config.source_file().is_none());
}

#[test]
fn test_yaml_env_and_flags_layer_in_order() {
    let config = ConfigLoader::new()
        .args(["abe", "--server-address", "0.0.0.0:9000", "--database-port", "5433"])
        .env_vars([
            ("ABE_SERVER_ADDRESS", "10.0.0.1:7000"),
            ("ABE_APP_DEBUG", "true"),
            ("ABE_WORKER_POOL_SIZE", "8"),
            ("ABE_SERVER_CORS_ALLOW_ORIGINS", "https://a.test, https://b.test"),
            ("ABE_DATABASE_URL", "sqlite::memory:"),
        ])
        .yaml_str("app:\n  name: from-yaml\nserver:\n  address: 192.168.0.1:1\n  shutdown_timeout: 1m\n")
        .load()
        .unwrap();
    let settings = config.settings();

    assert_eq!(settings.app.name, "from-yaml");
    assert!(settings.app.debug);
    assert_eq!(settings.server.address, "0.0.0.0:9000");
    assert_eq!(settings.server.shutdown_timeout, Duration::from_secs(60));
    assert_eq!(settings.worker_pool.size, 8);
    assert_eq!(settings.database.port, 5433);
    assert_eq!(settings.database.url.as_deref(), Some("sqlite::memory:"));
    assert_eq!(
        settings.server.cors.allow_origins,
        ["https://a.test", "https://b.test"]
    );
}

#[test]
fn test_config_file_from_search_paths() {
    let dir = std::env::temp_dir().join(format!("abe-config-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.yaml"), "app:\n  name: from-file\n").unwrap();

    let config = ConfigLoader::new()
        .args(["abe"])
        .env_vars(no_env())
        .search_paths(vec![std::env::temp_dir().join("abe-missing-dir"), dir.clone()])
        .load()
        .unwrap();
    assert_eq!(config.settings().app.name, "from-file");
    assert_eq!(config.source_file(), Some(dir.join("config.yaml").as_path()));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_malformed_yaml_is_parse_error() {
    let err = Config::from_yaml_str("server: [unclosed").unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got {err:?}");
}

#[test]
fn test_mistyped_value_is_invalid() {
    let err = Config::from_yaml_str("server:\n  shutdown_timeout: soon\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "got {err:?}");
}

#[test]
fn test_env_key() {
    assert_eq!(env_key("server.shutdown_timeout"), "ABE_SERVER_SHUTDOWN_TIMEOUT");
    assert_eq!(env_key("plugins.compat.strict"), "ABE_PLUGINS_COMPAT_STRICT");
}

// ═══ Live tree ═══

#[test]
fn test_typed_getters() {
    let config = Config::from_yaml_str(
        "business:\n  name: shop\n  limit: \"25\"\n  ratio: 0.5\n  open: \"yes\"\n  window: 90s\n",
    )
    .unwrap();
    assert_eq!(config.get_str("business.name").as_deref(), Some("shop"));
    assert_eq!(config.get_i64("business.limit"), Some(25));
    assert_eq!(config.get_f64("business.ratio"), Some(0.5));
    assert_eq!(config.get_bool("business.open"), Some(true));
    assert_eq!(config.get_duration("business.window"), Some(Duration::from_secs(90)));
    assert!(config.is_set("business.name"));
    assert!(!config.is_set("business.missing"));
    assert_eq!(config.get_str("server.address").as_deref(), Some("127.0.0.1:8080"));
}

#[test]
fn test_set_overrides_live_value() {
    let config = Config::from_yaml_str("{}").unwrap();
    config.set("feature.flags.beta", json!(true));
    assert_eq!(config.get_bool("feature.flags.beta"), Some(true));
    assert_eq!(config.get("feature.flags"), Some(json!({ "beta": true })));

    // clones share the live tree
    let clone = config.clone();
    clone.set("feature.flags.beta", json!(false));
    assert_eq!(config.get_bool("feature.flags.beta"), Some(false));
}

#[test]
fn test_worker_pool_section_lists_only_used_keys() {
    let config = Config::from_yaml_str("worker_pool:\n  size: 4\n  expiry: 10s\n").unwrap();
    assert_eq!(config.settings().worker_pool.size, 4);
    assert_eq!(config.settings().worker_pool.max_blocking_tasks, 10_000);

    let defaults = Config::from_yaml_str("{}").unwrap();
    assert_eq!(
        defaults.get("worker_pool"),
        Some(json!({ "size": 50_000, "max_blocking_tasks": 10_000, "nonblocking": false }))
    );
}

#[test]
fn test_dotted_keys_are_addressable() {
    let config = Config::from_yaml_str("plugins:\n  enable:\n    acme.audit: false\n").unwrap();
    assert_eq!(config.get_bool("plugins.enable.acme.audit"), Some(false));
    assert_eq!(config.settings().plugins.enable.get("acme.audit"), Some(&false));
}

#[test]
fn test_section() {
    let config = Config::from_yaml_str(
        "server:\n  cors:\n    enabled: true\n    allow_origins: [\"*.example.com\"]\n",
    )
    .unwrap();
    let cors: CorsConfig = config.section("server.cors").unwrap();
    assert!(cors.enabled);
    assert_eq!(cors.allow_origins, ["*.example.com"]);
    assert_eq!(cors.max_age, 86_400);

    let err = config.section::<CorsConfig>("server.address").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

// ═══ Durations ═══

#[test]
fn test_parse_duration() {
    assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
    assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
    assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
    assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
    assert_eq!(parse_duration(" 2s ").unwrap(), Duration::from_secs(2));
    assert!(parse_duration("").is_err());
    assert!(parse_duration("5 minutes").is_err());
    assert!(parse_duration("10x").is_err());
}

#[test]
fn test_format_duration() {
    assert_eq!(format_duration(Duration::ZERO), "0s");
    assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
    assert_eq!(format_duration(Duration::from_secs(120)), "2m");
    assert_eq!(format_duration(Duration::from_secs(90)), "90s");
    assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
}

// ═══ Database URL ═══

#[test]
fn test_connection_url() {
    let none = DatabaseConfig::default();
    assert_eq!(none.connection_url().unwrap(), None);

    let sqlite = DatabaseConfig {
        kind: "sqlite".into(),
        dbname: "app.db".into(),
        ..DatabaseConfig::default()
    };
    assert_eq!(sqlite.connection_url().unwrap().as_deref(), Some("sqlite://app.db?mode=rwc"));

    let pg = DatabaseConfig {
        kind: "postgres".into(),
        user: "u".into(),
        password: "p".into(),
        dbname: "d".into(),
        ..DatabaseConfig::default()
    };
    assert_eq!(
        pg.connection_url().unwrap().as_deref(),
        Some("postgres://u:p@127.0.0.1:5432/d")
    );

    let explicit = DatabaseConfig {
        url: Some("mysql://root@db/app".into()),
        kind: "postgres".into(),
        ..DatabaseConfig::default()
    };
    assert_eq!(explicit.connection_url().unwrap().as_deref(), Some("mysql://root@db/app"));

    let unknown = DatabaseConfig {
        kind: "oracle".into(),
        ..DatabaseConfig::default()
    };
    assert!(unknown.connection_url().is_err());
}
