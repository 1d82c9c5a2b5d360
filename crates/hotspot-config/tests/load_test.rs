#![allow(clippy::unwrap_used)]

use std::time::Duration;

use hotspot_config::{ConfigError, SecretResolver, load_config, write_default_config};
use pretty_assertions::assert_eq;
use secrecy::ExposeSecret;

const FULL: &str = r#"
settings_from_env = false

[server]
bind = "127.0.0.1:9090"
log_format = "json"

[database]
url_env = "TEST_PORTAL_DB_URL"
max_connections = 4

[redis]
url = "redis://127.0.0.1:6379/0"
key_prefix = "hs-test:"

[payment]
server_key = "SB-Mid-server-file"
production = true
base_url = "http://127.0.0.1:9999"

[whatsapp]
url = "https://api.fonnte.com/send"
token = "wa-token"
timeout_secs = 3

[telegram]
bot_token = "123:abc"
admin_chat_id = "-100200300"

[jobs]
reconcile_pending_secs = 30
quota_notices_secs = 0
"#;

fn lookup(name: &str) -> Option<String> {
    (name == "TEST_PORTAL_DB_URL").then(|| "postgres://portal:pw@db/portal".to_owned())
}

#[test]
fn full_file_translates_to_portal_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, FULL).unwrap();

    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:9090");
    assert_eq!(config.server.log_format, "json");
    // unspecified job periods keep their defaults
    assert_eq!(config.jobs.expire_sweep_secs, 300);
    assert_eq!(config.jobs.quota_notices_secs, 0);

    let portal = config.to_portal_config(&SecretResolver::with_lookup(lookup)).unwrap();
    assert!(!portal.settings_from_env);

    let db = portal.database.unwrap();
    assert_eq!(db.url.expose_secret(), "postgres://portal:pw@db/portal");
    assert_eq!(db.max_connections, 4);
    assert_eq!(db.acquire_timeout, Duration::from_secs(5));

    let redis = portal.redis.unwrap();
    assert_eq!(redis.key_prefix, "hs-test:");
    assert_eq!(redis.timeout, Duration::from_millis(500));

    assert!(portal.payment.production);
    assert_eq!(portal.payment.server_key.expose_secret(), "SB-Mid-server-file");
    assert_eq!(
        portal.payment.base_url.unwrap().as_str(),
        "http://127.0.0.1:9999/"
    );

    let wa = portal.whatsapp.unwrap();
    assert_eq!(wa.timeout, Duration::from_secs(3));
    assert_eq!(wa.token.expose_secret(), "wa-token");
    assert_eq!(
        portal.telegram.unwrap().admin_chat_id.as_deref(),
        Some("-100200300")
    );
    assert_eq!(portal.jobs.reconcile_pending_secs, 30);
}

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(Some(&dir.path().join("absent.toml"))).unwrap();
    assert!(config.settings_from_env);
    assert!(config.database.is_none());
    assert_eq!(config.server.bind.port(), 8080);
    assert_eq!(config.payment.server_key_env.as_deref(), Some("MIDTRANS_SERVER_KEY"));
}

#[test]
fn missing_database_secret_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[database]\nurl_env = \"UNSET_DB_URL\"\n\n[payment]\nserver_key = \"k\"\n",
    )
    .unwrap();

    let config = load_config(Some(&path)).unwrap();
    let err = config
        .to_portal_config(&SecretResolver::with_lookup(|_: &str| None))
        .unwrap_err();
    assert!(
        matches!(err, ConfigError::MissingSecret { ref secret } if secret == "database-url"),
        "{err}"
    );
}

#[test]
fn missing_ca_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[payment]\nserver_key = \"k\"\n\n[router]\nca_cert = \"/nonexistent/ca.pem\"\n",
    )
    .unwrap();

    let err = load_config(Some(&path))
        .unwrap()
        .to_portal_config(&SecretResolver::with_lookup(|_: &str| None))
        .unwrap_err();
    assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "router.ca_cert"));
}

#[test]
fn malformed_file_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[server]\nbind = \"not-an-address\"\n").unwrap();
    assert!(matches!(load_config(Some(&path)), Err(ConfigError::Figment(_))));
}

#[test]
fn starter_file_round_trips_and_is_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    write_default_config(&path).unwrap();
    let config = load_config(Some(&path)).unwrap();
    assert!(config.settings_from_env);
    assert_eq!(config.server.log_format, "pretty");

    let err = write_default_config(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Validation { .. }));
}
