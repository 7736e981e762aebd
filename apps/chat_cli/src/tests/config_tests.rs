use super::*;

use std::time::Duration;

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let pairs: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| pairs.get(key).cloned()
}

#[test]
fn defaults_match_library_defaults() {
    let settings = Settings::default();
    assert_eq!(settings.session_options(), SessionOptions::default());
    let relay = settings.relay_options().expect("relay");
    assert_eq!(relay.url.as_str(), "ws://localhost:3000/ws");
    assert_eq!(relay.reconnect, ReconnectPolicy::default());
    assert!(settings.auth_options().validate_remotely);
}

#[test]
fn file_then_env_override_in_order() {
    let mut settings = Settings::default();
    apply_file(
        &mut settings,
        r#"
server_url = "https://chat.example"
search_min_query_len = "4"
typing_idle_ms = "1500"
"#,
    );
    assert_eq!(settings.server_url, "https://chat.example");
    assert_eq!(settings.search_min_query_len, 4);

    apply_env(
        &mut settings,
        env_from(&[
            ("APP__SEARCH_MIN_QUERY_LEN", "2"),
            ("APP__RECONNECT_MAX_ATTEMPTS", "5"),
            ("APP__OUTBOUND_QUEUE", "not-a-number"),
        ]),
    );
    assert_eq!(settings.search_min_query_len, 2);
    assert_eq!(settings.reconnect_max_attempts, Some(5));
    assert_eq!(settings.outbound_queue, Settings::default().outbound_queue);
    assert_eq!(
        settings.session_options().typing_idle,
        Duration::from_millis(1500)
    );
    assert_eq!(
        settings.relay_options().expect("relay").url.as_str(),
        "wss://chat.example/ws"
    );
}

#[test]
fn app_server_url_wins_over_legacy_name() {
    let mut settings = Settings::default();
    apply_env(
        &mut settings,
        env_from(&[
            ("CHAT_SERVER_URL", "http://legacy:1"),
            ("APP__SERVER_URL", "http://preferred:2"),
        ]),
    );
    assert_eq!(settings.server_url, "http://preferred:2");
}

#[test]
fn explicit_relay_url_is_used_verbatim() {
    let mut settings = Settings::default();
    apply_env(
        &mut settings,
        env_from(&[("APP__RELAY_URL", "wss://relay.example/socket")]),
    );
    assert_eq!(
        settings.relay_options().expect("relay").url.as_str(),
        "wss://relay.example/socket"
    );

    apply_env(&mut settings, env_from(&[("APP__RELAY_URL", "  ")]));
    assert_eq!(settings.relay_url, None);
}

#[test]
fn malformed_file_is_ignored() {
    let mut settings = Settings::default();
    apply_file(&mut settings, "server_url = [1, 2]");
    assert_eq!(settings, Settings::default());
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/chat.db"),
        "sqlite://./data/chat.db"
    );
    assert_eq!(
        normalize_database_url("sqlite::memory:"),
        "sqlite::memory:"
    );
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
}
