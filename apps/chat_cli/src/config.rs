use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Result;
use client_core::{AuthOptions, ReconnectPolicy, RelayOptions, SessionOptions};

pub const DEFAULT_CONFIG_FILE: &str = "chat.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    /// Derived from `server_url` when unset.
    pub relay_url: Option<String>,
    pub database_url: String,
    pub search_min_query_len: usize,
    pub typing_idle_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: Option<u32>,
    pub outbound_queue: usize,
    pub validate_token: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let session = SessionOptions::default();
        let reconnect = ReconnectPolicy::default();
        Self {
            server_url: "http://localhost:3000".into(),
            relay_url: None,
            database_url: "sqlite://./data/chat.db".into(),
            search_min_query_len: session.search_min_query_len,
            typing_idle_ms: session.typing_idle.as_millis() as u64,
            reconnect_initial_ms: reconnect.initial_backoff.as_millis() as u64,
            reconnect_max_ms: reconnect.max_backoff.as_millis() as u64,
            reconnect_max_attempts: reconnect.max_attempts,
            outbound_queue: client_core::transport::DEFAULT_OUTBOUND_QUEUE,
            validate_token: true,
        }
    }
}

impl Settings {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            search_min_query_len: self.search_min_query_len,
            typing_idle: Duration::from_millis(self.typing_idle_ms),
        }
    }

    pub fn relay_options(&self) -> Result<RelayOptions> {
        let mut options = match self.relay_url.as_deref() {
            Some(url) => RelayOptions::new(url)?,
            None => RelayOptions::from_server_url(&self.server_url)?,
        };
        options.reconnect = ReconnectPolicy {
            initial_backoff: Duration::from_millis(self.reconnect_initial_ms),
            max_backoff: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.reconnect_max_attempts,
        };
        options.outbound_queue = self.outbound_queue;
        Ok(options)
    }

    pub fn auth_options(&self) -> AuthOptions {
        AuthOptions {
            validate_remotely: self.validate_token,
            ..AuthOptions::default()
        }
    }
}

/// Defaults, then the optional config file, then the environment.
pub fn load_settings(config_path: &Path) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(config_path) {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());

    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) else {
        tracing::warn!("ignoring config file that is not a flat string table");
        return;
    };
    for (key, value) in &file_cfg {
        apply_value(settings, key, value);
    }
}

fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    for key in [
        "server_url",
        "relay_url",
        "database_url",
        "search_min_query_len",
        "typing_idle_ms",
        "reconnect_initial_ms",
        "reconnect_max_ms",
        "reconnect_max_attempts",
        "outbound_queue",
        "validate_token",
    ] {
        if let Some(v) = lookup(&format!("APP__{}", key.to_ascii_uppercase())) {
            apply_value(settings, key, &v);
        }
    }
}

fn apply_value(settings: &mut Settings, key: &str, value: &str) {
    let value = value.trim();
    match key {
        "server_url" => settings.server_url = value.to_string(),
        "relay_url" => {
            settings.relay_url = (!value.is_empty()).then(|| value.to_string());
        }
        "database_url" => settings.database_url = value.to_string(),
        "search_min_query_len" => {
            if let Ok(parsed) = value.parse() {
                settings.search_min_query_len = parsed;
            }
        }
        "typing_idle_ms" => {
            if let Ok(parsed) = value.parse() {
                settings.typing_idle_ms = parsed;
            }
        }
        "reconnect_initial_ms" => {
            if let Ok(parsed) = value.parse() {
                settings.reconnect_initial_ms = parsed;
            }
        }
        "reconnect_max_ms" => {
            if let Ok(parsed) = value.parse() {
                settings.reconnect_max_ms = parsed;
            }
        }
        "reconnect_max_attempts" => {
            settings.reconnect_max_attempts = value.parse().ok().filter(|max| *max > 0);
        }
        "outbound_queue" => {
            if let Ok(parsed) = value.parse() {
                settings.outbound_queue = parsed;
            }
        }
        "validate_token" => {
            if let Ok(parsed) = value.parse() {
                settings.validate_token = parsed;
            }
        }
        other => tracing::debug!(key = other, "ignoring unknown setting"),
    }
}

/// Turns a plain file path into a `sqlite://` url. The store creates the
/// parent directory when it opens.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
