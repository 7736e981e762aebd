use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

const KEY_BEARER_TOKEN: &str = "jwt";
const KEY_AVATAR_INDEX: &str = "profile_image";

/// Durable client-local state. Everything stored here is best-effort and
/// non-authoritative; the backend owns the real records.
#[derive(Clone)]
pub struct LocalStore {
    pool: Pool<Sqlite>,
}

impl LocalStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open local store at '{database_url}'"))?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure kv table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recent_contacts (
                position           INTEGER PRIMARY KEY AUTOINCREMENT,
                username           TEXT NOT NULL UNIQUE,
                first_contacted_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure recent_contacts table exists")?;

        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read local key '{key}'"))?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write local key '{key}'"))?;
        Ok(())
    }

    async fn remove_value(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove local key '{key}'"))?;
        Ok(())
    }

    pub async fn bearer_token(&self) -> Result<Option<String>> {
        Ok(self
            .get_value(KEY_BEARER_TOKEN)
            .await?
            .filter(|token| !token.trim().is_empty()))
    }

    pub async fn set_bearer_token(&self, token: &str) -> Result<()> {
        self.set_value(KEY_BEARER_TOKEN, token).await
    }

    pub async fn clear_bearer_token(&self) -> Result<()> {
        self.remove_value(KEY_BEARER_TOKEN).await
    }

    /// Usernames in the order they were first contacted.
    pub async fn recent_contacts(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT username FROM recent_contacts ORDER BY position ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed to list recent contacts")?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>(0))
            .collect())
    }

    /// Adds `username` to the recently-contacted set. Returns `false` when it
    /// was already present; the set only ever grows.
    pub async fn record_recent_contact(&self, username: &str) -> Result<bool> {
        let username = username.trim();
        if username.is_empty() {
            return Ok(false);
        }
        let result = sqlx::query(
            "INSERT INTO recent_contacts (username, first_contacted_at) VALUES (?, ?)
             ON CONFLICT(username) DO NOTHING",
        )
        .bind(username)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to record recent contact '{username}'"))?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            debug!(%username, "recorded recent contact");
        }
        Ok(inserted)
    }

    pub async fn avatar_index(&self) -> Result<Option<usize>> {
        Ok(self
            .get_value(KEY_AVATAR_INDEX)
            .await?
            .and_then(|raw| raw.trim().parse::<usize>().ok()))
    }

    pub async fn set_avatar_index(&self, index: usize) -> Result<()> {
        self.set_value(KEY_AVATAR_INDEX, &index.to_string()).await
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
