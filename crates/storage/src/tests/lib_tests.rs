use super::*;

#[tokio::test]
async fn stores_and_clears_bearer_token() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    assert_eq!(store.bearer_token().await.expect("read"), None);

    store.set_bearer_token("a.b.c").await.expect("write");
    assert_eq!(
        store.bearer_token().await.expect("read"),
        Some("a.b.c".to_string())
    );

    store.set_bearer_token("d.e.f").await.expect("overwrite");
    assert_eq!(
        store.bearer_token().await.expect("read"),
        Some("d.e.f".to_string())
    );

    store.clear_bearer_token().await.expect("clear");
    assert_eq!(store.bearer_token().await.expect("read"), None);
}

#[tokio::test]
async fn blank_token_reads_as_missing() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    store.set_bearer_token("   ").await.expect("write");
    assert_eq!(store.bearer_token().await.expect("read"), None);
}

#[tokio::test]
async fn recent_contacts_keep_first_contact_order_without_duplicates() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");

    assert!(store.record_recent_contact("alice").await.expect("alice"));
    assert!(store.record_recent_contact("bob").await.expect("bob"));
    assert!(!store.record_recent_contact("alice").await.expect("again"));
    assert!(!store.record_recent_contact("  ").await.expect("blank"));

    assert_eq!(
        store.recent_contacts().await.expect("list"),
        vec!["alice".to_string(), "bob".to_string()]
    );
}

#[tokio::test]
async fn avatar_index_round_trips_and_ignores_garbage() {
    let store = LocalStore::new("sqlite::memory:").await.expect("db");
    assert_eq!(store.avatar_index().await.expect("read"), None);

    store.set_avatar_index(5).await.expect("write");
    assert_eq!(store.avatar_index().await.expect("read"), Some(5));

    store
        .set_value(KEY_AVATAR_INDEX, "/img/dp/icon3.png")
        .await
        .expect("legacy value");
    assert_eq!(store.avatar_index().await.expect("read"), None);
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("chat_client_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("local.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = LocalStore::new(&database_url).await.expect("db");
    store.record_recent_contact("carol").await.expect("write");
    drop(store);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    let reopened = LocalStore::new(&database_url).await.expect("reopen");
    assert_eq!(
        reopened.recent_contacts().await.expect("list"),
        vec!["carol".to_string()]
    );
    drop(reopened);

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[test]
fn memory_url_has_no_path() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(
        sqlite_path("sqlite://./data/local.db?mode=rwc"),
        Some(PathBuf::from("./data/local.db"))
    );
}
