//! Integration tests for `SqliteDocumentStore` and `LocalSettingsStore`.
//!
//! Each test works on a database file in its own temporary directory and
//! reopens it where durability matters.

use client::domain::ports::{DocumentStore, DocumentStoreError, ReplicatedWrite};
use client::domain::{Document, DocumentId, KeyRange, RangeScan, Revision, TenantId};
use client::outbound::persistence::{
    LocalSettingsStore, ROADY_PARTITION, SqliteDocumentStore, USERS_PARTITION,
};
use client::test_support::{object, temp_sqlite_store};
use reqwest::Url;
use rstest::rstest;
use serde_json::json;

fn gig(id: &str, name: &str) -> Document {
    Document::new(
        DocumentId::new(id).expect("valid id"),
        object(json!({ "type": "gig", "tenant": "t1", "name": name })),
    )
}

#[tokio::test]
async fn writes_survive_reopening_the_file() {
    let (dir, store) = temp_sqlite_store();
    let revision = store.put(&gig("gig_1", "Launch")).await.expect("create");
    drop(store);

    let reopened = SqliteDocumentStore::open(&dir.path().join("roady.sqlite3"), ROADY_PARTITION)
        .expect("reopen");
    let stored = reopened
        .get(&DocumentId::new("gig_1").expect("valid id"))
        .await
        .expect("document persisted");

    assert_eq!(stored.revision, Some(revision));
    assert_eq!(stored.body.get("name"), Some(&json!("Launch")));
}

#[rstest]
#[case::create_over_existing(None)]
#[case::stale_revision(Some("1-0000"))]
#[tokio::test]
async fn writes_without_the_stored_revision_conflict(#[case] supplied: Option<&str>) {
    let (_dir, store) = temp_sqlite_store();
    let first = store.put(&gig("gig_1", "Launch")).await.expect("create");
    store
        .put(&gig("gig_1", "Launch party").with_revision(Some(first)))
        .await
        .expect("update");

    let revision = supplied.map(|raw| Revision::parse(raw).expect("valid revision"));
    let error = store
        .put(&gig("gig_1", "Lost update").with_revision(revision))
        .await
        .expect_err("conflict");

    assert!(matches!(error, DocumentStoreError::Conflict { .. }));
}

#[tokio::test]
async fn partitions_share_the_file_but_not_the_keys() {
    let (_dir, roady) = temp_sqlite_store();
    let users = roady.partition(USERS_PARTITION);
    roady.put(&gig("gig_1", "Launch")).await.expect("roady write");

    let missing = users
        .get(&DocumentId::new("gig_1").expect("valid id"))
        .await
        .expect_err("other partition");

    assert!(matches!(missing, DocumentStoreError::NotFound { .. }));
    assert!(users.changes_since(0, 10).await.expect("journal").is_empty());
}

#[tokio::test]
async fn range_scans_page_through_a_prefix_in_key_order() {
    let (_dir, store) = temp_sqlite_store();
    for id in ["gig_3", "gig_1", "equipment_1", "gig_2"] {
        store.put(&gig(id, id)).await.expect("seed");
    }

    let documents = RangeScan::new(&store, KeyRange::prefix("gig_"))
        .with_page_size(2)
        .collect()
        .await
        .expect("scan");

    let ids: Vec<_> = documents.iter().map(|doc| doc.id.as_str()).collect();
    assert_eq!(ids, vec!["gig_1", "gig_2", "gig_3"]);
}

#[tokio::test]
async fn journal_reports_each_document_once_at_its_latest_write() {
    let (_dir, store) = temp_sqlite_store();
    let first = store.put(&gig("gig_1", "Launch")).await.expect("create");
    store.put(&gig("gig_2", "Tour")).await.expect("create");
    store
        .put(&gig("gig_1", "Launch party").with_revision(Some(first)))
        .await
        .expect("update");

    let changes = store.changes_since(0, 10).await.expect("journal");

    let ids: Vec<_> = changes.iter().map(|c| c.document.id.as_str()).collect();
    assert_eq!(ids, vec!["gig_2", "gig_1"]);
    let last = changes.last().expect("two changes").sequence;
    assert!(store.changes_since(last, 10).await.expect("journal").is_empty());
}

#[tokio::test]
async fn replicated_copies_keep_the_winning_revision() {
    let (_dir, store) = temp_sqlite_store();
    let newer = gig("gig_1", "Remote edit")
        .with_revision(Some(Revision::parse("4-bbbb").expect("valid revision")));
    let older = gig("gig_1", "Stale edit")
        .with_revision(Some(Revision::parse("2-ffff").expect("valid revision")));

    let applied = store.apply_replicated(&newer).await.expect("apply");
    let superseded = store.apply_replicated(&older).await.expect("apply");

    assert_eq!(applied, ReplicatedWrite::Applied);
    assert_eq!(superseded, ReplicatedWrite::Superseded);
    let stored = store
        .get(&DocumentId::new("gig_1").expect("valid id"))
        .await
        .expect("stored");
    assert_eq!(stored.body.get("name"), Some(&json!("Remote edit")));
    assert_eq!(stored.revision.map(|rev| rev.generation()), Some(4));
}

#[tokio::test]
async fn local_settings_live_alongside_documents() {
    let (dir, store) = temp_sqlite_store();
    let settings = LocalSettingsStore::alongside(&store).expect("settings table");
    let url = Url::parse("https://sync.example.test/").expect("valid url");
    settings.set_sync_url(&url).await.expect("save url");
    settings
        .set_selected_tenant(&TenantId::new("tenant_t2").expect("valid id"))
        .await
        .expect("save tenant");
    drop(settings);
    drop(store);

    let reopened = SqliteDocumentStore::open(&dir.path().join("roady.sqlite3"), ROADY_PARTITION)
        .expect("reopen");
    let settings = LocalSettingsStore::alongside(&reopened).expect("settings table");

    assert_eq!(settings.sync_url().await.expect("read"), Some(url));
    assert_eq!(
        settings.selected_tenant().await.expect("read"),
        Some(TenantId::new("t2").expect("valid id"))
    );
    assert!(settings.app_options().await.expect("read").is_empty());
}
