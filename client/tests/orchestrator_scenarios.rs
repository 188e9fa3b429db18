//! End-to-end startup scenarios over a SQLite-backed local store.
//!
//! The remote side is played by the in-process doubles from
//! `client::test_support`; the local side is the real SQLite adapter so
//! restarts observe exactly what a previous session persisted.

use std::path::Path;
use std::sync::Arc;

use client::domain::{
    BusinessDocuments, Document, DocumentKind, ErrorCode, IdentityBinding, IdentityBindingConfig,
    OrchestratorConfig, OrchestratorState, TenantContextOrchestrator, TenantId, TenantRegistry,
    TenantRegistryConfig, UserKey,
};
use client::domain::ports::DocumentStore;
use client::outbound::persistence::{ROADY_PARTITION, SqliteDocumentStore, USERS_PARTITION};
use client::test_support::{
    FakeChangeFeed, FakeIdentityProvider, FakeProfileDirectory, FakeTenantDirectory,
    ImmediateSleeper, MutableClock, fixed_now,
};
use rstest::{fixture, rstest};
use serde_json::{Value, json};
use tempfile::TempDir;

struct Remote {
    profiles: Arc<FakeProfileDirectory>,
    directory: Arc<FakeTenantDirectory>,
}

struct Session {
    roady: SqliteDocumentStore,
    users: SqliteDocumentStore,
    provider: Arc<FakeIdentityProvider>,
    binding: IdentityBinding,
    orchestrator: TenantContextOrchestrator,
}

#[fixture]
fn remote() -> Remote {
    Remote {
        profiles: Arc::new(FakeProfileDirectory::new()),
        directory: Arc::new(FakeTenantDirectory::new(vec![
            json!({ "id": "t1", "name": "Acme", "userIds": ["user_a"] }),
            json!({ "id": "tenant_t2", "name": "Zed", "userIds": ["user_a"] }),
        ])),
    }
}

fn open_session(dir: &Path, remote: &Remote, provider: FakeIdentityProvider) -> Session {
    let roady = SqliteDocumentStore::open(&dir.join("roady.sqlite3"), ROADY_PARTITION)
        .expect("open local database");
    let users = roady.partition(USERS_PARTITION);
    let provider = Arc::new(provider);
    let clock = Arc::new(MutableClock::new(fixed_now()));
    let binding = IdentityBinding::new(
        Arc::new(users.clone()),
        provider.clone(),
        remote.profiles.clone(),
        clock.clone(),
        Arc::new(ImmediateSleeper),
        IdentityBindingConfig::default(),
    );
    let registry = TenantRegistry::new(
        Arc::new(roady.clone()),
        remote.directory.clone(),
        clock,
        Arc::new(ImmediateSleeper),
        TenantRegistryConfig::default(),
    );
    let orchestrator = TenantContextOrchestrator::new(
        binding.clone(),
        registry,
        Arc::new(FakeChangeFeed::new()),
        OrchestratorConfig::default(),
    );
    Session {
        roady,
        users,
        provider,
        binding,
        orchestrator,
    }
}

fn claims(active: Option<&str>) -> Value {
    match active {
        Some(tenant) => json!({ "sub": "user_a", "active_tenant_id": tenant }),
        None => json!({ "sub": "user_a" }),
    }
}

fn user_key() -> UserKey {
    UserKey::from_subject("user_a")
}

#[rstest]
#[tokio::test]
async fn warm_restart_works_offline_from_the_local_cache(remote: Remote) {
    let dir = TempDir::new().expect("tempdir");
    let first = open_session(
        dir.path(),
        &remote,
        FakeIdentityProvider::signed_in(&claims(None)).then_reissue(&claims(Some("t1"))),
    );
    let context = first.orchestrator.initialize().await.expect("online start");
    assert_eq!(context.selected_tenant().id.as_str(), "t1");
    assert_eq!(context.tenants().len(), 2);
    first.orchestrator.shutdown().await;
    drop(first);

    remote.directory.set_online(false);
    remote.profiles.set_online(false);
    let second = open_session(
        dir.path(),
        &remote,
        FakeIdentityProvider::signed_in(&claims(Some("t1"))),
    );

    let context = second.orchestrator.initialize().await.expect("offline start");

    assert_eq!(context.selected_tenant().name, "Acme");
    assert_eq!(context.tenants().len(), 2);
    assert_eq!(second.provider.refresh_count(), 0);
    assert!(matches!(
        second.orchestrator.state(),
        OrchestratorState::Ready(ref tenant) if tenant.id.as_str() == "t1"
    ));
    second.orchestrator.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn offline_switch_is_pending_until_the_profile_is_flushed(remote: Remote) {
    let dir = TempDir::new().expect("tempdir");
    let session = open_session(
        dir.path(),
        &remote,
        FakeIdentityProvider::signed_in(&claims(Some("t1"))).then_reissue(&claims(Some("t2"))),
    );
    let context = session.orchestrator.initialize().await.expect("start");
    remote.profiles.set_online(false);

    let switched = session
        .orchestrator
        .switch_tenant(&context, &TenantId::new("t2").expect("valid id"))
        .await
        .expect("switch commits locally");

    assert_eq!(switched.selected_tenant().name, "Zed");
    let pending = session
        .binding
        .local_profile(&user_key())
        .await
        .expect("read")
        .expect("profile stored");
    assert_eq!(pending.active_tenant_id, Some(TenantId::new("t2").expect("valid id")));
    assert!(pending.sync_pending);

    remote.profiles.set_online(true);
    session
        .binding
        .flush_pending_sync(&user_key())
        .await
        .expect("flush succeeds");

    assert_eq!(
        remote.profiles.remote_active_tenant(&user_key()).as_deref(),
        Some("t2")
    );
    let flushed = session
        .binding
        .local_profile(&user_key())
        .await
        .expect("read")
        .expect("profile stored");
    assert!(!flushed.sync_pending);
    session.orchestrator.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn selected_tenant_scopes_business_reads(remote: Remote) {
    let dir = TempDir::new().expect("tempdir");
    let session = open_session(
        dir.path(),
        &remote,
        FakeIdentityProvider::signed_in(&claims(Some("t2"))),
    );
    for value in [
        json!({ "_id": "gig_1", "type": "gig", "tenant": "t1", "date": "2026-05-01" }),
        json!({ "_id": "gig_2", "type": "gig", "tenant": "t2", "date": "2026-07-01" }),
        json!({ "_id": "gig_3", "type": "gig", "tenant": "tenant_t2", "date": "2026-06-01" }),
    ] {
        session
            .roady
            .put(&Document::from_json(value).expect("valid document"))
            .await
            .expect("seed");
    }

    let context = session.orchestrator.initialize().await.expect("start");
    let gigs = BusinessDocuments::new(Arc::new(session.roady.clone()))
        .list(&context.scope(), DocumentKind::Gig)
        .await
        .expect("list");

    let ids: Vec<_> = gigs.iter().map(|gig| gig.id.as_str()).collect();
    assert_eq!(ids, vec!["gig_3", "gig_2"]);
    session.orchestrator.shutdown().await;
}

#[rstest]
#[tokio::test]
async fn signed_out_start_touches_nothing(remote: Remote) {
    let dir = TempDir::new().expect("tempdir");
    let session = open_session(dir.path(), &remote, FakeIdentityProvider::signed_out());

    let error = session
        .orchestrator
        .initialize()
        .await
        .expect_err("no identity");

    assert_eq!(error.code(), ErrorCode::NoIdentity);
    assert_eq!(remote.directory.call_count(), 0);
    assert!(session.users.changes_since(0, 10).await.expect("journal").is_empty());
    assert!(session.roady.changes_since(0, 10).await.expect("journal").is_empty());
}
