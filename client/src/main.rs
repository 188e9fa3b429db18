//! Sync client entry-point: resolves the tenant context and keeps it live.

use std::sync::Arc;

use color_eyre::eyre::{Result, WrapErr};
use mockable::DefaultClock;
use ortho_config::OrthoConfig;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use client::ClientSettings;
use client::domain::ports::IdentityProvider;
use client::domain::{
    FeedNotification, IdentityBinding, IdentityToken, ReplicationEngine, TenantContextOrchestrator,
    TenantRegistry, TokioSleeper,
};
use client::outbound::http::{CouchRemoteStore, SyncServerClient};
use client::outbound::identity::{StaticTokenProvider, TokenFileProvider};
use client::outbound::persistence::{
    LocalSettingsStore, ROADY_PARTITION, SqliteDocumentStore, USERS_PARTITION,
};

/// Application bootstrap.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    if let Err(e) = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .try_init()
    {
        warn!(error = %e, "tracing init failed");
    }

    let settings = ClientSettings::load().wrap_err("loading configuration")?;
    let data_dir = settings.data_dir();
    tokio::fs::create_dir_all(&data_dir)
        .await
        .wrap_err_with(|| format!("creating data directory {}", data_dir.display()))?;

    let roady = SqliteDocumentStore::open(&settings.database_path(), ROADY_PARTITION)
        .wrap_err("opening local database")?;
    let users = roady.partition(USERS_PARTITION);
    let local_settings = LocalSettingsStore::alongside(&roady)?;

    let identity: Arc<dyn IdentityProvider> = match settings.identity_token.as_deref() {
        Some(raw) => Arc::new(StaticTokenProvider::new(IdentityToken::new(raw))),
        None => Arc::new(TokenFileProvider::new(settings.token_path())),
    };
    let base_url = settings.remote_base_url()?;
    let server = SyncServerClient::new(
        base_url.clone(),
        settings.request_timeout(),
        Arc::clone(&identity),
    )
    .wrap_err("building HTTP client")?;
    local_settings.set_sync_url(&base_url).await?;

    let clock = Arc::new(DefaultClock);
    let sleeper = Arc::new(TokioSleeper);
    let binding = IdentityBinding::new(
        Arc::new(users),
        identity,
        Arc::new(server.clone()),
        clock.clone(),
        sleeper.clone(),
        settings.identity_binding()?,
    );
    let registry = TenantRegistry::new(
        Arc::new(roady.clone()),
        Arc::new(server.clone()),
        clock,
        sleeper,
        settings.tenant_registry(),
    );
    let orchestrator = TenantContextOrchestrator::new(
        binding,
        registry,
        Arc::new(server.clone()),
        settings.orchestrator()?,
    );

    let context = orchestrator.initialize().await?;
    let tenant = context.selected_tenant();
    local_settings.set_selected_tenant(&tenant.id).await?;
    info!(tenant = %tenant.id, name = %tenant.name, tenants = context.tenants().len(), "tenant context ready");

    tokio::spawn(log_feed_notifications(orchestrator.subscribe_feeds()));

    let replication = ReplicationEngine::new(settings.replication());
    if settings.replicate {
        let remote = CouchRemoteStore::new(
            server,
            settings.database_name(),
            settings.skip_remote_setup,
        );
        replication.start(Arc::new(roady), Arc::new(remote)).await;
    }

    tokio::signal::ctrl_c()
        .await
        .wrap_err("waiting for shutdown signal")?;
    info!("shutting down");
    replication.stop().await;
    orchestrator.shutdown().await;
    Ok(())
}

async fn log_feed_notifications(
    mut notifications: tokio::sync::broadcast::Receiver<FeedNotification>,
) {
    loop {
        match notifications.recv().await {
            Ok(notification) => info!(
                feed = ?notification.feed,
                changed = notification.changed,
                sequence = notification.sequence,
                "local cache updated from change feed"
            ),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "feed notifications lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
