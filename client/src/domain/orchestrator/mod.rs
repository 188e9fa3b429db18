//! Startup and tenant-switch sequencing.
//!
//! The orchestrator resolves the identity, loads the tenant list, picks and
//! commits the active tenant, then starts the change-feed pollers. Each run
//! ends in [`OrchestratorState::Ready`] or [`OrchestratorState::Failed`] and
//! yields an explicit [`SessionContext`].

mod selection;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};

pub use selection::{SelectionSource, select_active_tenant};

use super::change_feed::{
    ChangeFeedPoller, DEFAULT_POLL_INTERVAL, FeedNotification, ProfileFeedMerger,
    TenantFeedMerger,
};
use super::context::SessionContext;
use super::identity::UserKey;
use super::identity_binding::{IdentityBinding, ResolvedIdentity};
use super::ports::ChangeFeedSource;
use super::tenant::{Tenant, TenantId};
use super::tenant_registry::TenantRegistry;
use super::Error;

const FEED_NOTIFICATION_CAPACITY: usize = 64;

/// Where a startup or switch run currently is.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorState {
    /// Nothing has run yet, or the session was shut down.
    Idle,
    /// Reading the token and deriving the user key.
    ResolvingIdentity,
    /// Loading the local profile and refreshing caches.
    LoadingLocalCaches,
    /// Reading the tenant list.
    ResolvingTenantList,
    /// Applying the selection priority.
    SelectingActiveTenant,
    /// Writing the selection and waiting for the token claim.
    CommittingSelection,
    /// Starting the change-feed pollers.
    StartingBackgroundSync,
    /// Finished with the given active tenant.
    Ready(Tenant),
    /// Finished with a fatal error.
    Failed(Error),
}

/// Tunables for [`TenantContextOrchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Refresh the tenant directory during startup, ignoring failures.
    pub refresh_tenants_on_startup: bool,
    /// Interval of both change-feed pollers.
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            refresh_tenants_on_startup: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Sequences identity, tenant selection and background sync.
pub struct TenantContextOrchestrator {
    binding: IdentityBinding,
    registry: TenantRegistry,
    feeds: Arc<dyn ChangeFeedSource>,
    config: OrchestratorConfig,
    state: watch::Sender<OrchestratorState>,
    notifications: broadcast::Sender<FeedNotification>,
    pollers: Mutex<Vec<ChangeFeedPoller>>,
}

impl TenantContextOrchestrator {
    /// Orchestrator over the given services.
    pub fn new(
        binding: IdentityBinding,
        registry: TenantRegistry,
        feeds: Arc<dyn ChangeFeedSource>,
        config: OrchestratorConfig,
    ) -> Self {
        let (state, _) = watch::channel(OrchestratorState::Idle);
        let (notifications, _) = broadcast::channel(FEED_NOTIFICATION_CAPACITY);
        Self {
            binding,
            registry,
            feeds,
            config,
            state,
            notifications,
            pollers: Mutex::new(Vec::new()),
        }
    }

    /// Current state.
    pub fn state(&self) -> OrchestratorState {
        self.state.borrow().clone()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    /// Notifications from both change-feed pollers.
    pub fn subscribe_feeds(&self) -> broadcast::Receiver<FeedNotification> {
        self.notifications.subscribe()
    }

    /// Run the startup sequence.
    ///
    /// # Errors
    ///
    /// `NoIdentity` or `MissingSubject` without a usable token,
    /// `NoTenantsAvailable` for an empty tenant list, `Unauthorized` or
    /// `Unreachable` when the list must come from the remote and cannot,
    /// `LocalWriteFailed` and `ClaimPropagationTimeout` while committing the
    /// selection.
    pub async fn initialize(&self) -> Result<SessionContext, Error> {
        let result = self.startup().await;
        self.finish(result)
    }

    /// Make `target` the active tenant of an existing session.
    ///
    /// A target missing from the context triggers one directory refresh.
    ///
    /// # Errors
    ///
    /// `TenantNotFound` when the target is still unknown after the refresh,
    /// otherwise as for committing the selection in [`Self::initialize`].
    pub async fn switch_tenant(
        &self,
        context: &SessionContext,
        target: &TenantId,
    ) -> Result<SessionContext, Error> {
        let result = self.switch(context, target).await;
        self.finish(result)
    }

    /// Stop both pollers and return to [`OrchestratorState::Idle`].
    pub async fn shutdown(&self) {
        self.stop_pollers().await;
        self.state.send_replace(OrchestratorState::Idle);
        info!("tenant context shut down");
    }

    async fn startup(&self) -> Result<SessionContext, Error> {
        self.enter(OrchestratorState::ResolvingIdentity);
        let token = self.binding.current_token().await?;
        let ResolvedIdentity {
            subject,
            user_key,
            claimed_tenant,
        } = IdentityBinding::resolve_identity(&token)?;
        info!(user_key = %user_key, "identity resolved");

        self.enter(OrchestratorState::LoadingLocalCaches);
        let profile = match self.binding.load_profile(&user_key).await {
            Ok(profile) => profile,
            Err(error) => {
                warn!(%error, "profile unavailable; falling back to token claims");
                None
            }
        };
        if self.config.refresh_tenants_on_startup
            && let Err(error) = self.registry.refresh_from_remote().await
        {
            warn!(%error, "tenant directory refresh failed; using cached tenants");
        }

        self.enter(OrchestratorState::ResolvingTenantList);
        let tenants = self.registry.get_tenants().await?;
        if tenants.is_empty() {
            return Err(Error::no_tenants_available(
                "the signed-in user does not belong to any band",
            ));
        }

        self.enter(OrchestratorState::SelectingActiveTenant);
        let pointer = profile
            .as_ref()
            .and_then(|profile| profile.active_tenant_id.as_ref());
        let (selected, source) =
            select_active_tenant(&tenants, pointer, claimed_tenant.as_ref()).ok_or_else(|| {
                Error::no_tenants_available("the signed-in user does not belong to any band")
            })?;
        let selected = selected.clone();
        info!(tenant_id = %selected.id, ?source, "active tenant selected");

        self.commit_selection(&user_key, claimed_tenant.as_ref(), &selected).await?;
        self.start_background_sync(&user_key).await;
        Ok(SessionContext::new(user_key, subject, selected, tenants))
    }

    async fn switch(
        &self,
        context: &SessionContext,
        target: &TenantId,
    ) -> Result<SessionContext, Error> {
        self.enter(OrchestratorState::SelectingActiveTenant);
        let mut tenants = context.tenants().to_vec();
        if !tenants.iter().any(|tenant| tenant.id == *target) {
            debug!(tenant_id = %target, "switch target unknown; refreshing directory");
            if let Err(error) = self.registry.refresh_from_remote().await {
                warn!(%error, "tenant directory refresh failed");
            }
            tenants = self.registry.list_local().await?;
        }
        let selected = tenants
            .iter()
            .find(|tenant| tenant.id == *target)
            .cloned()
            .ok_or_else(|| Error::tenant_not_found(format!("tenant {target} is not available")))?;

        let claimed = match self.binding.current_token().await {
            Ok(token) => token.claims().ok().and_then(|claims| claims.active_tenant),
            Err(error) => {
                warn!(%error, "no token while switching tenant");
                None
            }
        };
        self.commit_selection(context.user_key(), claimed.as_ref(), &selected).await?;
        self.start_background_sync(context.user_key()).await;
        info!(tenant_id = %selected.id, "switched active tenant");
        Ok(context.with_selection(selected, tenants))
    }

    async fn commit_selection(
        &self,
        user_key: &UserKey,
        claimed: Option<&TenantId>,
        selected: &Tenant,
    ) -> Result<(), Error> {
        if claimed == Some(&selected.id) {
            debug!(tenant_id = %selected.id, "token already carries the selection");
            return Ok(());
        }
        self.enter(OrchestratorState::CommittingSelection);
        let update = self.binding.set_active_tenant(user_key, &selected.id).await?;
        debug!(revision = ?update.revision, "selection stored; remote sync in background");
        let policy = self.binding.token_refresh_policy();
        self.binding
            .refresh_token_claims(&policy, Some(&selected.id))
            .await?;
        Ok(())
    }

    async fn start_background_sync(&self, user_key: &UserKey) {
        self.enter(OrchestratorState::StartingBackgroundSync);
        let mut pollers = self.pollers.lock().await;
        for poller in pollers.drain(..) {
            poller.stop().await;
        }
        let profile_merger = ProfileFeedMerger::new(self.binding.clone(), user_key.clone());
        let tenant_merger = TenantFeedMerger::new(self.registry.clone());
        let started = [
            ChangeFeedPoller::with_notifications(
                Arc::clone(&self.feeds),
                Arc::new(profile_merger),
                self.config.poll_interval,
                self.notifications.clone(),
            ),
            ChangeFeedPoller::with_notifications(
                Arc::clone(&self.feeds),
                Arc::new(tenant_merger),
                self.config.poll_interval,
                self.notifications.clone(),
            ),
        ];
        for poller in started {
            if !poller.start() {
                warn!(feed = %poller.feed(), "change feed poller did not start");
            }
            pollers.push(poller);
        }
    }

    async fn stop_pollers(&self) {
        let mut pollers = self.pollers.lock().await;
        for poller in pollers.drain(..) {
            poller.stop().await;
        }
    }

    fn enter(&self, state: OrchestratorState) {
        debug!(?state, "orchestrator step");
        self.state.send_replace(state);
    }

    fn finish(&self, result: Result<SessionContext, Error>) -> Result<SessionContext, Error> {
        match &result {
            Ok(context) => self.enter(OrchestratorState::Ready(context.selected_tenant().clone())),
            Err(error) => {
                warn!(code = ?error.code(), %error, "tenant context failed");
                self.enter(OrchestratorState::Failed(error.clone()));
            }
        }
        result
    }
}
