//! Identity binding service.
//!
//! Maps the signed-in identity to a user key and keeps the user's
//! active-tenant pointer consistent across the local profile, the remote
//! profile and the token's claims. The local profile is authoritative: remote
//! pushes happen in the background and are retried by the profile poller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockable::Clock;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::document::Revision;
use super::identity::{IdentityToken, TokenClaims, UserKey};
use super::ports::{
    DocumentStore, IdentityProvider, ProfileDirectory, TokenRequest, find_document,
};
use super::profile::UserProfile;
use super::retry::{Attempt, RetryError, RetryPolicy, Sleeper, retry_with_policy};
use super::tenant::TenantId;
use super::upsert::{UpsertOutcome, upsert_document};
use super::Error;

/// Default attempts when waiting for a reissued token to carry the claim.
pub const DEFAULT_TOKEN_REFRESH_ATTEMPTS: u32 = 5;
/// Default pause between token reissues.
pub const DEFAULT_TOKEN_REFRESH_DELAY: Duration = Duration::from_millis(500);
const PROFILE_WRITE_ATTEMPTS: u32 = 3;

/// Tunables for [`IdentityBinding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityBindingConfig {
    /// Retry schedule for [`IdentityBinding::refresh_token_claims`].
    pub token_refresh: RetryPolicy,
    /// Conflict retry budget for profile writes.
    pub profile_write: RetryPolicy,
}

impl Default for IdentityBindingConfig {
    fn default() -> Self {
        Self {
            token_refresh: RetryPolicy::fixed(
                DEFAULT_TOKEN_REFRESH_ATTEMPTS,
                DEFAULT_TOKEN_REFRESH_DELAY,
            ),
            profile_write: RetryPolicy::immediate(PROFILE_WRITE_ATTEMPTS),
        }
    }
}

/// Subject and derived key of the signed-in identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// `sub` claim.
    pub subject: String,
    /// SHA-256 of the subject.
    pub user_key: UserKey,
    /// Active-tenant claim carried by the token.
    pub claimed_tenant: Option<TenantId>,
}

/// Outcome of a local active-tenant write.
///
/// The local write has committed by the time this value exists. The remote
/// push runs on its own task; dropping the value leaves it running.
#[derive(Debug)]
pub struct ActiveTenantUpdate {
    /// Tenant now stored as active.
    pub tenant: TenantId,
    /// Revision of the local profile after the write.
    pub revision: Option<Revision>,
    remote: JoinHandle<Result<(), Error>>,
}

impl ActiveTenantUpdate {
    /// Wait for the background remote push and report how it went.
    ///
    /// # Errors
    ///
    /// The remote push error, or an internal error if the task panicked.
    pub async fn remote_sync(self) -> Result<(), Error> {
        self.remote
            .await
            .map_err(|error| Error::internal(format!("remote profile sync task failed: {error}")))?
    }
}

/// Identity binding service.
#[derive(Clone)]
pub struct IdentityBinding {
    users: Arc<dyn DocumentStore>,
    provider: Arc<dyn IdentityProvider>,
    profiles: Arc<dyn ProfileDirectory>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    config: IdentityBindingConfig,
}

impl IdentityBinding {
    /// Build the service over the user-profile partition.
    pub fn new(
        users: Arc<dyn DocumentStore>,
        provider: Arc<dyn IdentityProvider>,
        profiles: Arc<dyn ProfileDirectory>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        config: IdentityBindingConfig,
    ) -> Self {
        Self {
            users,
            provider,
            profiles,
            clock,
            sleeper,
            config,
        }
    }

    /// Configured token refresh schedule.
    pub fn token_refresh_policy(&self) -> RetryPolicy {
        self.config.token_refresh
    }

    /// Current signed token.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NoIdentity`](super::ErrorCode::NoIdentity) when signed out
    /// or the provider cannot produce a token.
    pub async fn current_token(&self) -> Result<IdentityToken, Error> {
        match self.provider.signed_token(TokenRequest::Cached).await {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(Error::no_identity("no signed identity token is available")),
            Err(error) => Err(error.into()),
        }
    }

    /// Decode the token's subject and derive the user key.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::MissingSubject`](super::ErrorCode::MissingSubject) when the
    /// token is malformed or has no `sub` claim.
    pub fn resolve_identity(token: &IdentityToken) -> Result<ResolvedIdentity, Error> {
        let claims = token
            .claims()
            .map_err(|error| Error::missing_subject(format!("identity token unreadable: {error}")))?;
        let TokenClaims {
            subject,
            active_tenant,
        } = claims;
        let subject =
            subject.ok_or_else(|| Error::missing_subject("identity token has no subject"))?;
        Ok(ResolvedIdentity {
            user_key: UserKey::from_subject(&subject),
            subject,
            claimed_tenant: active_tenant,
        })
    }

    /// Derive the user key from a token.
    ///
    /// # Errors
    ///
    /// See [`Self::resolve_identity`].
    pub fn resolve_user_key(token: &IdentityToken) -> Result<UserKey, Error> {
        Self::resolve_identity(token).map(|identity| identity.user_key)
    }

    /// Locally stored profile, if any.
    pub async fn local_profile(&self, user_key: &UserKey) -> Result<Option<UserProfile>, Error> {
        let document = find_document(self.users.as_ref(), &user_key.document_id())
            .await?;
        Ok(document.map(|document| UserProfile::from_body(user_key.clone(), &document.body)))
    }

    /// Local profile, or the remote snapshot stored locally when absent.
    ///
    /// # Errors
    ///
    /// Storage failures and remote failures; callers treat both as degraded.
    pub async fn load_profile(&self, user_key: &UserKey) -> Result<Option<UserProfile>, Error> {
        if let Some(profile) = self.local_profile(user_key).await? {
            return Ok(Some(profile));
        }
        let remote = self
            .profiles
            .fetch_profile(user_key)
            .await?;
        let Some(body) = remote else {
            debug!(user_key = %user_key, "no remote profile yet");
            return Ok(None);
        };
        self.merge_remote_profile(user_key, &body).await?;
        self.local_profile(user_key).await
    }

    /// Active tenant: local pointer first, then the token's claim.
    pub async fn get_active_tenant(&self, user_key: &UserKey) -> Result<Option<TenantId>, Error> {
        match self.local_profile(user_key).await {
            Ok(Some(UserProfile {
                active_tenant_id: Some(tenant),
                ..
            })) => return Ok(Some(tenant)),
            Ok(_) => {}
            Err(error) => warn!(%error, "local profile unreadable; using token claim"),
        }
        let token = match self.provider.signed_token(TokenRequest::Cached).await {
            Ok(token) => token,
            Err(error) => {
                warn!(%error, "identity provider unavailable");
                None
            }
        };
        Ok(token
            .and_then(|token| token.claims().ok())
            .and_then(|claims| claims.active_tenant))
    }

    /// Store `tenant` as active locally, then push it to the remote profile in
    /// the background.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::LocalWriteFailed`](super::ErrorCode::LocalWriteFailed) when
    /// the local write does not commit. Remote problems never fail this call.
    pub async fn set_active_tenant(
        &self,
        user_key: &UserKey,
        tenant: &TenantId,
    ) -> Result<ActiveTenantUpdate, Error> {
        let now = self.clock.utc();
        let id = user_key.document_id();
        let outcome = upsert_document(
            self.users.as_ref(),
            &id,
            &self.config.profile_write,
            self.sleeper.as_ref(),
            |current| {
                let mut profile = current.map_or_else(
                    || UserProfile::new(user_key.clone()),
                    |document| UserProfile::from_body(user_key.clone(), &document.body),
                );
                profile.active_tenant_id = Some(tenant.clone());
                profile.synced_at = Some(now);
                profile.sync_pending = true;
                Some(profile.to_document().body)
            },
        )
        .await
        .map_err(|error| Error::local_write_failed(format!("active tenant write failed: {error}")))?;

        let revision = match outcome {
            UpsertOutcome::Written(revision) => Some(revision),
            UpsertOutcome::Unchanged => None,
            UpsertOutcome::Abandoned => {
                return Err(Error::local_write_failed(
                    "active tenant write kept conflicting with concurrent writers",
                ));
            }
        };
        info!(user_key = %user_key, tenant_id = %tenant, "active tenant stored locally");

        let binding = self.clone();
        let user_key = user_key.clone();
        let pushed = tenant.clone();
        let remote = tokio::spawn(async move {
            let result = binding.push_active_tenant(&user_key, &pushed).await;
            if let Err(error) = &result {
                warn!(%error, tenant_id = %pushed, "remote active tenant sync failed; will retry");
            }
            result
        });
        Ok(ActiveTenantUpdate {
            tenant: tenant.clone(),
            revision,
            remote,
        })
    }

    /// Push a locally pending pointer to the remote profile.
    ///
    /// Returns `true` when a push succeeded.
    ///
    /// # Errors
    ///
    /// Remote or storage failures; the pending flag stays set.
    pub async fn flush_pending_sync(&self, user_key: &UserKey) -> Result<bool, Error> {
        let Some(profile) = self.local_profile(user_key).await? else {
            return Ok(false);
        };
        match (profile.sync_pending, profile.active_tenant_id) {
            (true, Some(tenant)) => {
                debug!(tenant_id = %tenant, "flushing pending active tenant");
                self.push_active_tenant(user_key, &tenant).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Force token reissues until one carries an active-tenant claim, and
    /// when `expected` is given, that it names `expected`.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ClaimPropagationTimeout`](super::ErrorCode::ClaimPropagationTimeout)
    /// once the attempts are spent.
    pub async fn refresh_token_claims(
        &self,
        policy: &RetryPolicy,
        expected: Option<&TenantId>,
    ) -> Result<TokenClaims, Error> {
        let provider = self.provider.as_ref();
        let result = retry_with_policy(policy, self.sleeper.as_ref(), |attempt| async move {
            let claims = match provider.signed_token(TokenRequest::ForceRefresh).await {
                Ok(Some(token)) => token.claims().ok(),
                Ok(None) => None,
                Err(error) => {
                    debug!(%error, attempt, "token reissue failed");
                    None
                }
            };
            match claims {
                Some(claims)
                    if claims.active_tenant.is_some()
                        && expected.is_none_or(|tenant| claims.active_tenant.as_ref() == Some(tenant)) =>
                {
                    Attempt::Done(claims)
                }
                _ => {
                    debug!(attempt, "token does not carry the active tenant yet");
                    Attempt::Retry(attempt)
                }
            }
        })
        .await;

        result.map_err(|error| {
            let attempts = match error {
                RetryError::Exhausted { attempts, .. } => attempts,
                RetryError::Aborted(attempt) => attempt,
            };
            Error::claim_propagation_timeout(format!(
                "token lacked an active tenant claim after {attempts} attempts"
            ))
            .with_details(serde_json::json!({ "attempts": attempts }))
        })
    }

    /// Merge a profile from the remote change feed into the local profile.
    ///
    /// A pending local pointer is never overwritten; when the remote has caught
    /// up with it the pending flag is cleared. Returns `true` when the local
    /// profile content changed.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn merge_remote_profile(
        &self,
        user_key: &UserKey,
        body: &Map<String, Value>,
    ) -> Result<bool, Error> {
        let remote = UserProfile::from_body(user_key.clone(), body);
        let now = self.clock.utc();
        let content_changed = AtomicBool::new(false);
        let outcome = upsert_document(
            self.users.as_ref(),
            &user_key.document_id(),
            &self.config.profile_write,
            self.sleeper.as_ref(),
            |current| {
                let local = current
                    .map(|document| UserProfile::from_body(user_key.clone(), &document.body));
                let merge = merge_profiles(local.as_ref(), &remote, now);
                content_changed.store(
                    matches!(merge, ProfileMerge::Replace(_)),
                    Ordering::Relaxed,
                );
                match merge {
                    ProfileMerge::Keep => None,
                    ProfileMerge::Acknowledge(profile) | ProfileMerge::Replace(profile) => {
                        Some(profile.to_document().body)
                    }
                }
            },
        )
        .await?;
        Ok(matches!(outcome, UpsertOutcome::Written(_)) && content_changed.load(Ordering::Relaxed))
    }

    async fn push_active_tenant(&self, user_key: &UserKey, tenant: &TenantId) -> Result<(), Error> {
        self.profiles
            .update_active_tenant(user_key, tenant)
            .await?;
        upsert_document(
            self.users.as_ref(),
            &user_key.document_id(),
            &self.config.profile_write,
            self.sleeper.as_ref(),
            |current| {
                let mut profile =
                    UserProfile::from_body(user_key.clone(), &current?.body);
                if !profile.sync_pending || profile.active_tenant_id.as_ref() != Some(tenant) {
                    return None;
                }
                profile.sync_pending = false;
                Some(profile.to_document().body)
            },
        )
        .await?;
        info!(tenant_id = %tenant, "active tenant synced to remote profile");

        if let Err(error) = self.profiles.choose_tenant(tenant).await {
            warn!(%error, tenant_id = %tenant, "choose-tenant notification failed");
        }
        Ok(())
    }
}

enum ProfileMerge {
    /// Local profile already reflects the remote one, or holds a pending pointer.
    Keep,
    /// Remote caught up with the pending pointer; only the flag changes.
    Acknowledge(UserProfile),
    /// Remote content replaces the local profile.
    Replace(UserProfile),
}

fn merge_profiles(
    local: Option<&UserProfile>,
    remote: &UserProfile,
    now: DateTime<Utc>,
) -> ProfileMerge {
    match local {
        Some(local) if local.sync_pending => {
            if local.active_tenant_id != remote.active_tenant_id {
                return ProfileMerge::Keep;
            }
            let mut acknowledged = remote.clone();
            acknowledged.sync_pending = false;
            acknowledged.synced_at = local.synced_at;
            ProfileMerge::Acknowledge(acknowledged)
        }
        Some(local) if local.same_content(remote) => ProfileMerge::Keep,
        _ => {
            let mut replaced = remote.clone();
            replaced.sync_pending = false;
            replaced.synced_at = Some(now);
            ProfileMerge::Replace(replaced)
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit coverage for local-first active-tenant handling.

    use super::*;
    use crate::domain::ErrorCode;
    use crate::domain::KeyRange;
    use crate::outbound::persistence::MemoryDocumentStore;
    use crate::test_support::{
        FakeIdentityProvider, FakeProfileDirectory, FaultInjectingStore, ImmediateSleeper,
        MutableClock, RecordingSleeper, fixed_now, unsigned_token,
    };
    use rstest::rstest;
    use serde_json::json;

    fn binding_with(
        users: Arc<dyn DocumentStore>,
        provider: FakeIdentityProvider,
        profiles: Arc<FakeProfileDirectory>,
        sleeper: Arc<dyn Sleeper>,
    ) -> IdentityBinding {
        IdentityBinding::new(
            users,
            Arc::new(provider),
            profiles,
            Arc::new(MutableClock::new(fixed_now())),
            sleeper,
            IdentityBindingConfig::default(),
        )
    }

    fn signed_in() -> FakeIdentityProvider {
        FakeIdentityProvider::signed_in(&json!({ "sub": "user_a" }))
    }

    fn key() -> UserKey {
        UserKey::from_subject("user_a")
    }

    fn tenant(raw: &str) -> TenantId {
        TenantId::new(raw).expect("tenant id")
    }

    #[rstest]
    #[case::no_subject(json!({ "active_tenant_id": "t1" }))]
    #[case::blank_subject(json!({ "sub": "  " }))]
    fn tokens_without_subject_are_rejected(#[case] payload: Value) {
        let error = IdentityBinding::resolve_user_key(&unsigned_token(&payload))
            .expect_err("subject required");
        assert_eq!(error.code(), ErrorCode::MissingSubject);
    }

    #[test]
    fn malformed_token_is_a_missing_subject() {
        let error = IdentityBinding::resolve_user_key(&IdentityToken::new("not-a-token"))
            .expect_err("malformed");
        assert_eq!(error.code(), ErrorCode::MissingSubject);
    }

    #[test]
    fn resolution_carries_the_claimed_tenant() {
        let token = unsigned_token(&json!({
            "sub": "user_a",
            "metadata": { "active_tenant_id": "tenant_t3" }
        }));
        let identity = IdentityBinding::resolve_identity(&token).expect("resolves");
        assert_eq!(identity.user_key, key());
        assert_eq!(identity.claimed_tenant, Some(tenant("t3")));
    }

    #[tokio::test]
    async fn setting_twice_keeps_one_profile_document() {
        let users = Arc::new(MemoryDocumentStore::new());
        let profiles = Arc::new(FakeProfileDirectory::new());
        let binding = binding_with(
            users.clone(),
            signed_in(),
            profiles.clone(),
            Arc::new(ImmediateSleeper),
        );

        for _ in 0..2 {
            binding
                .set_active_tenant(&key(), &tenant("t1"))
                .await
                .expect("local write")
                .remote_sync()
                .await
                .expect("remote sync");
        }

        assert_eq!(profiles.updates().len(), 2);
        let documents = users
            .scan_page(&KeyRange::prefix("user_"), None, 10)
            .await
            .expect("scan");
        assert_eq!(documents.len(), 1);
        let profile = binding
            .local_profile(&key())
            .await
            .expect("read")
            .expect("profile");
        assert_eq!(profile.active_tenant_id, Some(tenant("t1")));
        assert!(!profile.sync_pending);
    }

    #[tokio::test]
    async fn offline_write_succeeds_and_is_flushed_later() {
        let profiles = Arc::new(FakeProfileDirectory::new());
        profiles.set_online(false);
        let binding = binding_with(
            Arc::new(MemoryDocumentStore::new()),
            signed_in(),
            profiles.clone(),
            Arc::new(ImmediateSleeper),
        );

        let update = binding
            .set_active_tenant(&key(), &tenant("t2"))
            .await
            .expect("local write succeeds offline");
        assert!(update.revision.is_some());
        let remote = update.remote_sync().await.expect_err("remote push fails");
        assert_eq!(remote.code(), ErrorCode::Unreachable);
        let pending = binding
            .local_profile(&key())
            .await
            .expect("read")
            .expect("profile");
        assert!(pending.sync_pending);

        profiles.set_online(true);
        assert!(binding.flush_pending_sync(&key()).await.expect("flush"));
        assert_eq!(profiles.remote_active_tenant(&key()).as_deref(), Some("t2"));
        assert_eq!(profiles.chosen(), vec![tenant("t2")]);
        let synced = binding
            .local_profile(&key())
            .await
            .expect("read")
            .expect("profile");
        assert!(!synced.sync_pending);
        assert!(!binding.flush_pending_sync(&key()).await.expect("nothing left"));
    }

    #[tokio::test]
    async fn failed_local_write_is_fatal() {
        let users = Arc::new(
            FaultInjectingStore::new(MemoryDocumentStore::new())
                .fail_writes_to(key().document_id().as_str()),
        );
        let binding = binding_with(
            users,
            signed_in(),
            Arc::new(FakeProfileDirectory::new()),
            Arc::new(ImmediateSleeper),
        );

        let error = binding
            .set_active_tenant(&key(), &tenant("t1"))
            .await
            .expect_err("write fails");

        assert_eq!(error.code(), ErrorCode::LocalWriteFailed);
        assert!(error.is_fatal());
    }

    #[tokio::test]
    async fn claim_refresh_gives_up_after_fixed_delays() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let binding = binding_with(
            Arc::new(MemoryDocumentStore::new()),
            signed_in(),
            Arc::new(FakeProfileDirectory::new()),
            sleeper.clone(),
        );

        let error = binding
            .refresh_token_claims(&binding.token_refresh_policy(), None)
            .await
            .expect_err("claim never appears");

        assert_eq!(error.code(), ErrorCode::ClaimPropagationTimeout);
        assert_eq!(error.details(), Some(&json!({ "attempts": 5 })));
        assert_eq!(sleeper.recorded(), vec![DEFAULT_TOKEN_REFRESH_DELAY; 4]);
    }

    #[tokio::test]
    async fn claim_refresh_waits_for_the_expected_tenant() {
        let provider = FakeIdentityProvider::signed_in(&json!({ "sub": "user_a" }))
            .then_reissue(&json!({ "sub": "user_a", "active_tenant_id": "t1" }))
            .then_reissue(&json!({ "sub": "user_a", "active_tenant_id": "t2" }));
        let binding = binding_with(
            Arc::new(MemoryDocumentStore::new()),
            provider,
            Arc::new(FakeProfileDirectory::new()),
            Arc::new(ImmediateSleeper),
        );

        let claims = binding
            .refresh_token_claims(&binding.token_refresh_policy(), Some(&tenant("t2")))
            .await
            .expect("claim arrives");

        assert_eq!(claims.active_tenant, Some(tenant("t2")));
    }

    #[tokio::test]
    async fn active_tenant_falls_back_to_the_token_claim() {
        let provider =
            FakeIdentityProvider::signed_in(&json!({ "sub": "user_a", "tenant_id": "tenant_t4" }));
        let binding = binding_with(
            Arc::new(MemoryDocumentStore::new()),
            provider,
            Arc::new(FakeProfileDirectory::new()),
            Arc::new(ImmediateSleeper),
        );

        assert_eq!(
            binding.get_active_tenant(&key()).await.expect("lookup"),
            Some(tenant("t4"))
        );
    }

    #[tokio::test]
    async fn remote_profile_is_cached_on_first_load() {
        let profiles = Arc::new(
            FakeProfileDirectory::new()
                .with_profile(&key(), json!({ "type": "user", "active_tenant_id": "t5" })),
        );
        let binding = binding_with(
            Arc::new(MemoryDocumentStore::new()),
            signed_in(),
            profiles.clone(),
            Arc::new(ImmediateSleeper),
        );

        let loaded = binding
            .load_profile(&key())
            .await
            .expect("load")
            .expect("remote profile");
        let again = binding.load_profile(&key()).await.expect("load");

        assert_eq!(loaded.active_tenant_id, Some(tenant("t5")));
        assert_eq!(loaded.synced_at, Some(fixed_now()));
        assert_eq!(again, Some(loaded));
        assert_eq!(profiles.fetch_count(), 1);
    }
}
