//! The current user's profile document.
//!
//! The profile's only interpreted field is the active-tenant pointer. A local
//! write of the pointer marks the profile `syncPending` until the remote
//! profile has acknowledged the same value.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::document::{Document, DocumentKind, KIND_FIELD};
use super::identity::UserKey;
use super::tenant::{TenantId, format_timestamp};

const ACTIVE_TENANT_FIELD: &str = "active_tenant_id";
const SYNCED_AT_FIELD: &str = "syncedAt";
const SYNC_PENDING_FIELD: &str = "syncPending";

/// Locally cached user profile.
///
/// # Examples
/// ```
/// use client::domain::{TenantId, UserKey, UserProfile};
///
/// let mut profile = UserProfile::new(UserKey::from_subject("sub"));
/// profile.active_tenant_id = Some(TenantId::new("tenant_t2").expect("valid id"));
/// let document = profile.to_document();
/// assert_eq!(document.body["active_tenant_id"], "t2");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
    /// Owner of the profile.
    pub user_key: UserKey,
    /// Active-tenant pointer.
    pub active_tenant_id: Option<TenantId>,
    /// Last local or remote write time.
    pub synced_at: Option<DateTime<Utc>>,
    /// The pointer was written locally and has not reached the remote yet.
    pub sync_pending: bool,
    /// Fields this client does not interpret.
    pub extra: Map<String, Value>,
}

impl UserProfile {
    /// Empty profile for `user_key`.
    pub fn new(user_key: UserKey) -> Self {
        Self {
            user_key,
            active_tenant_id: None,
            synced_at: None,
            sync_pending: false,
            extra: Map::new(),
        }
    }

    /// Read a profile from a remote document body or a local document body.
    ///
    /// Malformed pointers and timestamps are treated as absent rather than
    /// failing the whole profile.
    pub fn from_body(user_key: UserKey, body: &Map<String, Value>) -> Self {
        let active_tenant_id = body
            .get(ACTIVE_TENANT_FIELD)
            .and_then(Value::as_str)
            .and_then(|raw| TenantId::new(raw).ok());
        let synced_at = body
            .get(SYNCED_AT_FIELD)
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc));
        let sync_pending = body
            .get(SYNC_PENDING_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let extra = body
            .iter()
            .filter(|(key, _)| {
                !key.starts_with('_')
                    && !matches!(
                        key.as_str(),
                        KIND_FIELD | ACTIVE_TENANT_FIELD | SYNCED_AT_FIELD | SYNC_PENDING_FIELD
                    )
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Self {
            user_key,
            active_tenant_id,
            synced_at,
            sync_pending,
            extra,
        }
    }

    /// Equality of the remote-visible content (pointer and unknown fields).
    pub fn same_content(&self, other: &Self) -> bool {
        self.active_tenant_id == other.active_tenant_id && self.extra == other.extra
    }

    /// Render as a local document (no revision).
    pub fn to_document(&self) -> Document {
        let mut body = self.extra.clone();
        body.insert(KIND_FIELD.to_owned(), Value::from(DocumentKind::User.as_str()));
        body.insert(
            ACTIVE_TENANT_FIELD.to_owned(),
            self.active_tenant_id
                .as_ref()
                .map_or(Value::Null, |id| Value::from(id.as_str())),
        );
        if let Some(synced_at) = self.synced_at {
            body.insert(SYNCED_AT_FIELD.to_owned(), Value::from(format_timestamp(synced_at)));
        }
        body.insert(SYNC_PENDING_FIELD.to_owned(), Value::Bool(self.sync_pending));
        Document::new(self.user_key.document_id(), body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_body_round_trips_through_local_document() {
        let key = UserKey::from_subject("sub-1");
        let Value::Object(remote) = json!({
            "_id": "user_x",
            "_rev": "3-abc",
            "type": "user",
            "active_tenant_id": "tenant_t1",
            "email_hash": "ff"
        }) else {
            panic!("object literal");
        };

        let profile = UserProfile::from_body(key.clone(), &remote);
        assert_eq!(profile.active_tenant_id, Some(TenantId::new("t1").expect("id")));
        assert!(!profile.sync_pending);

        let document = profile.to_document();
        assert_eq!(document.id, key.document_id());
        let restored = UserProfile::from_body(key, &document.body);
        assert_eq!(restored, profile);
    }
}
