//! Tenant (band) identity and directory entries.
//!
//! Tenant identifiers reach the client in two spellings, with and without the
//! `tenant_` namespace prefix. [`TenantId`] normalises both to the bare form
//! once, so every comparison downstream is plain equality.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::document::{DELETED_AT_FIELD, Document, DocumentId, DocumentKind, KIND_FIELD};

/// Namespace prefix of tenant document keys.
pub const TENANT_ID_PREFIX: &str = "tenant_";

const NAME_FIELD: &str = "name";
const MEMBERS_FIELD: &str = "userIds";
const SYNCED_AT_FIELD: &str = "syncedAt";
const ID_FIELD: &str = "id";
const DEFAULT_TENANT_NAME: &str = "Unnamed";

/// Validation errors raised while building tenant values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TenantValidationError {
    /// Identifier was blank once the prefix was removed.
    #[error("tenant id must not be empty")]
    EmptyId,
    /// The remote record carried none of `_id`, `tenantId` or `id`.
    #[error("tenant record has no identifier")]
    MissingId,
    /// A timestamp field was not RFC 3339.
    #[error("tenant field {field} is not an RFC 3339 timestamp")]
    InvalidTimestamp {
        /// Offending field name.
        field: &'static str,
    },
    /// The local document is not tagged as a tenant.
    #[error("document {0} is not a tenant record")]
    NotATenant(String),
}

/// Canonical (bare) tenant identifier.
///
/// # Examples
/// ```
/// use client::domain::TenantId;
///
/// let bare = TenantId::new("t1").expect("valid id");
/// let prefixed = TenantId::new("tenant_t1").expect("valid id");
/// assert_eq!(bare, prefixed);
/// assert_eq!(bare.document_id().as_str(), "tenant_t1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Normalise and validate an identifier in either spelling.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, TenantValidationError> {
        let trimmed = raw.as_ref().trim();
        let bare = trimmed.strip_prefix(TENANT_ID_PREFIX).unwrap_or(trimmed);
        if bare.trim().is_empty() {
            return Err(TenantValidationError::EmptyId);
        }
        Ok(Self(bare.to_owned()))
    }

    /// Bare identifier.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Local document key, `tenant_{id}`.
    pub fn document_id(&self) -> DocumentId {
        DocumentId::with_prefix(TENANT_ID_PREFIX, &self.0)
    }

    /// Whether a raw identifier in either spelling names this tenant.
    pub fn matches(&self, raw: &str) -> bool {
        Self::new(raw).is_ok_and(|other| other == *self)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = TenantValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// A tenant directory entry as cached locally.
#[derive(Debug, Clone, PartialEq)]
pub struct Tenant {
    /// Canonical identifier.
    pub id: TenantId,
    /// Display name.
    pub name: String,
    /// Member user identifiers.
    pub member_ids: BTreeSet<String>,
    /// Soft-deletion timestamp.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Last time the record was written from a remote source.
    pub synced_at: Option<DateTime<Utc>>,
    /// Remote fields this client does not interpret, kept verbatim.
    pub extra: Map<String, Value>,
}

impl Tenant {
    /// Build a minimal tenant record.
    pub fn new(id: TenantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            member_ids: BTreeSet::new(),
            deleted_at: None,
            synced_at: None,
            extra: Map::new(),
        }
    }

    /// Parse a record from the tenant directory or tenant change feed.
    ///
    /// The identifier is taken from `_id`, then `tenantId`, then `id`. CouchDB
    /// metadata fields are dropped; a missing name becomes `"Unnamed"`.
    pub fn from_remote(record: &Map<String, Value>) -> Result<Self, TenantValidationError> {
        let raw_id = ["_id", "tenantId", ID_FIELD]
            .into_iter()
            .find_map(|key| record.get(key).and_then(Value::as_str))
            .ok_or(TenantValidationError::MissingId)?;
        let id = TenantId::new(raw_id)?;
        Self::from_fields(id, record)
    }

    /// Parse a locally stored tenant document.
    pub fn from_document(document: &Document) -> Result<Self, TenantValidationError> {
        if document.kind() != Some(DocumentKind::Tenant) {
            return Err(TenantValidationError::NotATenant(document.id.to_string()));
        }
        let id = TenantId::new(document.id.as_str())?;
        Self::from_fields(id, &document.body)
    }

    fn from_fields(id: TenantId, record: &Map<String, Value>) -> Result<Self, TenantValidationError> {
        let name = record
            .get(NAME_FIELD)
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_TENANT_NAME)
            .to_owned();
        let member_ids = record
            .get(MEMBERS_FIELD)
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let deleted_at = parse_timestamp(record, DELETED_AT_FIELD)?;
        let synced_at = parse_timestamp(record, SYNCED_AT_FIELD)?;
        let extra = record
            .iter()
            .filter(|(key, _)| !is_interpreted_field(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(Self {
            id,
            name,
            member_ids,
            deleted_at,
            synced_at,
            extra,
        })
    }

    /// Whether the tenant has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Equality ignoring `synced_at`, used to skip no-op rewrites.
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.member_ids == other.member_ids
            && self.deleted_at == other.deleted_at
            && self.extra == other.extra
    }

    /// Render as a local document body (no revision).
    pub fn to_document(&self) -> Document {
        let mut body = self.extra.clone();
        body.insert(KIND_FIELD.to_owned(), Value::from(DocumentKind::Tenant.as_str()));
        body.insert(ID_FIELD.to_owned(), Value::from(self.id.as_str()));
        body.insert(NAME_FIELD.to_owned(), Value::from(self.name.as_str()));
        body.insert(
            MEMBERS_FIELD.to_owned(),
            Value::Array(self.member_ids.iter().cloned().map(Value::from).collect()),
        );
        if let Some(deleted_at) = self.deleted_at {
            body.insert(DELETED_AT_FIELD.to_owned(), Value::from(format_timestamp(deleted_at)));
        }
        if let Some(synced_at) = self.synced_at {
            body.insert(SYNCED_AT_FIELD.to_owned(), Value::from(format_timestamp(synced_at)));
        }
        Document::new(self.id.document_id(), body)
    }
}

fn is_interpreted_field(key: &str) -> bool {
    key.starts_with('_')
        || matches!(
            key,
            KIND_FIELD
                | ID_FIELD
                | "tenantId"
                | NAME_FIELD
                | MEMBERS_FIELD
                | DELETED_AT_FIELD
                | SYNCED_AT_FIELD
        )
}

fn parse_timestamp(
    record: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, TenantValidationError> {
    match record.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map(|parsed| Some(parsed.with_timezone(&Utc)))
            .map_err(|_| TenantValidationError::InvalidTimestamp { field }),
        Some(_) => Err(TenantValidationError::InvalidTimestamp { field }),
    }
}

/// RFC 3339 rendering used for every stored timestamp.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    //! Unit coverage for identifier normalisation and record framing.

    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[rstest]
    #[case("t1", "t1")]
    #[case("tenant_t1", "t1")]
    #[case("  tenant_t1 ", "t1")]
    #[case("tenant_tenant_t1", "tenant_t1")]
    fn normalises_both_spellings(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(TenantId::new(raw).expect("valid id").as_str(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("tenant_")]
    fn rejects_blank_ids(#[case] raw: &str) {
        assert_eq!(TenantId::new(raw), Err(TenantValidationError::EmptyId));
    }

    #[rstest]
    #[case::couch_id(json!({ "_id": "tenant_t1", "name": "Acme" }))]
    #[case::tenant_id(json!({ "tenantId": "t1", "name": "Acme" }))]
    #[case::plain_id(json!({ "id": "t1", "name": "Acme" }))]
    fn reads_identifier_from_any_remote_field(#[case] record: Value) {
        let tenant = Tenant::from_remote(&object(record)).expect("valid record");
        assert_eq!(tenant.id.as_str(), "t1");
        assert_eq!(tenant.name, "Acme");
    }

    #[test]
    fn remote_record_without_id_is_rejected() {
        let error = Tenant::from_remote(&object(json!({ "name": "Ghost" })))
            .expect_err("id is required");
        assert_eq!(error, TenantValidationError::MissingId);
    }

    #[test]
    fn document_round_trip_preserves_unknown_fields() {
        let tenant = Tenant::from_remote(&object(json!({
            "_id": "t1",
            "_rev": "7-remote",
            "userIds": ["u2", "u1"],
            "plan": "pro"
        })))
        .expect("valid record");
        assert_eq!(tenant.name, "Unnamed");

        let document = tenant.to_document();
        assert_eq!(document.id.as_str(), "tenant_t1");
        assert!(document.revision.is_none());
        assert_eq!(document.body["plan"], json!("pro"));
        assert_eq!(document.body["userIds"], json!(["u1", "u2"]));
        assert!(!document.body.contains_key("_rev"));

        let restored = Tenant::from_document(&document).expect("tenant document");
        assert!(restored.same_content(&tenant));
    }
}
