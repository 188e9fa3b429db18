//! Local document model shared by every partition of the document store.
//!
//! A document is a JSON object addressed by a [`DocumentId`] and guarded by an
//! opaque [`Revision`]. Revisions follow the CouchDB `{generation}-{digest}`
//! shape so replicated copies can be ordered deterministically.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::ports::{DocumentStore, DocumentStoreError};

const DIGEST_HEX_LEN: usize = 32;

/// Field carrying the document kind tag.
pub const KIND_FIELD: &str = "type";
/// Field carrying the soft-deletion timestamp.
pub const DELETED_AT_FIELD: &str = "deletedAt";

/// Validation errors for document identifiers and revisions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentValidationError {
    /// Identifier was blank.
    #[error("document id must not be empty")]
    EmptyId,
    /// Revision string did not match `{generation}-{digest}`.
    #[error("invalid revision: {0}")]
    InvalidRevision(String),
    /// JSON value was not an object or lacked `_id`.
    #[error("document JSON must be an object with an `_id` string")]
    MissingId,
}

/// Key of a document within one store partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    /// Validate and construct an identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, DocumentValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DocumentValidationError::EmptyId);
        }
        Ok(Self(id))
    }

    /// Key built from a non-empty namespace prefix and a suffix.
    pub(crate) fn with_prefix(prefix: &'static str, suffix: &str) -> Self {
        Self(format!("{prefix}{suffix}"))
    }

    /// Borrow the raw key.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<DocumentId> for String {
    fn from(value: DocumentId) -> Self {
        value.0
    }
}

impl TryFrom<String> for DocumentId {
    type Error = DocumentValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Opaque revision token returned by every successful write.
///
/// # Examples
/// ```
/// use client::domain::Revision;
/// use serde_json::Map;
///
/// let first = Revision::next(None, &Map::new());
/// let second = Revision::next(Some(&first), &Map::new());
/// assert_eq!(first.generation(), 1);
/// assert!(second.wins_over(&first));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    generation: u64,
    digest: String,
}

impl Revision {
    /// Parse a `{generation}-{digest}` string.
    pub fn parse(raw: &str) -> Result<Self, DocumentValidationError> {
        let invalid = || DocumentValidationError::InvalidRevision(raw.to_owned());
        let (generation, digest) = raw.split_once('-').ok_or_else(invalid)?;
        let generation = generation.parse::<u64>().map_err(|_| invalid())?;
        if generation == 0 || digest.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            generation,
            digest: digest.to_owned(),
        })
    }

    /// Derive the revision that follows `previous` for the given body.
    pub fn next(previous: Option<&Self>, body: &Map<String, Value>) -> Self {
        let mut hasher = Sha256::new();
        if let Some(previous) = previous {
            hasher.update(previous.to_string().as_bytes());
        }
        hasher.update(Value::Object(body.clone()).to_string().as_bytes());
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(DIGEST_HEX_LEN);
        Self {
            generation: previous.map_or(1, |rev| rev.generation.saturating_add(1)),
            digest,
        }
    }

    /// Edit count of the document.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deterministic winner rule for replicated copies: higher generation
    /// wins, ties go to the greater digest.
    pub fn wins_over(&self, other: &Self) -> bool {
        match self.generation.cmp(&other.generation) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.digest > other.digest,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl From<Revision> for String {
    fn from(value: Revision) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Revision {
    type Error = DocumentValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// Kind tags stored in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    /// Tenant directory entry.
    Tenant,
    /// User profile.
    User,
    /// Equipment item.
    Equipment,
    /// Gig template.
    GigType,
    /// Scheduled gig.
    Gig,
    /// Per-band information sheet.
    BandInfo,
}

impl DocumentKind {
    /// Wire tag of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tenant => "tenant",
            Self::User => "user",
            Self::Equipment => "equipment",
            Self::GigType => "gig_type",
            Self::Gig => "gig",
            Self::BandInfo => "band-info",
        }
    }

    /// Parse a wire tag.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "tenant" => Some(Self::Tenant),
            "user" => Some(Self::User),
            "equipment" => Some(Self::Equipment),
            "gig_type" => Some(Self::GigType),
            "gig" => Some(Self::Gig),
            "band-info" => Some(Self::BandInfo),
            _ => None,
        }
    }

    /// Tenant-scoped business kinds travel through replication; tenant and
    /// user records travel through the change feeds.
    pub fn is_business(self) -> bool {
        matches!(
            self,
            Self::Equipment | Self::GigType | Self::Gig | Self::BandInfo
        )
    }

    /// Key prefix used for range scans over this kind.
    pub fn id_prefix(self) -> &'static str {
        match self {
            Self::Tenant => "tenant_",
            Self::User => "user_",
            Self::Equipment => "equipment_",
            Self::GigType => "gig_type_",
            Self::Gig => "gig_",
            Self::BandInfo => "band-info",
        }
    }
}

/// A JSON document with its identity and revision split out of the body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Document key.
    pub id: DocumentId,
    /// Revision the caller last observed; `None` for new documents.
    pub revision: Option<Revision>,
    /// Remaining fields.
    pub body: Map<String, Value>,
}

impl Document {
    /// Build an unsaved document.
    pub fn new(id: DocumentId, body: Map<String, Value>) -> Self {
        Self {
            id,
            revision: None,
            body,
        }
    }

    /// Replace the revision.
    #[must_use]
    pub fn with_revision(mut self, revision: Option<Revision>) -> Self {
        self.revision = revision;
        self
    }

    /// Parse a CouchDB-style JSON object carrying `_id` and optional `_rev`.
    pub fn from_json(value: Value) -> Result<Self, DocumentValidationError> {
        let Value::Object(mut body) = value else {
            return Err(DocumentValidationError::MissingId);
        };
        let id = match body.remove("_id") {
            Some(Value::String(id)) => DocumentId::new(id)?,
            _ => return Err(DocumentValidationError::MissingId),
        };
        let revision = match body.remove("_rev") {
            Some(Value::String(rev)) => Some(Revision::parse(&rev)?),
            _ => None,
        };
        body.remove("_deleted");
        Ok(Self { id, revision, body })
    }

    /// Render as a CouchDB-style JSON object.
    pub fn to_json(&self) -> Value {
        let mut object = self.body.clone();
        object.insert("_id".to_owned(), Value::String(self.id.to_string()));
        if let Some(revision) = &self.revision {
            object.insert("_rev".to_owned(), Value::String(revision.to_string()));
        }
        Value::Object(object)
    }

    /// Raw kind tag.
    pub fn kind_tag(&self) -> Option<&str> {
        self.body.get(KIND_FIELD).and_then(Value::as_str)
    }

    /// Parsed kind tag.
    pub fn kind(&self) -> Option<DocumentKind> {
        self.kind_tag().and_then(DocumentKind::parse)
    }

    /// Whether the document carries a soft-deletion timestamp.
    pub fn is_soft_deleted(&self) -> bool {
        self.body
            .get(DELETED_AT_FIELD)
            .is_some_and(|value| !value.is_null())
    }
}

/// Half-open key range `[start, end)` for scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    start: String,
    end: String,
}

impl KeyRange {
    /// Range covering every key that starts with `prefix`.
    pub fn prefix(prefix: &str) -> Self {
        Self {
            start: prefix.to_owned(),
            end: format!("{prefix}{}", char::MAX),
        }
    }

    /// Explicit range.
    pub fn between(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Inclusive lower bound.
    pub fn start(&self) -> &str {
        &self.start
    }

    /// Exclusive upper bound.
    pub fn end(&self) -> &str {
        &self.end
    }

    /// Whether `id` falls inside the range.
    pub fn contains(&self, id: &str) -> bool {
        id >= self.start.as_str() && id < self.end.as_str()
    }
}

const DEFAULT_SCAN_PAGE: usize = 100;

/// Lazy, restartable range scan that pages through a [`DocumentStore`].
///
/// Each page is fetched on demand; building a new scan over the same range
/// observes the store's current contents.
pub struct RangeScan<'a> {
    store: &'a dyn DocumentStore,
    range: KeyRange,
    page_size: usize,
    after: Option<DocumentId>,
    buffer: VecDeque<Document>,
    exhausted: bool,
}

impl<'a> RangeScan<'a> {
    /// Start a scan over `range`.
    pub fn new(store: &'a dyn DocumentStore, range: KeyRange) -> Self {
        Self {
            store,
            range,
            page_size: DEFAULT_SCAN_PAGE,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Override the page size (minimum 1).
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Yield the next document, fetching another page when needed.
    pub async fn next(&mut self) -> Result<Option<Document>, DocumentStoreError> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .store
                .scan_page(&self.range, self.after.as_ref(), self.page_size)
                .await?;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.after = Some(last.id.clone());
            }
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }

    /// Drain the scan into a vector.
    pub async fn collect(mut self) -> Result<Vec<Document>, DocumentStoreError> {
        let mut documents = Vec::new();
        while let Some(document) = self.next().await? {
            documents.push(document);
        }
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    //! Unit coverage for revision ordering and JSON framing.

    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case::higher_generation("3-aaa", "2-fff", true)]
    #[case::lower_generation("1-fff", "2-aaa", false)]
    #[case::digest_tiebreak("2-bbb", "2-aaa", true)]
    #[case::identical("2-aaa", "2-aaa", false)]
    fn winner_rule_is_deterministic(#[case] left: &str, #[case] right: &str, #[case] wins: bool) {
        let left = Revision::parse(left).expect("valid revision");
        let right = Revision::parse(right).expect("valid revision");
        assert_eq!(left.wins_over(&right), wins);
    }

    #[rstest]
    #[case("")]
    #[case("abc")]
    #[case("0-abc")]
    #[case("2-")]
    fn rejects_malformed_revisions(#[case] raw: &str) {
        assert!(Revision::parse(raw).is_err());
    }

    #[test]
    fn next_revision_depends_on_body_and_parent() {
        let body = json!({ "name": "Acme" });
        let Value::Object(body) = body else {
            panic!("object literal");
        };
        let first = Revision::next(None, &body);
        assert_eq!(first.generation(), 1);
        assert_eq!(first, Revision::next(None, &body));

        let second = Revision::next(Some(&first), &body);
        assert_eq!(second.generation(), 2);
        assert_ne!(first.to_string(), second.to_string());
    }

    #[test]
    fn json_round_trip_strips_couch_metadata() {
        let document = Document::from_json(json!({
            "_id": "tenant_t1",
            "_rev": "1-abc",
            "_deleted": false,
            "type": "tenant",
            "name": "Acme"
        }))
        .expect("valid document");

        assert_eq!(document.id.as_str(), "tenant_t1");
        assert_eq!(document.kind(), Some(DocumentKind::Tenant));
        assert!(!document.body.contains_key("_rev"));
        assert_eq!(document.to_json()["_rev"], json!("1-abc"));
    }

    #[test]
    fn prefix_range_excludes_neighbouring_kinds() {
        let range = KeyRange::prefix(DocumentKind::Gig.id_prefix());
        assert!(range.contains("gig_1700000000000"));
        assert!(range.contains("gig_type_1"));
        assert!(!range.contains("gif_1"));
        assert!(!range.contains("equipment_1"));
    }
}
