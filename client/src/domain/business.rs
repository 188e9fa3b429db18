//! Tenant-scoped reads over business documents.
//!
//! Every read takes a [`TenantScope`]; documents owned by another tenant are
//! invisible, including through direct lookups.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::document::{
    DELETED_AT_FIELD, Document, DocumentId, DocumentKind, KeyRange, RangeScan,
};
use super::ports::DocumentStore;
use super::tenant::TenantId;
use super::Error;

/// Field naming the owning tenant of a business document.
pub const TENANT_FIELD: &str = "tenant";
/// Key of the per-band information sheet.
pub const BAND_INFO_ID: &str = "band-info";

/// Binds reads to one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    tenant: TenantId,
}

impl TenantScope {
    /// Scope reads to `tenant`.
    pub fn new(tenant: TenantId) -> Self {
        Self { tenant }
    }

    /// Scoped tenant.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Whether `document` belongs to this scope.
    pub fn owns(&self, document: &Document) -> bool {
        document
            .body
            .get(TENANT_FIELD)
            .and_then(Value::as_str)
            .is_some_and(|owner| self.tenant.matches(owner))
    }
}

/// One equipment line of a gig type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentEntry {
    /// Equipment document key.
    pub equipment_id: String,
    /// Units needed.
    pub quantity: u32,
}

/// Equipment list of a gig type in either stored shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GigTypeEquipment {
    /// Older documents list each equipment id once (`equipmentIds`).
    Legacy(Vec<String>),
    /// Current documents carry quantities (`equipment`).
    Quantified(Vec<EquipmentEntry>),
}

impl GigTypeEquipment {
    /// Read whichever shape the body carries; `equipment` wins over
    /// `equipmentIds` when both are present.
    pub fn from_body(body: &Map<String, Value>) -> Self {
        if let Some(entries) = body.get("equipment").and_then(Value::as_array) {
            return Self::Quantified(
                entries
                    .iter()
                    .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                    .collect(),
            );
        }
        let ids = body
            .get("equipmentIds")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Self::Legacy(ids)
    }

    /// Normalise to quantified entries; legacy ids count once each.
    pub fn normalise(self) -> Vec<EquipmentEntry> {
        match self {
            Self::Quantified(entries) => entries,
            Self::Legacy(ids) => ids
                .into_iter()
                .map(|equipment_id| EquipmentEntry {
                    equipment_id,
                    quantity: 1,
                })
                .collect(),
        }
    }
}

/// One numbered line of a gig load-in or load-out checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistItem {
    /// Equipment document key.
    pub equipment_id: String,
    /// 1-based unit number within the equipment line.
    pub item_number: u32,
    /// Whether the unit has been ticked off.
    pub checked: bool,
}

/// Expand equipment entries into one unchecked item per unit.
///
/// # Examples
/// ```
/// use client::domain::{EquipmentEntry, expand_checklist};
///
/// let items = expand_checklist(&[EquipmentEntry { equipment_id: "amp".into(), quantity: 2 }]);
/// assert_eq!(items.len(), 2);
/// assert_eq!(items[1].item_number, 2);
/// ```
pub fn expand_checklist(entries: &[EquipmentEntry]) -> Vec<ChecklistItem> {
    entries
        .iter()
        .flat_map(|entry| {
            (1..=entry.quantity).map(|item_number| ChecklistItem {
                equipment_id: entry.equipment_id.clone(),
                item_number,
                checked: false,
            })
        })
        .collect()
}

/// A gig type with its equipment already normalised.
#[derive(Debug, Clone, PartialEq)]
pub struct GigType {
    /// Underlying document.
    pub document: Document,
    /// Quantified equipment lines.
    pub equipment: Vec<EquipmentEntry>,
}

impl GigType {
    /// Read a gig type document, normalising legacy equipment once.
    pub fn from_document(document: Document) -> Self {
        let equipment = GigTypeEquipment::from_body(&document.body).normalise();
        Self {
            document,
            equipment,
        }
    }

    /// Checklist for a new gig of this type.
    pub fn checklist(&self) -> Vec<ChecklistItem> {
        expand_checklist(&self.equipment)
    }
}

/// Read-side access to tenant-owned business documents.
#[derive(Clone)]
pub struct BusinessDocuments {
    store: Arc<dyn DocumentStore>,
}

impl BusinessDocuments {
    /// Wrap the shared local store.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Live documents of `kind` owned by the scope. Gigs come soonest first.
    pub async fn list(
        &self,
        scope: &TenantScope,
        kind: DocumentKind,
    ) -> Result<Vec<Document>, Error> {
        let mut documents = self.scan_owned(scope, kind, false).await?;
        if kind == DocumentKind::Gig {
            documents.sort_by(|a, b| compare_text_field(a, b, "date"));
        }
        Ok(documents)
    }

    /// Soft-deleted documents of `kind`, oldest deletion first.
    pub async fn list_deleted(
        &self,
        scope: &TenantScope,
        kind: DocumentKind,
    ) -> Result<Vec<Document>, Error> {
        let mut documents = self.scan_owned(scope, kind, true).await?;
        documents.sort_by(|a, b| compare_text_field(a, b, DELETED_AT_FIELD));
        Ok(documents)
    }

    /// Live gig types with normalised equipment.
    pub async fn gig_types(&self, scope: &TenantScope) -> Result<Vec<GigType>, Error> {
        let documents = self.list(scope, DocumentKind::GigType).await?;
        Ok(documents.into_iter().map(GigType::from_document).collect())
    }

    /// Fetch one document; another tenant's document reads as not found.
    pub async fn get(&self, scope: &TenantScope, id: &DocumentId) -> Result<Document, Error> {
        let document = self.store.get(id).await?;
        if scope.owns(&document) {
            Ok(document)
        } else {
            Err(Error::not_found(format!("document {id} not found")))
        }
    }

    /// The band information sheet, when one exists for the scope.
    pub async fn band_info(&self, scope: &TenantScope) -> Result<Option<Document>, Error> {
        let id = DocumentId::with_prefix(BAND_INFO_ID, "");
        match self.get(scope, &id).await {
            Ok(document) => Ok(Some(document)),
            Err(error) if error.code() == super::ErrorCode::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn scan_owned(
        &self,
        scope: &TenantScope,
        kind: DocumentKind,
        deleted: bool,
    ) -> Result<Vec<Document>, Error> {
        let range = KeyRange::prefix(kind.id_prefix());
        let documents = RangeScan::new(self.store.as_ref(), range)
            .collect()
            .await?;
        Ok(documents
            .into_iter()
            .filter(|document| {
                document.kind() == Some(kind)
                    && scope.owns(document)
                    && document.is_soft_deleted() == deleted
            })
            .collect())
    }
}

fn compare_text_field(a: &Document, b: &Document, field: &str) -> Ordering {
    let left = a.body.get(field).and_then(Value::as_str);
    let right = b.body.get(field).and_then(Value::as_str);
    left.cmp(&right)
}

#[cfg(test)]
mod tests {
    //! Unit coverage for tenant scoping and equipment normalisation.

    use super::*;
    use crate::outbound::persistence::MemoryDocumentStore;
    use rstest::{fixture, rstest};
    use serde_json::json;

    fn document(value: Value) -> Document {
        Document::from_json(value).expect("valid document")
    }

    #[fixture]
    fn scope() -> TenantScope {
        TenantScope::new(TenantId::new("t1").expect("valid id"))
    }

    async fn seeded_store() -> Arc<dyn DocumentStore> {
        let store = MemoryDocumentStore::new();
        for value in [
            json!({ "_id": "gig_2", "type": "gig", "tenant": "t1", "date": "2026-06-02" }),
            json!({ "_id": "gig_1", "type": "gig", "tenant": "tenant_t1", "date": "2026-05-01" }),
            json!({ "_id": "gig_3", "type": "gig", "tenant": "t2", "date": "2026-04-01" }),
            json!({ "_id": "gig_4", "type": "gig", "tenant": "t1", "deletedAt": "2026-03-02T00:00:00.000Z" }),
            json!({ "_id": "gig_5", "type": "gig", "tenant": "t1", "deletedAt": "2026-03-01T00:00:00.000Z" }),
            json!({ "_id": "gig_type_1", "type": "gig_type", "tenant": "t1", "equipmentIds": ["amp", "drum"] }),
            json!({ "_id": "band-info", "type": "band-info", "tenant": "t2", "name": "Other" }),
        ] {
            store.put(&document(value)).await.expect("seed write");
        }
        Arc::new(store)
    }

    #[rstest]
    #[tokio::test]
    async fn lists_only_live_documents_of_the_scope_sorted_by_date(scope: TenantScope) {
        let documents = BusinessDocuments::new(seeded_store().await);
        let gigs = documents
            .list(&scope, DocumentKind::Gig)
            .await
            .expect("list succeeds");
        let ids: Vec<_> = gigs.iter().map(|gig| gig.id.as_str()).collect();
        assert_eq!(ids, vec!["gig_1", "gig_2"]);
    }

    #[rstest]
    #[tokio::test]
    async fn deleted_list_is_ordered_by_deletion_time(scope: TenantScope) {
        let documents = BusinessDocuments::new(seeded_store().await);
        let deleted = documents
            .list_deleted(&scope, DocumentKind::Gig)
            .await
            .expect("list succeeds");
        let ids: Vec<_> = deleted.iter().map(|gig| gig.id.as_str()).collect();
        assert_eq!(ids, vec!["gig_5", "gig_4"]);
    }

    #[rstest]
    #[tokio::test]
    async fn other_tenants_documents_read_as_not_found(scope: TenantScope) {
        let documents = BusinessDocuments::new(seeded_store().await);
        let id = DocumentId::new("gig_3").expect("valid id");
        let error = documents.get(&scope, &id).await.expect_err("hidden");
        assert_eq!(error.code(), crate::domain::ErrorCode::NotFound);
        assert_eq!(documents.band_info(&scope).await.expect("lookup"), None);
    }

    #[rstest]
    #[tokio::test]
    async fn legacy_gig_types_are_normalised_on_read(scope: TenantScope) {
        let documents = BusinessDocuments::new(seeded_store().await);
        let gig_types = documents.gig_types(&scope).await.expect("list succeeds");
        let [gig_type] = gig_types.as_slice() else {
            panic!("expected one gig type, got {}", gig_types.len());
        };
        assert_eq!(gig_type.equipment.len(), 2);
        assert!(gig_type.equipment.iter().all(|entry| entry.quantity == 1));
    }

    #[test]
    fn quantified_equipment_expands_into_numbered_items() {
        let Value::Object(body) = json!({
            "equipment": [
                { "equipmentId": "amp", "quantity": 2 },
                { "equipmentId": "mic", "quantity": 1 }
            ],
            "equipmentIds": ["ignored"]
        }) else {
            panic!("object literal");
        };
        let entries = GigTypeEquipment::from_body(&body).normalise();
        let items = expand_checklist(&entries);
        let numbered: Vec<_> = items
            .iter()
            .map(|item| (item.equipment_id.as_str(), item.item_number, item.checked))
            .collect();
        assert_eq!(
            numbered,
            vec![("amp", 1, false), ("amp", 2, false), ("mic", 1, false)]
        );
    }
}
