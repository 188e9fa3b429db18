//! DTOs for decoding sync-server JSON responses.
//!
//! Adapters decode into these transport DTOs first, then map into port
//! records in one pass.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::ports::{ChangeBatch, ChangeRecord, RemoteInfo};

/// CouchDB sequences are numbers on older servers and `"{n}-{opaque}"`
/// strings on newer ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum SequenceDto {
    Number(u64),
    Text(String),
}

impl SequenceDto {
    pub(super) fn numeric(&self) -> Option<u64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(raw) => raw.split('-').next().and_then(|prefix| prefix.parse().ok()),
        }
    }

    fn opaque(&self) -> Option<(u64, &str)> {
        match self {
            Self::Number(_) => None,
            Self::Text(raw) => self.numeric().map(|sequence| (sequence, raw.as_str())),
        }
    }
}

/// Opaque sequence tokens seen on one feed, keyed by numeric prefix.
///
/// Ports track sequences as numbers; servers that issue opaque tokens only
/// accept those tokens back as `since`.
#[derive(Debug, Default)]
pub(super) struct SinceTokens {
    seen: Mutex<BTreeMap<u64, String>>,
}

impl SinceTokens {
    pub(super) fn remember(&self, response: &ChangesResponseDto) {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let sequences = response
            .results
            .iter()
            .map(|change| &change.seq)
            .chain(response.last_seq.as_ref());
        for (sequence, raw) in sequences.filter_map(SequenceDto::opaque) {
            seen.insert(sequence, raw.to_owned());
        }
    }

    /// Value for the `since` query parameter. Tokens below `since` are
    /// dropped; cursors never move backwards.
    pub(super) fn since_param(&self, since: u64) -> String {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.retain(|sequence, _| *sequence >= since);
        seen.get(&since)
            .cloned()
            .unwrap_or_else(|| since.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ChangesResponseDto {
    #[serde(default)]
    pub(super) results: Vec<ChangeDto>,
    #[serde(default)]
    pub(super) last_seq: Option<SequenceDto>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ChangeDto {
    pub(super) seq: SequenceDto,
    #[serde(default)]
    pub(super) id: Option<String>,
    #[serde(default)]
    pub(super) deleted: bool,
    #[serde(default)]
    pub(super) doc: Option<Map<String, Value>>,
}

impl ChangesResponseDto {
    pub(super) fn into_batch(self) -> Result<ChangeBatch, String> {
        let results = self
            .results
            .into_iter()
            .map(|change| {
                let sequence = change
                    .seq
                    .numeric()
                    .ok_or_else(|| format!("change {:?} has a non-numeric sequence", change.id))?;
                Ok(ChangeRecord {
                    sequence,
                    id: change.id,
                    deleted: change.deleted,
                    doc: change.doc,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;
        Ok(ChangeBatch {
            results,
            last_sequence: self.last_seq.as_ref().and_then(SequenceDto::numeric),
        })
    }
}

/// `/__tenants` answers with a bare array or with `{ docs: [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum TenantListDto {
    Bare(Vec<Value>),
    Wrapped { docs: Vec<Value> },
}

impl TenantListDto {
    pub(super) fn into_records(self) -> Vec<Map<String, Value>> {
        let (Self::Bare(values) | Self::Wrapped { docs: values }) = self;
        values
            .into_iter()
            .filter_map(|value| match value {
                Value::Object(record) => Some(record),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
pub(super) struct ActiveTenantDto<'a> {
    pub(super) active_tenant_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ChooseTenantDto<'a> {
    pub(super) tenant_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub(super) struct DatabaseInfoDto {
    pub(super) db_name: String,
    #[serde(default)]
    pub(super) update_seq: Option<SequenceDto>,
}

impl DatabaseInfoDto {
    pub(super) fn into_info(self) -> RemoteInfo {
        RemoteInfo {
            update_sequence: self.update_seq.as_ref().and_then(SequenceDto::numeric),
            database: self.db_name,
        }
    }
}

#[derive(Debug, Serialize)]
pub(super) struct BulkDocsDto {
    pub(super) docs: Vec<Value>,
    pub(super) new_edits: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct BulkResultDto {
    #[serde(default)]
    pub(super) id: Option<String>,
    #[serde(default)]
    pub(super) error: Option<String>,
    #[serde(default)]
    pub(super) reason: Option<String>,
}

#[cfg(test)]
mod tests {
    //! Decoding coverage for the sync-server response shapes.

    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(r#"[{"id": "t1"}, 3]"#, 1)]
    #[case(r#"{"docs": [{"id": "t1"}, {"id": "t2"}]}"#, 2)]
    fn tenant_list_accepts_both_shapes(#[case] body: &str, #[case] expected: usize) {
        let decoded: TenantListDto = serde_json::from_str(body).expect("decodes");
        assert_eq!(decoded.into_records().len(), expected);
    }

    #[test]
    fn changes_accept_numeric_and_opaque_sequences() {
        let body = r#"{
            "results": [
                { "seq": 4, "id": "tenant_t1", "doc": { "_id": "tenant_t1", "type": "tenant" } },
                { "seq": "7-g1AAAA", "id": "tenant_t2", "deleted": true }
            ],
            "last_seq": "7-g1AAAA"
        }"#;
        let decoded = serde_json::from_str::<ChangesResponseDto>(body).expect("decodes");
        let tokens = SinceTokens::default();
        tokens.remember(&decoded);
        let batch = decoded.into_batch().expect("numeric sequences");

        let sequences: Vec<_> = batch.results.iter().map(|change| change.sequence).collect();
        assert_eq!(sequences, vec![4, 7]);
        assert!(batch.results[1].deleted);
        assert_eq!(batch.last_sequence, Some(7));
        assert_eq!(tokens.since_param(7), "7-g1AAAA");
    }

    #[rstest]
    #[case::start_of_feed(0, "0")]
    #[case::numeric_server(4, "4")]
    fn since_falls_back_to_the_number_without_a_token(#[case] since: u64, #[case] expected: &str) {
        let tokens = SinceTokens::default();
        assert_eq!(tokens.since_param(since), expected);
    }

    #[test]
    fn tokens_behind_the_cursor_are_forgotten() {
        let body = r#"{
            "results": [ { "seq": "3-aaa" }, { "seq": "5-bbb" } ],
            "last_seq": "5-bbb"
        }"#;
        let decoded = serde_json::from_str::<ChangesResponseDto>(body).expect("decodes");
        let tokens = SinceTokens::default();
        tokens.remember(&decoded);

        assert_eq!(tokens.since_param(5), "5-bbb");
        assert_eq!(tokens.since_param(3), "3");
    }

    #[test]
    fn opaque_sequence_without_numeric_prefix_is_rejected() {
        let body = r#"{ "results": [ { "seq": "g1AAAA" } ] }"#;
        let decoded: ChangesResponseDto = serde_json::from_str(body).expect("decodes");
        assert!(decoded.into_batch().is_err());
    }
}
