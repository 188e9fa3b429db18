//! Read-modify-write against the local store with conflict retry.

use serde_json::{Map, Value};

use super::document::{Document, DocumentId, Revision};
use super::ports::{DocumentStore, DocumentStoreError, find_document};
use super::retry::{Attempt, RetryError, RetryPolicy, Sleeper, retry_with_policy};

/// Result of [`upsert_document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UpsertOutcome {
    /// A new revision was stored.
    Written(Revision),
    /// The builder found nothing to change.
    Unchanged,
    /// Every attempt lost to a concurrent writer; its version stands.
    Abandoned,
}

/// Re-read `id`, let `build` derive the new body from the latest stored
/// document, and write it with the stored revision. Conflicts re-run the
/// whole cycle up to the policy's attempt budget.
///
/// `build` returns `None` when the stored document needs no change.
pub(crate) async fn upsert_document<F>(
    store: &dyn DocumentStore,
    id: &DocumentId,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    build: F,
) -> Result<UpsertOutcome, DocumentStoreError>
where
    F: Fn(Option<&Document>) -> Option<Map<String, Value>>,
{
    let build = &build;
    let result = retry_with_policy(policy, sleeper, |attempt| async move {
        let current = match find_document(store, id).await {
            Ok(current) => current,
            Err(error) => return Attempt::Abort(error),
        };
        let Some(body) = build(current.as_ref()) else {
            return Attempt::Done(UpsertOutcome::Unchanged);
        };
        let revision = current.and_then(|document| document.revision);
        let document = Document::new(id.clone(), body).with_revision(revision);
        match store.put(&document).await {
            Ok(revision) => Attempt::Done(UpsertOutcome::Written(revision)),
            Err(error @ DocumentStoreError::Conflict { .. }) => {
                tracing::debug!(document_id = %id, attempt, "write conflict; re-reading");
                Attempt::Retry(error)
            }
            Err(error) => Attempt::Abort(error),
        }
    })
    .await;

    match result {
        Ok(outcome) => Ok(outcome),
        Err(RetryError::Exhausted { attempts, .. }) => {
            tracing::warn!(
                document_id = %id,
                attempts,
                "abandoning write in favour of concurrent writer"
            );
            Ok(UpsertOutcome::Abandoned)
        }
        Err(RetryError::Aborted(error)) => Err(error),
    }
}
