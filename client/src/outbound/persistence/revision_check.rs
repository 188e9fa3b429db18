//! Revision rules shared by the local store adapters.

use crate::domain::ports::{DocumentStoreError, ReplicatedWrite};
use crate::domain::{Document, DocumentId, Revision};

/// Enforce optimistic concurrency for a local `put`.
pub(crate) fn check_revision(
    id: &DocumentId,
    stored: Option<&Revision>,
    supplied: Option<&Revision>,
) -> Result<(), DocumentStoreError> {
    if stored == supplied {
        Ok(())
    } else {
        Err(DocumentStoreError::conflict(id.as_str()))
    }
}

/// Decide whether a replicated copy replaces the stored one.
pub(crate) fn replicated_revision(
    incoming: &Document,
    stored: Option<&Revision>,
) -> Result<ReplicatedWrite, DocumentStoreError> {
    let Some(revision) = incoming.revision.as_ref() else {
        return Err(DocumentStoreError::serialization(format!(
            "replicated document {} has no revision",
            incoming.id
        )));
    };
    match stored {
        Some(stored) if !revision.wins_over(stored) => Ok(ReplicatedWrite::Superseded),
        _ => Ok(ReplicatedWrite::Applied),
    }
}
