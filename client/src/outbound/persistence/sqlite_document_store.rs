//! SQLite-backed document store.
//!
//! All partitions share one table keyed by `(partition, id)`. Each row keeps
//! the latest revision and the partition-wide sequence of its last write, so
//! the journal needed for replication is a plain ordered query.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::{Map, Value};

use crate::domain::ports::{DocumentStore, DocumentStoreError, LocalChange, ReplicatedWrite};
use crate::domain::{Document, DocumentId, KeyRange, Revision};

use super::revision_check::{check_revision, replicated_revision};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        partition TEXT NOT NULL,
        id TEXT NOT NULL,
        rev TEXT NOT NULL,
        seq INTEGER NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (partition, id)
    );
    CREATE INDEX IF NOT EXISTS documents_by_seq ON documents (partition, seq);
";

/// Shared handle; `rusqlite::Connection` is not `Sync`.
pub(crate) type SharedConnection = Arc<Mutex<Connection>>;

/// Document store persisted in one SQLite file, scoped to one partition.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    connection: SharedConnection,
    partition: String,
}

impl SqliteDocumentStore {
    /// Open (or create) the database file and bind to `partition`.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::Storage`] when the file cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: &Path, partition: &str) -> Result<Self, DocumentStoreError> {
        let connection = Connection::open(path).map_err(map_sqlite_error)?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .map_err(map_sqlite_error)?;
        Self::with_connection(connection, partition)
    }

    /// Private in-memory database, mainly for tests.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::Storage`] when SQLite cannot initialise.
    pub fn open_in_memory(partition: &str) -> Result<Self, DocumentStoreError> {
        let connection = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Self::with_connection(connection, partition)
    }

    fn with_connection(connection: Connection, partition: &str) -> Result<Self, DocumentStoreError> {
        connection.execute_batch(SCHEMA).map_err(map_sqlite_error)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            partition: partition.to_owned(),
        })
    }

    /// Another partition over the same database connection.
    #[must_use]
    pub fn partition(&self, partition: &str) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
            partition: partition.to_owned(),
        }
    }

    /// Connection handle, shared with the local settings table.
    pub(crate) fn connection(&self) -> SharedConnection {
        Arc::clone(&self.connection)
    }

    async fn run<T, F>(&self, operation: F) -> Result<T, DocumentStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T, DocumentStoreError> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        let partition = self.partition.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = connection
                .lock()
                .map_err(|_| DocumentStoreError::storage("sqlite connection lock poisoned"))?;
            operation(&mut guard, &partition)
        })
        .await
        .map_err(|error| DocumentStoreError::storage(format!("sqlite task failed: {error}")))?
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get(&self, id: &DocumentId) -> Result<Document, DocumentStoreError> {
        let id = id.clone();
        self.run(move |connection, partition| {
            connection
                .query_row(
                    "SELECT id, rev, body FROM documents WHERE partition = ?1 AND id = ?2",
                    params![partition, id.as_str()],
                    read_row,
                )
                .optional()
                .map_err(map_sqlite_error)?
                .ok_or_else(|| DocumentStoreError::not_found(id.as_str()))?
        })
        .await
    }

    async fn put(&self, document: &Document) -> Result<Revision, DocumentStoreError> {
        let document = document.clone();
        self.run(move |connection, partition| {
            let transaction = connection.transaction().map_err(map_sqlite_error)?;
            let stored = stored_revision(&transaction, partition, &document.id)?;
            check_revision(&document.id, stored.as_ref(), document.revision.as_ref())?;
            let revision = Revision::next(stored.as_ref(), &document.body);
            write_row(&transaction, partition, &document.id, &revision, &document.body)?;
            transaction.commit().map_err(map_sqlite_error)?;
            Ok(revision)
        })
        .await
    }

    async fn scan_page(
        &self,
        range: &KeyRange,
        after: Option<&DocumentId>,
        limit: usize,
    ) -> Result<Vec<Document>, DocumentStoreError> {
        let range = range.clone();
        let after = after.map(|id| id.as_str().to_owned()).unwrap_or_default();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |connection, partition| {
            let mut statement = connection
                .prepare_cached(
                    "SELECT id, rev, body FROM documents
                     WHERE partition = ?1 AND id >= ?2 AND id < ?3 AND id > ?4
                     ORDER BY id LIMIT ?5",
                )
                .map_err(map_sqlite_error)?;
            let rows = statement
                .query_map(
                    params![partition, range.start(), range.end(), after, limit],
                    read_row,
                )
                .map_err(map_sqlite_error)?;
            let mut documents = Vec::new();
            for row in rows {
                documents.push(row.map_err(map_sqlite_error)??);
            }
            Ok(documents)
        })
        .await
    }

    async fn changes_since(
        &self,
        sequence: u64,
        limit: usize,
    ) -> Result<Vec<LocalChange>, DocumentStoreError> {
        let since = i64::try_from(sequence).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |connection, partition| {
            let mut statement = connection
                .prepare_cached(
                    "SELECT id, rev, body, seq FROM documents
                     WHERE partition = ?1 AND seq > ?2
                     ORDER BY seq LIMIT ?3",
                )
                .map_err(map_sqlite_error)?;
            let rows = statement
                .query_map(params![partition, since, limit], |row| {
                    let sequence: i64 = row.get(3)?;
                    Ok((read_row(row)?, sequence))
                })
                .map_err(map_sqlite_error)?;
            let mut changes = Vec::new();
            for row in rows {
                let (document, sequence) = row.map_err(map_sqlite_error)?;
                changes.push(LocalChange {
                    sequence: u64::try_from(sequence).map_err(|_| {
                        DocumentStoreError::serialization("negative sequence in journal")
                    })?,
                    document: document?,
                });
            }
            Ok(changes)
        })
        .await
    }

    async fn apply_replicated(
        &self,
        document: &Document,
    ) -> Result<ReplicatedWrite, DocumentStoreError> {
        let document = document.clone();
        self.run(move |connection, partition| {
            let transaction = connection.transaction().map_err(map_sqlite_error)?;
            let stored = stored_revision(&transaction, partition, &document.id)?;
            let outcome = replicated_revision(&document, stored.as_ref())?;
            if let (ReplicatedWrite::Applied, Some(revision)) = (outcome, document.revision.as_ref())
            {
                write_row(&transaction, partition, &document.id, revision, &document.body)?;
            }
            transaction.commit().map_err(map_sqlite_error)?;
            Ok(outcome)
        })
        .await
    }
}

fn stored_revision(
    connection: &Connection,
    partition: &str,
    id: &DocumentId,
) -> Result<Option<Revision>, DocumentStoreError> {
    let raw: Option<String> = connection
        .query_row(
            "SELECT rev FROM documents WHERE partition = ?1 AND id = ?2",
            params![partition, id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_sqlite_error)?;
    raw.map(|raw| Revision::parse(&raw).map_err(|error| DocumentStoreError::serialization(error.to_string())))
        .transpose()
}

fn write_row(
    connection: &Connection,
    partition: &str,
    id: &DocumentId,
    revision: &Revision,
    body: &Map<String, Value>,
) -> Result<(), DocumentStoreError> {
    let encoded = serde_json::to_string(body)
        .map_err(|error| DocumentStoreError::serialization(error.to_string()))?;
    let next_sequence: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM documents WHERE partition = ?1",
            params![partition],
            |row| row.get(0),
        )
        .map_err(map_sqlite_error)?;
    connection
        .execute(
            "INSERT INTO documents (partition, id, rev, seq, body)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (partition, id)
             DO UPDATE SET rev = excluded.rev, seq = excluded.seq, body = excluded.body",
            params![partition, id.as_str(), revision.to_string(), next_sequence, encoded],
        )
        .map_err(map_sqlite_error)?;
    Ok(())
}

type DecodedRow = Result<Document, DocumentStoreError>;

fn read_row(row: &Row<'_>) -> rusqlite::Result<DecodedRow> {
    let id: String = row.get(0)?;
    let rev: String = row.get(1)?;
    let body: String = row.get(2)?;
    Ok(decode_document(id, &rev, &body))
}

fn decode_document(id: String, rev: &str, body: &str) -> DecodedRow {
    let serialization = |error: &dyn std::fmt::Display| {
        DocumentStoreError::serialization(format!("stored document {id}: {error}"))
    };
    let revision = Revision::parse(rev).map_err(|error| serialization(&error))?;
    let body: Map<String, Value> = serde_json::from_str(body).map_err(|error| serialization(&error))?;
    let id = DocumentId::new(id.clone()).map_err(|error| serialization(&error))?;
    Ok(Document::new(id, body).with_revision(Some(revision)))
}

fn map_sqlite_error(error: rusqlite::Error) -> DocumentStoreError {
    DocumentStoreError::storage(error.to_string())
}
