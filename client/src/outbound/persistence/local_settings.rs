//! Client-local settings that never leave the device.
//!
//! Settings live in their own table and behind their own type. The type does
//! not implement `DocumentStore`, so it cannot be handed to replication or the
//! change-feed pollers.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};
use url::Url;

use crate::domain::TenantId;

use super::sqlite_document_store::{SharedConnection, SqliteDocumentStore};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS local_settings (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    );
";
const SYNC_URL_KEY: &str = "sync_url";
const SELECTED_TENANT_KEY: &str = "selected_tenant";
const APP_OPTIONS_KEY: &str = "app_options";

/// Errors raised by [`LocalSettingsStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocalSettingsError {
    /// SQLite failed.
    #[error("local settings storage failed: {0}")]
    Storage(String),
    /// A stored value could not be decoded.
    #[error("local setting {key} is invalid: {message}")]
    Invalid {
        /// Setting key.
        key: &'static str,
        /// Decoder message.
        message: String,
    },
}

/// Local-only settings partition.
#[derive(Clone)]
pub struct LocalSettingsStore {
    connection: SharedConnection,
}

impl LocalSettingsStore {
    /// Open settings in their own database file.
    ///
    /// # Errors
    ///
    /// [`LocalSettingsError::Storage`] when the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, LocalSettingsError> {
        let connection = Connection::open(path).map_err(map_sqlite_error)?;
        Self::from_shared(Arc::new(Mutex::new(connection)))
    }

    /// In-memory settings, for tests and ephemeral sessions.
    ///
    /// # Errors
    ///
    /// [`LocalSettingsError::Storage`] when SQLite cannot initialise.
    pub fn in_memory() -> Result<Self, LocalSettingsError> {
        let connection = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Self::from_shared(Arc::new(Mutex::new(connection)))
    }

    /// Settings table inside the document store's database file.
    ///
    /// # Errors
    ///
    /// [`LocalSettingsError::Storage`] when the table cannot be created.
    pub fn alongside(store: &SqliteDocumentStore) -> Result<Self, LocalSettingsError> {
        Self::from_shared(store.connection())
    }

    fn from_shared(connection: SharedConnection) -> Result<Self, LocalSettingsError> {
        connection
            .lock()
            .map_err(|_| LocalSettingsError::Storage("settings lock poisoned".to_owned()))?
            .execute_batch(SCHEMA)
            .map_err(map_sqlite_error)?;
        Ok(Self { connection })
    }

    /// Stored sync endpoint URL.
    pub async fn sync_url(&self) -> Result<Option<Url>, LocalSettingsError> {
        self.read(SYNC_URL_KEY)
            .await?
            .map(|raw| {
                Url::parse(&raw).map_err(|error| LocalSettingsError::Invalid {
                    key: SYNC_URL_KEY,
                    message: error.to_string(),
                })
            })
            .transpose()
    }

    /// Remember the sync endpoint URL.
    pub async fn set_sync_url(&self, url: &Url) -> Result<(), LocalSettingsError> {
        self.write(SYNC_URL_KEY, url.as_str().to_owned()).await
    }

    /// Convenience copy of the selected tenant.
    pub async fn selected_tenant(&self) -> Result<Option<TenantId>, LocalSettingsError> {
        self.read(SELECTED_TENANT_KEY)
            .await?
            .map(|raw| {
                TenantId::new(raw).map_err(|error| LocalSettingsError::Invalid {
                    key: SELECTED_TENANT_KEY,
                    message: error.to_string(),
                })
            })
            .transpose()
    }

    /// Remember the selected tenant.
    pub async fn set_selected_tenant(&self, tenant: &TenantId) -> Result<(), LocalSettingsError> {
        self.write(SELECTED_TENANT_KEY, tenant.as_str().to_owned()).await
    }

    /// Free-form application options; empty when never saved.
    pub async fn app_options(&self) -> Result<Map<String, Value>, LocalSettingsError> {
        let Some(raw) = self.read(APP_OPTIONS_KEY).await? else {
            return Ok(Map::new());
        };
        serde_json::from_str(&raw).map_err(|error| LocalSettingsError::Invalid {
            key: APP_OPTIONS_KEY,
            message: error.to_string(),
        })
    }

    /// Replace the application options.
    pub async fn save_app_options(&self, options: &Map<String, Value>) -> Result<(), LocalSettingsError> {
        let encoded = serde_json::to_string(options).map_err(|error| LocalSettingsError::Invalid {
            key: APP_OPTIONS_KEY,
            message: error.to_string(),
        })?;
        self.write(APP_OPTIONS_KEY, encoded).await
    }

    async fn read(&self, key: &'static str) -> Result<Option<String>, LocalSettingsError> {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let guard = connection
                .lock()
                .map_err(|_| LocalSettingsError::Storage("settings lock poisoned".to_owned()))?;
            guard
                .query_row(
                    "SELECT value FROM local_settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_sqlite_error)
        })
        .await
        .map_err(|error| LocalSettingsError::Storage(error.to_string()))?
    }

    async fn write(&self, key: &'static str, value: String) -> Result<(), LocalSettingsError> {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let guard = connection
                .lock()
                .map_err(|_| LocalSettingsError::Storage("settings lock poisoned".to_owned()))?;
            guard
                .execute(
                    "INSERT INTO local_settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )
                .map_err(map_sqlite_error)?;
            Ok(())
        })
        .await
        .map_err(|error| LocalSettingsError::Storage(error.to_string()))?
    }
}

fn map_sqlite_error(error: rusqlite::Error) -> LocalSettingsError {
    LocalSettingsError::Storage(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn settings_round_trip_and_default_to_empty() {
        let settings = LocalSettingsStore::in_memory().expect("settings open");
        assert_eq!(settings.sync_url().await.expect("read"), None);
        assert!(settings.app_options().await.expect("read").is_empty());

        let url = Url::parse("https://sync.example.test").expect("url");
        settings.set_sync_url(&url).await.expect("write");
        settings
            .set_selected_tenant(&TenantId::new("tenant_t2").expect("id"))
            .await
            .expect("write");

        assert_eq!(settings.sync_url().await.expect("read"), Some(url));
        assert_eq!(
            settings.selected_tenant().await.expect("read"),
            Some(TenantId::new("t2").expect("id"))
        );

        let Value::Object(options) = json!({ "theme": "dark" }) else {
            panic!("object literal");
        };
        settings.save_app_options(&options).await.expect("write");
        assert_eq!(settings.app_options().await.expect("read"), options);
    }
}
