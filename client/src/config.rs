//! Client configuration loaded via OrthoConfig.
//!
//! Values come from CLI flags, `ROADY_*` environment variables and config
//! files. Accessors fall back to defaults so an empty environment yields a
//! working local setup.

use std::path::PathBuf;
use std::time::Duration;

use ortho_config::OrthoConfig;
use reqwest::Url;
use serde::Deserialize;

use crate::domain::change_feed::DEFAULT_POLL_INTERVAL;
use crate::domain::identity_binding::{
    DEFAULT_TOKEN_REFRESH_ATTEMPTS, DEFAULT_TOKEN_REFRESH_DELAY,
};
use crate::domain::tenant_registry::DEFAULT_TENANT_FETCH_TIMEOUT;
use crate::domain::{
    IdentityBindingConfig, OrchestratorConfig, ReplicationConfig, RetryPolicy,
    TenantRegistryConfig,
};

const DEFAULT_REMOTE_BASE_URL: &str = "http://localhost:5985";
const DEFAULT_DATABASE_NAME: &str = "roady";
const DEFAULT_DATA_DIR: &str = ".roady";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DATABASE_FILE: &str = "roady.sqlite3";
const TOKEN_FILE: &str = "identity_token";

/// Errors raised while interpreting loaded settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The remote base URL does not parse.
    #[error("invalid remote base URL {value}: {source}")]
    InvalidRemoteUrl {
        /// Configured value.
        value: String,
        /// Parser failure.
        #[source]
        source: url::ParseError,
    },
    /// A zero value was given where at least one is required.
    #[error("{field} must be greater than zero")]
    Zero {
        /// Offending setting.
        field: &'static str,
    },
}

/// Configuration for the sync client binary.
#[derive(Debug, Clone, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "ROADY")]
pub struct ClientSettings {
    /// Base URL of the sync server.
    pub remote_base_url: Option<String>,
    /// Remote business database name.
    pub database_name: Option<String>,
    /// Directory holding the local database and token file.
    pub data_dir: Option<PathBuf>,
    /// Change-feed poll interval in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Upper bound for one tenant directory fetch, in seconds.
    pub tenant_fetch_timeout_secs: Option<u64>,
    /// Token reissues attempted while waiting for a tenant claim.
    pub token_refresh_attempts: Option<u32>,
    /// Pause between token reissues in milliseconds.
    pub token_refresh_delay_ms: Option<u64>,
    /// Assume the remote database exists instead of creating it.
    #[ortho_config(default = true)]
    pub skip_remote_setup: bool,
    /// Refresh the tenant directory before selecting a tenant.
    #[ortho_config(default = true)]
    pub refresh_tenants_on_startup: bool,
    /// Signed token to use instead of the token file.
    pub identity_token: Option<String>,
    /// Run live replication of business documents once a tenant is ready.
    #[ortho_config(default = true)]
    pub replicate: bool,
}

impl ClientSettings {
    /// Parsed remote base URL.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::InvalidRemoteUrl`] when the value does not
    /// parse.
    pub fn remote_base_url(&self) -> Result<Url, SettingsError> {
        let value = self
            .remote_base_url
            .as_deref()
            .unwrap_or(DEFAULT_REMOTE_BASE_URL);
        Url::parse(value).map_err(|source| SettingsError::InvalidRemoteUrl {
            value: value.to_owned(),
            source,
        })
    }

    /// Remote database name, falling back to the default.
    pub fn database_name(&self) -> &str {
        self.database_name
            .as_deref()
            .unwrap_or(DEFAULT_DATABASE_NAME)
    }

    /// Data directory, falling back to `.roady` in the working directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    /// SQLite file inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(DATABASE_FILE)
    }

    /// Token file read when no static token is configured.
    pub fn token_path(&self) -> PathBuf {
        self.data_dir().join(TOKEN_FILE)
    }

    /// Per-request timeout for the HTTP transport.
    pub fn request_timeout(&self) -> Duration {
        DEFAULT_REQUEST_TIMEOUT.max(self.tenant_fetch_timeout())
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval_ms
            .map_or(DEFAULT_POLL_INTERVAL, Duration::from_millis)
    }

    fn tenant_fetch_timeout(&self) -> Duration {
        self.tenant_fetch_timeout_secs
            .map_or(DEFAULT_TENANT_FETCH_TIMEOUT, Duration::from_secs)
    }

    /// Identity binding tunables.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Zero`] when the refresh attempt budget is zero.
    pub fn identity_binding(&self) -> Result<IdentityBindingConfig, SettingsError> {
        let attempts = self
            .token_refresh_attempts
            .unwrap_or(DEFAULT_TOKEN_REFRESH_ATTEMPTS);
        if attempts == 0 {
            return Err(SettingsError::Zero {
                field: "token_refresh_attempts",
            });
        }
        let delay = self
            .token_refresh_delay_ms
            .map_or(DEFAULT_TOKEN_REFRESH_DELAY, Duration::from_millis);
        Ok(IdentityBindingConfig {
            token_refresh: RetryPolicy::fixed(attempts, delay),
            ..IdentityBindingConfig::default()
        })
    }

    /// Tenant registry tunables.
    pub fn tenant_registry(&self) -> TenantRegistryConfig {
        TenantRegistryConfig {
            fetch_timeout: self.tenant_fetch_timeout(),
            ..TenantRegistryConfig::default()
        }
    }

    /// Orchestrator tunables.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Zero`] when the poll interval is zero.
    pub fn orchestrator(&self) -> Result<OrchestratorConfig, SettingsError> {
        let poll_interval = self.poll_interval();
        if poll_interval.is_zero() {
            return Err(SettingsError::Zero {
                field: "poll_interval_ms",
            });
        }
        Ok(OrchestratorConfig {
            refresh_tenants_on_startup: self.refresh_tenants_on_startup,
            poll_interval,
        })
    }

    /// Replication tunables; live cycles share the poll interval.
    pub fn replication(&self) -> ReplicationConfig {
        ReplicationConfig {
            live_interval: self.poll_interval(),
            ..ReplicationConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for client configuration parsing.

    use super::*;
    use std::ffi::OsString;

    use env_lock::lock_env;
    use rstest::rstest;

    const VARS: [&str; 11] = [
        "ROADY_REMOTE_BASE_URL",
        "ROADY_DATABASE_NAME",
        "ROADY_DATA_DIR",
        "ROADY_POLL_INTERVAL_MS",
        "ROADY_TENANT_FETCH_TIMEOUT_SECS",
        "ROADY_TOKEN_REFRESH_ATTEMPTS",
        "ROADY_TOKEN_REFRESH_DELAY_MS",
        "ROADY_SKIP_REMOTE_SETUP",
        "ROADY_REFRESH_TENANTS_ON_STARTUP",
        "ROADY_IDENTITY_TOKEN",
        "ROADY_REPLICATE",
    ];

    fn load_from_empty_args() -> ClientSettings {
        ClientSettings::load_from_iter([OsString::from("roady-sync")]).expect("config should load")
    }

    fn env_with(overrides: &[(&str, &str)]) -> Vec<(&'static str, Option<String>)> {
        VARS.iter()
            .map(|name| {
                let value = overrides
                    .iter()
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| (*value).to_owned());
                (*name, value)
            })
            .collect()
    }

    #[rstest]
    fn default_values_are_used_when_missing() {
        let _guard = lock_env(env_with(&[]));

        let settings = load_from_empty_args();

        assert_eq!(
            settings.remote_base_url().expect("default parses").as_str(),
            "http://localhost:5985/"
        );
        assert_eq!(settings.database_name(), DEFAULT_DATABASE_NAME);
        assert_eq!(settings.database_path(), PathBuf::from(".roady/roady.sqlite3"));
        assert!(settings.skip_remote_setup);
        assert!(settings.refresh_tenants_on_startup);
        assert!(settings.replicate);
        assert!(settings.identity_token.is_none());
        assert_eq!(
            settings.identity_binding().expect("valid"),
            IdentityBindingConfig::default()
        );
        assert_eq!(
            settings.orchestrator().expect("valid"),
            OrchestratorConfig::default()
        );
        assert_eq!(settings.tenant_registry(), TenantRegistryConfig::default());
    }

    #[rstest]
    fn environment_overrides_are_respected() {
        let _guard = lock_env(env_with(&[
            ("ROADY_REMOTE_BASE_URL", "https://sync.example.test/db/"),
            ("ROADY_DATABASE_NAME", "roady_staging"),
            ("ROADY_DATA_DIR", "/tmp/roady"),
            ("ROADY_POLL_INTERVAL_MS", "250"),
            ("ROADY_TENANT_FETCH_TIMEOUT_SECS", "3"),
            ("ROADY_TOKEN_REFRESH_ATTEMPTS", "2"),
            ("ROADY_TOKEN_REFRESH_DELAY_MS", "10"),
            ("ROADY_SKIP_REMOTE_SETUP", "false"),
            ("ROADY_REPLICATE", "false"),
        ]));

        let settings = load_from_empty_args();

        assert_eq!(
            settings.remote_base_url().expect("parses").host_str(),
            Some("sync.example.test")
        );
        assert_eq!(settings.database_name(), "roady_staging");
        assert_eq!(settings.token_path(), PathBuf::from("/tmp/roady/identity_token"));
        assert!(!settings.skip_remote_setup);
        assert!(!settings.replicate);
        let orchestrator = settings.orchestrator().expect("valid");
        assert_eq!(orchestrator.poll_interval, Duration::from_millis(250));
        assert_eq!(
            settings.tenant_registry().fetch_timeout,
            Duration::from_secs(3)
        );
        assert_eq!(
            settings.identity_binding().expect("valid").token_refresh,
            RetryPolicy::fixed(2, Duration::from_millis(10))
        );
        assert_eq!(
            settings.replication().live_interval,
            Duration::from_millis(250)
        );
    }

    #[rstest]
    #[case("ROADY_TOKEN_REFRESH_ATTEMPTS", "token_refresh_attempts")]
    #[case("ROADY_POLL_INTERVAL_MS", "poll_interval_ms")]
    fn zero_values_are_rejected(#[case] var: &'static str, #[case] field: &str) {
        let _guard = lock_env(env_with(&[(var, "0")]));

        let settings = load_from_empty_args();
        let error = settings
            .identity_binding()
            .err()
            .or_else(|| settings.orchestrator().err())
            .expect("zero is rejected");

        assert!(matches!(error, SettingsError::Zero { field: f } if f == field));
    }

    #[rstest]
    fn unparseable_url_is_reported() {
        let _guard = lock_env(env_with(&[("ROADY_REMOTE_BASE_URL", "not a url")]));

        let error = load_from_empty_args()
            .remote_base_url()
            .expect_err("invalid URL");

        assert!(matches!(error, SettingsError::InvalidRemoteUrl { .. }));
    }
}
