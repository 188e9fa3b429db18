//! Roady sync client library.
//!
//! Binds a signed-in identity to one tenant, caches the tenant directory and
//! user profile locally, and keeps business documents in step with the sync
//! server while tolerating offline periods.

pub mod config;
pub mod domain;
pub mod outbound;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use config::{ClientSettings, SettingsError};
