//! Outbound adapters: persistence, the sync-server HTTP surface and identity.

pub mod http;
pub mod identity;
pub mod persistence;
