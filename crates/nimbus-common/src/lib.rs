//! Shared domain types for the Nimbus cluster lifecycle orchestrator.
//!
//! These types are persisted by the record store, exchanged over the HTTP API
//! and handed to provider adapters, so they live apart from the service crate.

pub mod cloud;
pub mod credentials;
pub mod record;
pub mod status;

pub use cloud::CloudKind;
pub use credentials::ProviderCredentials;
pub use record::{ClusterKey, ClusterRecord, NewCluster};
pub use status::ClusterStatus;
