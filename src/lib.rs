//! Cluster agent - node admission for self-hosted Kubernetes clusters
//!
//! The agent runs on every node and answers join requests from nodes that
//! want to become part of the cluster. It validates one-time admission
//! tokens, hands out credentials and configuration, and on HA clusters
//! drives the consensus store through the bootstrap transition when the
//! first peer arrives.
//!
//! # Modules
//!
//! - [`token`] - admission, certificate-request and callback token files
//! - [`join`] - legacy (`v1`) and HA (`v2`) join coordinators
//! - [`membership`] - consensus store membership and the bootstrap rebind
//! - [`issuer`] - credential bundles and certificate signing gate
//! - [`pki`] - CA-backed CSR signing
//! - [`args`] - service argument file mutation
//! - [`configure`] - service and addon changes pushed by peers
//! - [`upgrade`] - node side of staged upgrades
//! - [`server`] - HTTPS API with deadline and access-log middleware
//! - [`config`] - state file locations, cluster mode and service topology
//! - [`error`] - error types for the agent

#![deny(missing_docs)]

pub mod args;
pub mod cni;
pub mod config;
pub mod configure;
pub mod error;
pub mod exec;
pub mod issuer;
pub mod join;
pub mod kubectl;
pub mod lock;
pub mod membership;
pub mod pki;
pub mod server;
pub mod services;
pub mod token;
pub mod upgrade;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default listen address of the agent API
pub const DEFAULT_BIND: &str = "0.0.0.0:25000";

/// Default per-request deadline, in seconds
///
/// Generous enough to cover the consensus store restart during the first HA
/// join.
pub const DEFAULT_TIMEOUT_SECS: u64 = 240;
