//! Shared configuration, identity and data model for the TruthGate edge
//! gateway.
//!
//! Everything in this crate is plain state: the [TruthGateConfig] tree that
//! the rest of the system reads through a [ConfigHandle], the [EdgeDomain]
//! records that map hosts to MFS folders, the cookie/session and key
//! machinery in [auth], and the passphrase-sealed box used by the backup
//! format.

#[macro_use]
extern crate tracing;

pub mod auth;
pub mod backup;
pub mod config;
pub mod domain;
pub mod sealed;
pub mod tracing_helpers;

pub use auth::{RotatingKey, SessionStore};
pub use backup::DomainBackup;
pub use config::{ConfigHandle, ConfigStore, RateLimitConfig, TruthGateConfig};
pub use domain::EdgeDomain;
