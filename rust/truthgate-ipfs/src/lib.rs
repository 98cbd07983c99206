//! A typed HTTP client for the content node's local RPC API
//! (<https://docs.ipfs.tech/reference/kubo/rpc/>), normalizing payloads and
//! failures to TruthGate-friendly shapes.
//!
//! Upper layers never see a raw transport error: every call resolves to
//! [NodeError::NotFound], [NodeError::Transient] or [NodeError::Protocol].

#[macro_use]
extern crate tracing;

mod cid_format;
mod client;
mod error;
mod probe;

pub use cid_format::{format_cid, v0_and_v1, CidBase, CidVersion};
pub use client::{KeyInfo, NodeClient, TgpPointer};
pub use error::{NodeError, NodeResult};
pub use probe::ProbeClient;
