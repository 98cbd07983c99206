//! The TruthGate edge gateway: one TLS listener multiplexing a mapped
//! domain gateway, an authenticated node API proxy and a publish
//! pipeline, all fronting a local content-addressed node.

#[macro_use]
extern crate tracing;

pub mod acme;
pub mod cache;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod host;
pub mod ipns;
pub mod limiter;
pub mod metrics;
pub mod proxy;
pub mod publish;
pub mod server;
pub mod worker_queue;

pub use error::GateError;
pub use server::{build_router, build_state, run, AppState};
