//! Log wrangling shared by the TruthGate binaries.
//! NOTE: [initialize_tracing] should only ever be called in tests or
//! binaries; library crates only instrument.

use std::sync::Once;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

static INITIALIZE: Once = Once::new();

const DEFAULT_DIRECTIVES: &str =
    "truthgate_core=info,truthgate_ipfs=info,truthgate_gateway=info,tower_http=info";

/// Initialize the global tracing subscriber, honoring `RUST_LOG` when set.
/// Safe to call more than once.
pub fn initialize_tracing() {
    INITIALIZE.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
