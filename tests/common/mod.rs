//! Common test utilities for integration tests.

pub mod cluster_sim;
pub mod fixtures;

pub use cluster_sim::*;
pub use fixtures::*;

use groupkeeper::types::{MemberRole, MemberState};

/// Peer entry shorthand for [`SimDb::set_view`].
pub fn peer(address: &str, state: MemberState, role: MemberRole) -> (&str, MemberState, MemberRole) {
    (address, state, role)
}

/// Install a tracing subscriber once, honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
