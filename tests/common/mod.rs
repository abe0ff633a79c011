// SPDX-License-Identifier: Apache-2.0

//! Common test utilities.

use tracing_subscriber::EnvFilter;

/// Initialize tracing once per test binary; honors `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
