//! Tracing initialization.
//!
//! Centralizes tracing config so both binaries behave the same.

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing subscriber.
///
/// - Respects `RUST_LOG` via `EnvFilter`; defaults to `info`.
/// - Targets are omitted to keep the 1 ms run-loop logs readable.
pub fn init_tracing() -> Result<()> {
    // ---
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    Ok(())
}
