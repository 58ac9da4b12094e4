//! Observability utilities (tracing).

mod tracing;

pub use tracing::init_tracing;
