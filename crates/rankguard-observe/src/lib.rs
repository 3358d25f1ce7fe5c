//! Observability setup for processes hosting rankguard.

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, init_tracing};
