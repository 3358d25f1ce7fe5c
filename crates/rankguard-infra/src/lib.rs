//! Infrastructure layer for rankguard.
//!
//! Contains implementations of the ports defined in `rankguard-core`:
//! memory, YAML and JSON storage backends, an in-process broadcast notifier,
//! a tokio-based repeating task scheduler, and the `config.toml` loader.

pub mod config;
pub mod notifier;
pub mod scheduler;
pub mod storage;
