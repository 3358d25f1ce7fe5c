//! Permission registry, inheritance resolution and evaluation for rankguard.
//!
//! This crate defines the "ports" (backend, notifier and platform traits)
//! that the infrastructure layer implements, and the in-memory engine built
//! on top of them. It depends only on `rankguard-types` -- never on
//! `rankguard-infra` or any storage crate.

pub mod checker;
pub mod cleanup;
pub mod evaluator;
pub mod manager;
pub mod matcher;
pub mod notify;
pub mod platform;
pub mod registry;
pub mod repository;
pub mod resolver;
pub mod system;

#[cfg(test)]
pub(crate) mod testing;

pub use checker::PermissionsChecker;
pub use manager::PermissionsManager;
pub use system::PermsSystem;
