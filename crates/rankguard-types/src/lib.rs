//! Shared domain types for rankguard.
//!
//! This crate contains the domain types used across the workspace: groups,
//! users and their keys, scoped attributes, evaluation context, network
//! events, configuration and the error enums.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod group;
pub mod scope;
pub mod user;
