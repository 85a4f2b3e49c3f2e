//! dh-core: Core abstractions and configuration for Dockhand
//!
//! This crate provides the shared domain types, error taxonomy,
//! configuration structures, transport traits, and command-output parsers
//! used by the fleet orchestration crate.

pub mod config;
pub mod error;
pub mod events;
pub mod output;
pub mod traits;
pub mod types;

pub use error::DhError;
pub use types::{NodeId, NodeIdentity};
