//! Nimbus Common - Shared types and utilities
//!
//! This crate provides the data model, error definitions, digests and
//! configuration types used across all Nimbus components.

pub mod config;
pub mod digest;
pub mod error;
pub mod types;

pub use config::Config;
pub use digest::Digest;
pub use error::{BackendError, Error, MetaError, Result};
pub use types::*;
